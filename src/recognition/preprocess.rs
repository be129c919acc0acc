//! Image Preprocessing
//!
//! Produces image variants before recognition. The transforms here are
//! deliberately plain `image` crate operations; anything more elaborate plugs
//! in through the [`Preprocessor`] trait.

use std::io::Cursor;

use image::{imageops, DynamicImage, GrayImage, Luma};
use serde::{Deserialize, Serialize};

use super::types::RecognitionError;

/// Largest skew corrected by the deskew variant, in degrees
const MAX_SKEW_DEGREES: f32 = 5.0;

/// Angle step of the skew search, in degrees
const SKEW_STEP_DEGREES: f32 = 0.5;

/// Longest side of the thumbnail used to estimate skew
const SKEW_SAMPLE_SIZE: u32 = 400;

/// Named image transformation applied before recognition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessingVariant {
    /// Unmodified input bytes
    Original,
    /// Light denoise and grayscale
    Gentle,
    /// Grayscale with contrast boost
    Contrast,
    /// Global-threshold black and white
    Binarize,
    /// Denoise, contrast boost and binarize
    Aggressive,
    /// Rotate text lines back to horizontal
    Deskew,
}

impl PreprocessingVariant {
    pub const ALL: [PreprocessingVariant; 6] = [
        Self::Original,
        Self::Gentle,
        Self::Contrast,
        Self::Binarize,
        Self::Aggressive,
        Self::Deskew,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Gentle => "gentle",
            Self::Contrast => "contrast",
            Self::Binarize => "binarize",
            Self::Aggressive => "aggressive",
            Self::Deskew => "deskew",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "original" | "none" => Some(Self::Original),
            "gentle" | "denoise" => Some(Self::Gentle),
            "contrast" => Some(Self::Contrast),
            "binarize" | "threshold" => Some(Self::Binarize),
            "aggressive" => Some(Self::Aggressive),
            "deskew" | "straighten" => Some(Self::Deskew),
            _ => None,
        }
    }
}

impl std::fmt::Display for PreprocessingVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produces a variant of an encoded image
pub trait Preprocessor: Send + Sync {
    fn apply(&self, image: &[u8], variant: PreprocessingVariant) -> Result<Vec<u8>, RecognitionError>;
}

/// Default preprocessor built on the `image` crate
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    /// Gaussian sigma used by the denoising step
    pub blur_sigma: f32,
    /// Contrast adjustment in percent
    pub contrast: f32,
    /// Luma threshold for binarization (0-255)
    pub threshold: u8,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self {
            blur_sigma: 0.6,
            contrast: 30.0,
            threshold: 140,
        }
    }
}

impl ImagePreprocessor {
    fn decode(image: &[u8]) -> Result<GrayImage, RecognitionError> {
        image::load_from_memory(image)
            .map(|img| img.to_luma8())
            .map_err(|e| RecognitionError::PreprocessingError(format!("Failed to decode image: {}", e)))
    }

    fn encode(image: GrayImage) -> Result<Vec<u8>, RecognitionError> {
        let mut buffer = Vec::new();
        DynamicImage::ImageLuma8(image)
            .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)
            .map_err(|e| RecognitionError::PreprocessingError(format!("Failed to encode image: {}", e)))?;
        Ok(buffer)
    }

    fn binarize(&self, image: &GrayImage) -> GrayImage {
        let threshold = self.threshold;
        GrayImage::from_fn(image.width(), image.height(), |x, y| {
            let Luma([v]) = *image.get_pixel(x, y);
            if v >= threshold {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }
}

impl ImagePreprocessor {
    /// Skew angle in degrees, found by maximizing the variance of the
    /// horizontal projection profile of dark pixels.
    ///
    /// Positive means lines descend to the right. Returns 0.0 for blank
    /// images or when no angle beats the unrotated profile.
    pub fn estimate_skew(&self, image: &GrayImage) -> f32 {
        let sample = if image.width().max(image.height()) > SKEW_SAMPLE_SIZE {
            imageops::thumbnail(image, SKEW_SAMPLE_SIZE, SKEW_SAMPLE_SIZE)
        } else {
            image.clone()
        };

        let dark: Vec<(f32, f32)> = sample
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[0] < self.threshold)
            .map(|(x, y, _)| (x as f32, y as f32))
            .collect();
        if dark.is_empty() {
            return 0.0;
        }

        let height = sample.height() as usize;
        let width = sample.width() as f32;
        let steps = (MAX_SKEW_DEGREES / SKEW_STEP_DEGREES) as i32;

        let mut best = (0.0_f32, profile_variance(&dark, 0.0, height, width));
        for step in -steps..=steps {
            if step == 0 {
                continue;
            }
            let angle = step as f32 * SKEW_STEP_DEGREES;
            let variance = profile_variance(&dark, angle, height, width);
            // strictly better, so ties keep the smaller correction
            if variance > best.1 * 1.0001 {
                best = (angle, variance);
            }
        }
        best.0
    }
}

/// Variance of row counts after undoing a skew of `angle` degrees
fn profile_variance(points: &[(f32, f32)], angle: f32, height: usize, width: f32) -> f64 {
    let slope = angle.to_radians().tan();
    // pad so sheared rows stay in range
    let pad = (width * slope.abs()).ceil() as usize + 1;
    let mut rows = vec![0u32; height + 2 * pad];
    for (x, y) in points {
        let row = (y - x * slope).round() as isize + pad as isize;
        if let Some(count) = usize::try_from(row).ok().and_then(|r| rows.get_mut(r)) {
            *count += 1;
        }
    }

    let n = rows.len() as f64;
    let mean = rows.iter().map(|c| f64::from(*c)).sum::<f64>() / n;
    rows.iter().map(|c| (f64::from(*c) - mean).powi(2)).sum::<f64>() / n
}

/// Rotate around the center by `degrees`, filling uncovered pixels white
fn rotate(image: &GrayImage, degrees: f32) -> GrayImage {
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = image.width() as f32 / 2.0;
    let cy = image.height() as f32 / 2.0;

    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        // inverse mapping, nearest neighbour
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let sx = (cos * dx + sin * dy + cx).round();
        let sy = (-sin * dx + cos * dy + cy).round();
        if sx >= 0.0 && sy >= 0.0 && (sx as u32) < image.width() && (sy as u32) < image.height() {
            *image.get_pixel(sx as u32, sy as u32)
        } else {
            Luma([255])
        }
    })
}

impl Preprocessor for ImagePreprocessor {
    fn apply(&self, image: &[u8], variant: PreprocessingVariant) -> Result<Vec<u8>, RecognitionError> {
        if variant == PreprocessingVariant::Original {
            return Ok(image.to_vec());
        }

        let gray = Self::decode(image)?;
        let processed = match variant {
            PreprocessingVariant::Original => gray,
            PreprocessingVariant::Gentle => imageops::blur(&gray, self.blur_sigma),
            PreprocessingVariant::Contrast => imageops::contrast(&gray, self.contrast),
            PreprocessingVariant::Binarize => self.binarize(&gray),
            PreprocessingVariant::Aggressive => {
                let denoised = imageops::blur(&gray, self.blur_sigma);
                let boosted = imageops::contrast(&denoised, self.contrast * 1.5);
                self.binarize(&boosted)
            }
            PreprocessingVariant::Deskew => {
                let angle = self.estimate_skew(&gray);
                if angle == 0.0 {
                    gray
                } else {
                    rotate(&gray, -angle)
                }
            }
        };

        Self::encode(processed)
    }
}
