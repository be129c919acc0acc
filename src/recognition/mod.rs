//! Recognition Module
//!
//! Runs several text-recognition engines against several preprocessing
//! variants of the same scan.
//!
//! Supports multiple backends:
//! - Tesseract (local, requires installation, feature `ocr-tesseract`)
//! - Ollama vision models (local LLM)
//! - OpenAI-compatible vision models (cloud)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docensemble::recognition::{ImagePreprocessor, Orchestrator, PreprocessingVariant};
//!
//! let orchestrator = Orchestrator::new(Arc::new(ImagePreprocessor::default()), 0);
//! let results = orchestrator
//!     .run(&image, &providers, &PreprocessingVariant::ALL, deadline, &cancel)
//!     .await?;
//! ```

mod orchestrator;
mod preprocess;
mod provider;
pub mod quality;
mod types;

pub use orchestrator::Orchestrator;
pub use preprocess::{ImagePreprocessor, PreprocessingVariant, Preprocessor};
pub use provider::{OllamaProvider, OpenAiVisionProvider, RecognitionProvider};
pub use types::{
    ProviderId, ProviderKind, QualityMetrics, RecognitionError, RecognitionOutput, RecognitionResult,
};

#[cfg(feature = "ocr-tesseract")]
pub use provider::TesseractProvider;

#[cfg(test)]
pub(crate) use provider::mock;
