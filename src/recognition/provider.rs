//! Recognition Providers
//!
//! Defines the provider trait and the built-in engines. Providers receive an
//! already preprocessed image; the variant is passed along for logging and
//! for providers that want to adapt their settings to it.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;

use crate::routing::client::{send_chat, ChatMessage, ChatRequest, ContentPart};

use super::preprocess::PreprocessingVariant;
use super::types::{ProviderId, ProviderKind, RecognitionError, RecognitionOutput};

/// Text recognition engine
#[async_trait]
pub trait RecognitionProvider: Send + Sync {
    /// Unique id of this provider instance
    fn id(&self) -> ProviderId;

    /// Engine family, used for reliability weighting
    fn kind(&self) -> ProviderKind;

    /// Check if the provider is reachable
    async fn is_available(&self) -> bool;

    /// Recognize text in an encoded image
    async fn recognize(
        &self,
        image: &[u8],
        variant: PreprocessingVariant,
    ) -> Result<RecognitionOutput, RecognitionError>;
}

const TRANSCRIBE_PROMPT: &str =
    "Extract all text from this document image exactly as written, preserving line breaks. Return only the extracted text, nothing else.";

fn language_hint(language: &str) -> String {
    if language.is_empty() {
        String::new()
    } else {
        format!(" The document is most likely written in '{}'.", language)
    }
}

// ============================================================================
// Tesseract
// ============================================================================

/// Tesseract OCR provider (shells out to the `tesseract` binary)
#[cfg(feature = "ocr-tesseract")]
pub struct TesseractProvider {
    /// Tesseract language pack list, e.g. `ces+eng`
    language: String,
}

#[cfg(feature = "ocr-tesseract")]
impl TesseractProvider {
    pub fn new(language: &str) -> Self {
        Self {
            language: language.to_string(),
        }
    }
}

#[cfg(feature = "ocr-tesseract")]
#[async_trait]
impl RecognitionProvider for TesseractProvider {
    fn id(&self) -> ProviderId {
        ProviderId::new("tesseract")
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Tesseract
    }

    async fn is_available(&self) -> bool {
        tokio::process::Command::new("tesseract")
            .arg("--version")
            .output()
            .await
            .is_ok_and(|o| o.status.success())
    }

    async fn recognize(
        &self,
        image: &[u8],
        variant: PreprocessingVariant,
    ) -> Result<RecognitionOutput, RecognitionError> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        // binarized variants read best as one uniform block of text
        let psm = match variant {
            PreprocessingVariant::Binarize | PreprocessingVariant::Aggressive => "6",
            _ => "3",
        };

        let mut child = tokio::process::Command::new("tesseract")
            .args(["stdin", "stdout", "-l", self.language.as_str(), "--oem", "3", "--psm", psm, "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RecognitionError::ProviderNotAvailable(format!("Failed to run tesseract: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(image)
                .await
                .map_err(|e| RecognitionError::ProcessingError(format!("Failed to pipe image: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RecognitionError::ProcessingError(format!("Tesseract failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RecognitionError::ProcessingError(format!("Tesseract failed: {}", stderr.trim())));
        }

        let (text, confidence) = parse_tsv(&String::from_utf8_lossy(&output.stdout));
        if text.is_empty() {
            return Err(RecognitionError::EmptyText);
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("language".to_string(), self.language.clone());
        metadata.insert("psm".to_string(), psm.to_string());

        Ok(RecognitionOutput {
            text,
            confidence,
            metadata,
        })
    }
}

/// Rebuild text and mean word confidence from Tesseract TSV output.
///
/// Columns: level, page, block, par, line, word, left, top, width, height,
/// conf, text. Non-word rows carry `conf = -1`.
#[cfg_attr(not(feature = "ocr-tesseract"), allow(dead_code))]
fn parse_tsv(tsv: &str) -> (String, f64) {
    let mut lines: Vec<String> = Vec::new();
    let mut current_line: Option<(u32, u32, u32)> = None;
    let mut conf_sum = 0.0;
    let mut conf_count = 0usize;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let word = cols[11].trim();
        let conf: f64 = cols[10].parse().unwrap_or(-1.0);
        if word.is_empty() || conf < 0.0 {
            continue;
        }

        let key = (
            cols[2].parse().unwrap_or(0),
            cols[3].parse().unwrap_or(0),
            cols[4].parse().unwrap_or(0),
        );
        match lines.last_mut() {
            Some(line) if current_line == Some(key) => {
                line.push(' ');
                line.push_str(word);
            }
            _ => lines.push(word.to_string()),
        }
        current_line = Some(key);

        conf_sum += conf;
        conf_count += 1;
    }

    #[allow(clippy::cast_precision_loss)]
    let confidence = if conf_count == 0 {
        0.0
    } else {
        (conf_sum / conf_count as f64 / 100.0).clamp(0.0, 1.0)
    };

    (lines.join("\n"), confidence)
}

// ============================================================================
// Ollama
// ============================================================================

/// Ollama vision model provider
pub struct OllamaProvider {
    /// Ollama API URL
    base_url: String,
    /// Model name (e.g., "llava", "llama3.2-vision")
    model: String,
    /// Expected document language
    language: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    /// Vision LLMs report no confidence of their own
    const CONFIDENCE: f64 = 0.75;

    pub fn new(base_url: &str, model: &str, language: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            language: language.to_string(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl RecognitionProvider for OllamaProvider {
    fn id(&self) -> ProviderId {
        ProviderId::new(format!("ollama:{}", self.model))
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn recognize(
        &self,
        image: &[u8],
        _variant: PreprocessingVariant,
    ) -> Result<RecognitionOutput, RecognitionError> {
        let url = format!("{}/api/generate", self.base_url);
        let image_base64 = base64::engine::general_purpose::STANDARD.encode(image);

        let request = serde_json::json!({
            "model": self.model,
            "prompt": format!("{}{}", TRANSCRIBE_PROMPT, language_hint(&self.language)),
            "images": [image_base64],
            "stream": false,
            "options": { "temperature": 0 }
        });

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RecognitionError::ApiError(format!("Failed to call Ollama: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RecognitionError::ApiError(format!("Ollama returned {}: {}", status, body)));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RecognitionError::ApiError(format!("Failed to parse response: {}", e)))?;

        let text = result["response"].as_str().unwrap_or("").trim().to_string();
        if text.is_empty() {
            return Err(RecognitionError::EmptyText);
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("model".to_string(), self.model.clone());
        if let Some(ns) = result["total_duration"].as_u64() {
            metadata.insert("total_duration_ns".to_string(), ns.to_string());
        }

        Ok(RecognitionOutput {
            text,
            confidence: Self::CONFIDENCE,
            metadata,
        })
    }
}

// ============================================================================
// OpenAI-compatible vision
// ============================================================================

/// Vision-capable chat model behind an OpenAI-compatible API
pub struct OpenAiVisionProvider {
    base_url: String,
    api_key: Option<String>,
    model: String,
    language: String,
    client: reqwest::Client,
}

impl OpenAiVisionProvider {
    const CONFIDENCE: f64 = 0.85;

    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: &str,
        language: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            language: language.to_string(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl RecognitionProvider for OpenAiVisionProvider {
    fn id(&self) -> ProviderId {
        ProviderId::new(format!("openai:{}", self.model))
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiVision
    }

    async fn is_available(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn recognize(
        &self,
        image: &[u8],
        _variant: PreprocessingVariant,
    ) -> Result<RecognitionOutput, RecognitionError> {
        let mime = match image::guess_format(image) {
            Ok(image::ImageFormat::Jpeg) => "image/jpeg",
            Ok(image::ImageFormat::WebP) => "image/webp",
            _ => "image/png",
        };
        let data_uri = format!(
            "data:{};base64,{}",
            mime,
            base64::engine::general_purpose::STANDARD.encode(image)
        );

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: vec![
                    ContentPart::text(format!("{}{}", TRANSCRIBE_PROMPT, language_hint(&self.language))),
                    ContentPart::image(data_uri),
                ],
            }],
            max_tokens: 4096,
            temperature: 0.0,
            response_format: None,
        };

        let response = send_chat(&self.client, &self.base_url, self.api_key.as_deref(), &request)
            .await
            .map_err(|e| RecognitionError::ApiError(e.to_string()))?;

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "model".to_string(),
            response.model.clone().unwrap_or_else(|| self.model.clone()),
        );
        if let Some(usage) = &response.usage {
            metadata.insert("input_tokens".to_string(), usage.prompt_tokens.to_string());
            metadata.insert("output_tokens".to_string(), usage.completion_tokens.to_string());
        }

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(RecognitionError::EmptyText);
        }

        Ok(RecognitionOutput {
            text,
            confidence: Self::CONFIDENCE,
            metadata,
        })
    }
}

// ============================================================================
// Test Support
// ============================================================================

/// Scripted provider for tests
#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    pub struct MockProvider {
        pub id: String,
        pub kind: ProviderKind,
        pub text: String,
        pub confidence: f64,
        pub available: bool,
        pub fail_with: Option<String>,
        pub delay: Duration,
        pub calls: AtomicUsize,
    }

    impl MockProvider {
        pub fn new(id: &str, kind: ProviderKind, text: &str, confidence: f64) -> Self {
            Self {
                id: id.to_string(),
                kind,
                text: text.to_string(),
                confidence,
                available: true,
                fail_with: None,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing(id: &str, message: &str) -> Self {
            let mut provider = Self::new(id, ProviderKind::Custom, "", 0.0);
            provider.fail_with = Some(message.to_string());
            provider
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn unavailable(mut self) -> Self {
            self.available = false;
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RecognitionProvider for MockProvider {
        fn id(&self) -> ProviderId {
            ProviderId::new(self.id.clone())
        }

        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        async fn recognize(
            &self,
            _image: &[u8],
            _variant: PreprocessingVariant,
        ) -> Result<RecognitionOutput, RecognitionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(message) = &self.fail_with {
                return Err(RecognitionError::ProcessingError(message.clone()));
            }
            Ok(RecognitionOutput {
                text: self.text.clone(),
                confidence: self.confidence,
                metadata: BTreeMap::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tsv_groups_lines() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t\n\
5\t1\t1\t1\t1\t1\t0\t0\t10\t10\t96.5\tINVOICE\n\
5\t1\t1\t1\t1\t2\t0\t0\t10\t10\t90\t2024-001\n\
5\t1\t1\t1\t2\t1\t0\t0\t10\t10\t80\tTotal\n\
5\t1\t1\t1\t2\t2\t0\t0\t10\t10\t-1\t \n";
        let (text, confidence) = parse_tsv(tsv);
        assert_eq!(text, "INVOICE 2024-001\nTotal");
        assert!((confidence - (96.5 + 90.0 + 80.0) / 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tsv_empty() {
        assert_eq!(parse_tsv(""), (String::new(), 0.0));
    }

    #[tokio::test]
    async fn test_openai_vision_requires_key() {
        let provider = OpenAiVisionProvider::new(
            "https://api.openai.com/v1",
            None,
            "gpt-4o",
            "cs",
            Duration::from_secs(5),
        );
        assert!(!provider.is_available().await);
        assert_eq!(provider.id().as_str(), "openai:gpt-4o");
        assert!(provider.kind().is_cloud());
    }

    #[tokio::test]
    async fn test_mock_provider_counts_calls() {
        let provider = mock::MockProvider::new("m", ProviderKind::Custom, "hello", 0.5);
        let out = provider
            .recognize(b"img", PreprocessingVariant::Original)
            .await
            .unwrap();
        assert_eq!(out.text, "hello");
        assert_eq!(provider.call_count(), 1);
    }
}
