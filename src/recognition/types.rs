//! Recognition Types
//!
//! Defines the results produced by recognition providers and the errors they
//! may raise before the orchestrator converts them into failed results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::fields::StructuredFields;

use super::preprocess::PreprocessingVariant;

/// Recognition provider kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Tesseract OCR (local)
    Tesseract,
    /// Ollama vision model (local LLM)
    Ollama,
    /// OpenAI-compatible vision API
    OpenAiVision,
    /// Any other injected provider
    Custom,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tesseract => "tesseract",
            Self::Ollama => "ollama",
            Self::OpenAiVision => "openai_vision",
            Self::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "tesseract" => Some(Self::Tesseract),
            "ollama" => Some(Self::Ollama),
            "openai" | "openai_vision" => Some(Self::OpenAiVision),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    /// Cloud services run on the provider's infrastructure
    pub fn is_cloud(&self) -> bool {
        matches!(self, Self::OpenAiVision)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one provider instance inside an ensemble
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId(pub String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Raw output of a single provider call
#[derive(Debug, Clone, Default)]
pub struct RecognitionOutput {
    /// Recognized text
    pub text: String,
    /// Provider-reported confidence (0-1)
    pub confidence: f64,
    /// Free-form provider details (model name, page count, ...)
    pub metadata: BTreeMap<String, String>,
}

/// Derived, read-only text quality attributes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    pub text_length: usize,
    pub word_count: usize,
    /// Share of words that look like real words (0-1)
    pub readable_word_ratio: f64,
    /// Share of non-alphanumeric, non-whitespace, non-common-punctuation chars (0-1)
    pub special_char_ratio: f64,
    /// Count of typical OCR garbage markers
    pub detected_error_count: usize,
    /// How consistently the text uses one script/language (0-1)
    pub language_consistency: f64,
}

/// Result of one {provider × variant} recognition task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionResult {
    pub provider_id: ProviderId,
    pub provider_kind: ProviderKind,
    pub text: String,
    /// Confidence in [0, 1]; always 0 for failed results
    pub confidence: f64,
    pub processing_time_ms: u64,
    pub preprocessing_variant: PreprocessingVariant,
    pub structured_fields: StructuredFields,
    pub quality_metrics: QualityMetrics,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_metadata: BTreeMap<String, String>,
}

impl RecognitionResult {
    /// Build a failed result carrying the error message
    pub fn failure(
        provider_id: ProviderId,
        provider_kind: ProviderKind,
        variant: PreprocessingVariant,
        processing_time_ms: u64,
        error: impl std::fmt::Display,
    ) -> Self {
        Self {
            provider_id,
            provider_kind,
            text: String::new(),
            confidence: 0.0,
            processing_time_ms,
            preprocessing_variant: variant,
            structured_fields: StructuredFields::default(),
            quality_metrics: QualityMetrics::default(),
            success: false,
            error_message: Some(error.to_string()),
            provider_metadata: BTreeMap::new(),
        }
    }

    /// Label used in logs and provenance: `provider/variant`
    pub fn label(&self) -> String {
        format!("{}/{}", self.provider_id, self.preprocessing_variant)
    }
}

/// Recognition error types
#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("Recognition provider not available: {0}")]
    ProviderNotAvailable(String),

    #[error("Preprocessing failed: {0}")]
    PreprocessingError(String),

    #[error("Recognition processing failed: {0}")]
    ProcessingError(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Provider returned no text")]
    EmptyText,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_has_zero_confidence() {
        let result = RecognitionResult::failure(
            "tesseract".into(),
            ProviderKind::Tesseract,
            PreprocessingVariant::Original,
            12,
            RecognitionError::EmptyText,
        );
        assert!(!result.success);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.error_message.as_deref(), Some("Provider returned no text"));
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!(ProviderKind::parse("OpenAI"), Some(ProviderKind::OpenAiVision));
        assert_eq!(ProviderKind::parse("nope"), None);
        assert!(ProviderKind::OpenAiVision.is_cloud());
        assert!(!ProviderKind::Tesseract.is_cloud());
    }
}
