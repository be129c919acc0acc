//! Error types for the extraction pipeline
//!
//! Provider-level failures never surface here: the orchestrator turns them
//! into failed `RecognitionResult`s. Only the conditions below reach callers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline-wide result type
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors visible to the caller of the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No recognition provider is configured or reachable
    #[error("No recognition providers available")]
    NoProvidersAvailable,

    /// Every recognition task errored or timed out
    #[error("All recognition providers failed: {0}")]
    AllProvidersFailed(String),

    /// The decision engine was handed an empty result set
    #[error("No recognition results to decide between")]
    NoResults,

    /// Every tier in the fallback chain failed
    #[error("Model routing failed: {0}")]
    ModelRoutingFailed(String),

    /// The caller cancelled the pipeline
    #[error("Pipeline cancelled")]
    Cancelled,

    /// Configuration rejected at construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    /// Short machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoProvidersAvailable => "no_providers_available",
            Self::AllProvidersFailed(_) => "all_providers_failed",
            Self::NoResults => "no_results",
            Self::ModelRoutingFailed(_) => "model_routing_failed",
            Self::Cancelled => "cancelled",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}

/// Non-fatal validation finding, attached to results as a note
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{field}: {message}")]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}
