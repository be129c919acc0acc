//! Routing Module
//!
//! Turns the chosen recognition text into validated structured fields.
//!
//! - [`tier`]: model tier catalog, fallback table and performance feedback
//! - [`complexity`]: simple / medium / complex assessment of a document
//! - [`client`]: completion clients, extraction prompt and response parsing
//! - [`patterns`]: regex extractor, also the last tier of every chain
//! - [`validation`]: checksum, format, arithmetic and cross-reference checks
//! - [`router`]: cache-aware tier selection and fallback walk

pub mod client;
pub mod complexity;
pub mod patterns;
pub mod router;
pub mod tier;
pub mod validation;

pub use client::{CompletionClient, Completion, ModelError, OpenAiCompatibleClient};
pub use complexity::{ComplexityAssessment, ComplexityBucket};
pub use router::{
    ExtractionOptions, ExtractionResult, ModelRouter, RouterConfig, SelectionWeights, TierAttempt, TierScore,
    DEFAULT_MODEL_TIMEOUT,
};
pub use tier::{ModelTier, TierCatalog, TierId};
pub use validation::{validate, ValidationReport};
