//! Docensemble Library
//!
//! Ensemble extraction core for scanned business documents: several
//! recognition engines read the same scan, the most trustworthy reading is
//! selected (or fused), and a cost-aware model router turns it into
//! validated structured fields.
//!
//! # Modules
//!
//! - `recognition`: providers, preprocessing variants and the fan-out orchestrator
//! - `ensemble`: decision engine, fusion engine and reliability snapshots
//! - `routing`: tier catalog, complexity, completion clients, validation, router
//! - `cache`: extraction cache keyed by normalized text
//! - `pipeline`: end-to-end `process_document`

pub mod cache;
pub mod cancel;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod fields;
pub mod pipeline;
pub mod recognition;
pub mod routing;
pub mod text;

pub use cancel::CancellationToken;
pub use config::{Config, ConfigError};
pub use error::{PipelineError, Result, ValidationWarning};
pub use fields::{DocumentType, StructuredFields};
pub use pipeline::{Pipeline, ProcessOptions, Provenance};
pub use routing::ExtractionResult;
