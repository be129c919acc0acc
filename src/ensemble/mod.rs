//! Ensemble Module
//!
//! Decides between recognition results and, when it pays off, fuses them.
//!
//! 1. **Decision**: six-criteria weighted score per result, cross-validation
//!    between results, per-field majority vote and outlier detection.
//! 2. **Fusion**: text merge strategies, field voting and confidence fusion;
//!    the fused result is kept only when it beats the selection by a margin.
//! 3. **Reliability**: per-provider weights with bounded learned adjustment,
//!    published as immutable snapshots.

mod decision;
mod fusion;
mod reliability;

pub use decision::{
    field_completeness, value_agreement, ConsensusAnalysis, CrossValidation, DecisionEngine, EnsembleDecision,
    FieldConsensus, PairwiseAgreement, ResultScore, ScoreBreakdown, ScoringWeights,
};
pub use fusion::{FusionConfig, FusionEngine, TextStrategy, FUSION_PROVIDER_ID};
pub use reliability::{default_weight, ReliabilityRegistry, ReliabilityTable, EMA_ALPHA, MAX_DRIFT};

#[cfg(test)]
pub(crate) use decision::test_support;
