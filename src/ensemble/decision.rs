//! Ensemble decision engine
//!
//! Scores every recognition result on six weighted criteria and selects the
//! best one. Alongside the selection it reports pairwise cross-validation,
//! per-field consensus and outliers. Pure and deterministic: the same input
//! always yields the same decision.

#![allow(clippy::cast_precision_loss)]

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::fields::{FieldKey, FieldValue, StructuredFields, KNOWN_CURRENCIES};
use crate::recognition::{quality, RecognitionResult};
use crate::routing::validation::normalize_date;
use crate::text::text_similarity;

use super::reliability::ReliabilityTable;

/// Relative difference under which two amounts agree fully
pub const FULL_AGREEMENT_TOLERANCE: f64 = 0.05;
/// Relative difference under which two amounts earn partial credit
pub const PARTIAL_AGREEMENT_TOLERANCE: f64 = 0.10;
/// Average similarity below which a result is reported as an outlier
pub const OUTLIER_THRESHOLD: f64 = 0.3;

/// Cross-validation mix of text similarity and field agreement
const CROSS_TEXT_SHARE: f64 = 0.6;
/// Cross-validation score when nothing can be compared
const NEUTRAL_SCORE: f64 = 0.5;

// ============================================================================
// Configuration
// ============================================================================

/// Weights of the six scoring criteria; must sum to 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoringWeights {
    pub confidence: f64,
    pub text_quality: f64,
    pub field_completeness: f64,
    pub provider_reliability: f64,
    pub cross_validation: f64,
    pub language_consistency: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            confidence: 0.25,
            text_quality: 0.20,
            field_completeness: 0.20,
            provider_reliability: 0.15,
            cross_validation: 0.15,
            language_consistency: 0.05,
        }
    }
}

impl ScoringWeights {
    fn values(&self) -> [f64; 6] {
        [
            self.confidence,
            self.text_quality,
            self.field_completeness,
            self.provider_reliability,
            self.cross_validation,
            self.language_consistency,
        ]
    }

    /// Reject negative weights and weights that do not sum to 1.0
    pub fn validate(&self) -> Result<()> {
        let values = self.values();
        if values.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(PipelineError::InvalidConfig(
                "scoring weights must be non-negative".to_string(),
            ));
        }
        let sum: f64 = values.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(PipelineError::InvalidConfig(format!(
                "scoring weights must sum to 1.0, got {:.4}",
                sum
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Decision Types
// ============================================================================

/// Per-criterion scores of one result, each in [0, 1]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub confidence: f64,
    pub text_quality: f64,
    pub field_completeness: f64,
    pub provider_reliability: f64,
    pub cross_validation: f64,
    pub language_consistency: f64,
}

impl ScoreBreakdown {
    fn weighted(&self, weights: &ScoringWeights) -> f64 {
        weights.confidence * self.confidence
            + weights.text_quality * self.text_quality
            + weights.field_completeness * self.field_completeness
            + weights.provider_reliability * self.provider_reliability
            + weights.cross_validation * self.cross_validation
            + weights.language_consistency * self.language_consistency
    }
}

/// Score of one candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultScore {
    /// Index into the input slice
    pub index: usize,
    /// `provider/variant`
    pub label: String,
    pub success: bool,
    pub total: f64,
    pub breakdown: ScoreBreakdown,
}

/// Agreement between two results
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairwiseAgreement {
    pub first: usize,
    pub second: usize,
    pub text_similarity: f64,
    /// Mean over the fields both results carry; `None` when they share none
    pub field_agreement: Option<f64>,
    /// Per-field credit (1.0 agree, 0.5 partial, 0.0 disagree)
    pub fields: BTreeMap<FieldKey, f64>,
}

/// Cross-validation report over all successful results
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossValidation {
    pub pairs: Vec<PairwiseAgreement>,
    pub average_text_similarity: f64,
    pub average_field_agreement: Option<f64>,
}

impl CrossValidation {
    pub fn pair(&self, a: usize, b: usize) -> Option<&PairwiseAgreement> {
        self.pairs
            .iter()
            .find(|p| (p.first == a && p.second == b) || (p.first == b && p.second == a))
    }
}

/// Majority value of one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConsensus {
    pub field: FieldKey,
    pub value: FieldValue,
    pub votes: usize,
    /// Results that reported any value for the field
    pub voters: usize,
    pub ratio: f64,
}

/// Field-level majority vote and outlier report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusAnalysis {
    pub fields: Vec<FieldConsensus>,
    /// Indices of results dissimilar to all others
    pub outliers: Vec<usize>,
    /// Mean vote ratio across fields (1.0 when there are no fields)
    pub agreement_ratio: f64,
}

impl ConsensusAnalysis {
    pub fn field(&self, key: FieldKey) -> Option<&FieldConsensus> {
        self.fields.iter().find(|f| f.field == key)
    }
}

/// Outcome of the decision engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsembleDecision {
    pub selected_result: RecognitionResult,
    pub selected_index: usize,
    pub score: f64,
    pub score_breakdown: ScoreBreakdown,
    pub all_scores: Vec<ResultScore>,
    pub cross_validation: Option<CrossValidation>,
    pub consensus_analysis: ConsensusAnalysis,
}

// ============================================================================
// Engine
// ============================================================================

/// Multi-criteria result selection
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    weights: ScoringWeights,
    reliability: Arc<ReliabilityTable>,
}

impl DecisionEngine {
    pub fn new(weights: ScoringWeights, reliability: Arc<ReliabilityTable>) -> Result<Self> {
        weights.validate()?;
        Ok(Self { weights, reliability })
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Select the most trustworthy result
    pub fn select(&self, results: &[RecognitionResult]) -> Result<EnsembleDecision> {
        match results {
            [] => Err(PipelineError::NoResults),
            [only] => Ok(self.trivial(only)),
            _ => Ok(self.rank(results)),
        }
    }

    fn trivial(&self, only: &RecognitionResult) -> EnsembleDecision {
        let breakdown = self.breakdown(only, NEUTRAL_SCORE);
        let score = only.confidence;
        EnsembleDecision {
            selected_result: only.clone(),
            selected_index: 0,
            score,
            all_scores: vec![ResultScore {
                index: 0,
                label: only.label(),
                success: only.success,
                total: score,
                breakdown: breakdown.clone(),
            }],
            score_breakdown: breakdown,
            cross_validation: None,
            consensus_analysis: consensus(std::slice::from_ref(only), &[0], &[]),
        }
    }

    fn rank(&self, results: &[RecognitionResult]) -> EnsembleDecision {
        let successful: Vec<usize> = (0..results.len()).filter(|i| results[*i].success).collect();
        // failures compete only when nothing succeeded
        let pool: Vec<usize> = if successful.is_empty() {
            (0..results.len()).collect()
        } else {
            successful.clone()
        };

        let cross_validation = cross_validate(results, &successful);
        let cross_scores = cross_scores(results.len(), &successful, &cross_validation);

        let mut all_scores: Vec<ResultScore> = results
            .iter()
            .enumerate()
            .map(|(i, result)| {
                let breakdown = self.breakdown(result, cross_scores[i]);
                ResultScore {
                    index: i,
                    label: result.label(),
                    success: result.success,
                    total: breakdown.weighted(&self.weights),
                    breakdown,
                }
            })
            .collect();

        let best = pool
            .iter()
            .copied()
            .max_by(|a, b| self.compare(results, &all_scores, *a, *b))
            .unwrap_or(0);

        let consensus_analysis = consensus(results, &successful, &cross_validation.pairs);

        tracing::debug!(
            candidates = results.len(),
            successful = successful.len(),
            selected = %results[best].label(),
            score = all_scores[best].total,
            outliers = consensus_analysis.outliers.len(),
            "Ensemble decision made"
        );

        let selected = all_scores[best].clone();
        // report order only; selection is already made
        all_scores.sort_by(|a, b| {
            b.total
                .total_cmp(&a.total)
                .then_with(|| a.index.cmp(&b.index))
        });

        EnsembleDecision {
            selected_result: results[best].clone(),
            selected_index: best,
            score: selected.total,
            score_breakdown: selected.breakdown,
            all_scores,
            cross_validation: (successful.len() >= 2).then_some(cross_validation),
            consensus_analysis,
        }
    }

    /// Ordering used by `max_by`: greater is better
    fn compare(&self, results: &[RecognitionResult], scores: &[ResultScore], a: usize, b: usize) -> Ordering {
        let (ra, rb) = (&results[a], &results[b]);
        scores[a]
            .total
            .total_cmp(&scores[b].total)
            .then_with(|| ra.confidence.total_cmp(&rb.confidence))
            .then_with(|| {
                scores[a]
                    .breakdown
                    .provider_reliability
                    .total_cmp(&scores[b].breakdown.provider_reliability)
            })
            // earlier index wins the final tie
            .then_with(|| b.cmp(&a))
    }

    fn breakdown(&self, result: &RecognitionResult, cross_validation: f64) -> ScoreBreakdown {
        let provider_reliability = self.reliability.weight(&result.provider_id, result.provider_kind);
        // a failed result keeps only its provider's reputation
        if !result.success {
            return ScoreBreakdown {
                provider_reliability,
                ..ScoreBreakdown::default()
            };
        }

        ScoreBreakdown {
            confidence: result.confidence.clamp(0.0, 1.0),
            text_quality: quality::text_quality_score(&result.text, &result.quality_metrics),
            field_completeness: field_completeness(&result.structured_fields),
            provider_reliability,
            cross_validation,
            language_consistency: result.quality_metrics.language_consistency.clamp(0.0, 1.0),
        }
    }
}

// ============================================================================
// Criteria
// ============================================================================

/// Weighted presence of the key fields, normalized to [0, 1]
pub fn field_completeness(fields: &StructuredFields) -> f64 {
    const VENDOR: f64 = 0.25;
    const AMOUNT: f64 = 0.30;
    const CURRENCY: f64 = 0.10;
    const DATE: f64 = 0.20;
    const INVOICE_NUMBER: f64 = 0.15;
    const DOCUMENT_TYPE: f64 = 0.10;
    const TOTAL: f64 = VENDOR + AMOUNT + CURRENCY + DATE + INVOICE_NUMBER + DOCUMENT_TYPE;

    let mut score = 0.0;
    if fields.vendor_name().is_some_and(|n| !n.trim().is_empty()) {
        score += VENDOR;
    }
    if fields.amount().is_some_and(|a| a > 0.0) {
        score += AMOUNT;
    }
    if fields
        .currency
        .as_deref()
        .is_some_and(|c| KNOWN_CURRENCIES.contains(&c.trim().to_uppercase().as_str()))
    {
        score += CURRENCY;
    }
    if fields.date.as_deref().and_then(normalize_date).is_some() {
        score += DATE;
    }
    if fields
        .invoice_number
        .as_deref()
        .is_some_and(|n| n.trim().chars().count() >= 3)
    {
        score += INVOICE_NUMBER;
    }
    if fields.document_type.is_some() {
        score += DOCUMENT_TYPE;
    }

    // weights sum to 1.10
    (score / TOTAL).clamp(0.0, 1.0)
}

/// Credit for two values of the same field
pub fn value_agreement(a: &FieldValue, b: &FieldValue) -> f64 {
    match (a.as_amount(), b.as_amount()) {
        (Some(x), Some(y)) => {
            // relative to the larger magnitude, so the check is symmetric
            let scale = x.abs().max(y.abs());
            if scale == 0.0 {
                return 1.0;
            }
            let diff = (x - y).abs() / scale;
            if diff < FULL_AGREEMENT_TOLERANCE {
                1.0
            } else if diff < PARTIAL_AGREEMENT_TOLERANCE {
                0.5
            } else {
                0.0
            }
        }
        _ => {
            if a.vote_key() == b.vote_key() {
                1.0
            } else {
                0.0
            }
        }
    }
}

fn field_agreement(a: &StructuredFields, b: &StructuredFields) -> BTreeMap<FieldKey, f64> {
    FieldKey::ALL
        .iter()
        .filter_map(|key| match (a.get(*key), b.get(*key)) {
            (Some(x), Some(y)) => Some((*key, value_agreement(&x, &y))),
            _ => None,
        })
        .collect()
}

fn cross_validate(results: &[RecognitionResult], successful: &[usize]) -> CrossValidation {
    let mut pairs = Vec::new();
    for (n, &i) in successful.iter().enumerate() {
        for &j in &successful[n + 1..] {
            let fields = field_agreement(&results[i].structured_fields, &results[j].structured_fields);
            let field_score = if fields.is_empty() {
                None
            } else {
                Some(fields.values().sum::<f64>() / fields.len() as f64)
            };
            pairs.push(PairwiseAgreement {
                first: i,
                second: j,
                text_similarity: text_similarity(&results[i].text, &results[j].text),
                field_agreement: field_score,
                fields,
            });
        }
    }

    let average_text_similarity = if pairs.is_empty() {
        0.0
    } else {
        pairs.iter().map(|p| p.text_similarity).sum::<f64>() / pairs.len() as f64
    };
    let field_scores: Vec<f64> = pairs.iter().filter_map(|p| p.field_agreement).collect();
    let average_field_agreement =
        (!field_scores.is_empty()).then(|| field_scores.iter().sum::<f64>() / field_scores.len() as f64);

    CrossValidation {
        pairs,
        average_text_similarity,
        average_field_agreement,
    }
}

/// Cross-validation criterion per result index
fn cross_scores(len: usize, successful: &[usize], cv: &CrossValidation) -> Vec<f64> {
    let mut scores = vec![0.0; len];
    for &i in successful {
        let mine: Vec<&PairwiseAgreement> = cv
            .pairs
            .iter()
            .filter(|p| p.first == i || p.second == i)
            .collect();
        // nothing to compare against
        if mine.is_empty() {
            scores[i] = NEUTRAL_SCORE;
            continue;
        }

        let text = mine.iter().map(|p| p.text_similarity).sum::<f64>() / mine.len() as f64;
        let field_scores: Vec<f64> = mine.iter().filter_map(|p| p.field_agreement).collect();
        // without comparable fields the text carries the whole score
        let fields = if field_scores.is_empty() {
            text
        } else {
            field_scores.iter().sum::<f64>() / field_scores.len() as f64
        };
        scores[i] = (CROSS_TEXT_SHARE * text + (1.0 - CROSS_TEXT_SHARE) * fields).clamp(0.0, 1.0);
    }
    scores
}

/// Majority vote per field across the successful results, plus outliers
fn consensus(results: &[RecognitionResult], successful: &[usize], pairs: &[PairwiseAgreement]) -> ConsensusAnalysis {
    let mut fields = Vec::new();

    for key in FieldKey::ALL {
        // vote key -> (votes, summed confidence, representative value)
        let mut groups: BTreeMap<String, (usize, f64, FieldValue)> = BTreeMap::new();
        let mut voters = 0;
        for &i in successful {
            if let Some(value) = results[i].structured_fields.get(key) {
                voters += 1;
                let entry = groups
                    .entry(value.vote_key())
                    .or_insert_with(|| (0, 0.0, value.clone()));
                entry.0 += 1;
                entry.1 += results[i].confidence;
            }
        }

        // most votes, then most confidence, then the smallest key
        let winner = groups.into_values().max_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.total_cmp(&b.1))
                .then_with(|| b.2.vote_key().cmp(&a.2.vote_key()))
        });
        if let Some((votes, _, value)) = winner {
            fields.push(FieldConsensus {
                field: key,
                value,
                votes,
                voters,
                ratio: votes as f64 / voters as f64,
            });
        }
    }

    let outliers = if successful.len() < 2 {
        Vec::new()
    } else {
        successful
            .iter()
            .copied()
            .filter(|&i| {
                let sims: Vec<f64> = pairs
                    .iter()
                    .filter(|p| p.first == i || p.second == i)
                    .map(|p| p.text_similarity)
                    .collect();
                !sims.is_empty() && sims.iter().sum::<f64>() / (sims.len() as f64) < OUTLIER_THRESHOLD
            })
            .collect()
    };

    let agreement_ratio = if fields.is_empty() {
        1.0
    } else {
        fields.iter().map(|f| f.ratio).sum::<f64>() / fields.len() as f64
    };

    ConsensusAnalysis {
        fields,
        outliers,
        agreement_ratio,
    }
}
