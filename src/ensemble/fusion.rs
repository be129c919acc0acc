//! Result fusion
//!
//! Builds a synthetic result from several recognition results: the text from
//! the best of three merge strategies, every field from a confidence-weighted
//! vote, and a confidence from the inputs plus an agreement bonus. The fused
//! result replaces the decision engine's pick only when it is clearly better.

#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::fields::{FieldKey, FieldValue, StructuredFields};
use crate::recognition::{quality, ProviderId, ProviderKind, RecognitionResult};
use crate::text::{domain_term_count, text_similarity, MAX_COMPARE_CHARS};

/// Provider id carried by fused results
pub const FUSION_PROVIDER_ID: &str = "ensemble-fusion";

/// Fusion thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FusionConfig {
    /// Results below this confidence do not take part
    pub min_confidence: f64,
    /// Required confidence gain over the selection
    pub confidence_margin: f64,
    /// Alternative requirement: text-quality gain over the selection
    pub quality_margin: f64,
    /// Largest bonus granted for agreement between inputs
    pub max_agreement_bonus: f64,
    pub confidence_cap: f64,
    /// Numeric values within this relative spread are averaged
    pub numeric_tolerance: f64,
    /// Texts at least this similar count as near-duplicates
    pub near_duplicate_similarity: f64,
    /// Shortest common run (chars) worth merging around
    pub min_common_run: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
            confidence_margin: 0.05,
            quality_margin: 0.10,
            max_agreement_bonus: 0.10,
            confidence_cap: 0.98,
            numeric_tolerance: 0.10,
            near_duplicate_similarity: 0.8,
            min_common_run: 20,
        }
    }
}

/// Text merge strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextStrategy {
    WordConsensus,
    HighestConfidence,
    CommonRunMerge,
}

impl TextStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WordConsensus => "word_consensus",
            Self::HighestConfidence => "highest_confidence",
            Self::CommonRunMerge => "common_run_merge",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FusionEngine {
    config: FusionConfig,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    /// Fuse `results` and return the fused result if it beats `selected`
    pub fn fuse(&self, results: &[RecognitionResult], selected: &RecognitionResult) -> Option<RecognitionResult> {
        let candidates: Vec<&RecognitionResult> = results
            .iter()
            .filter(|r| r.success && r.confidence >= self.config.min_confidence)
            .collect();
        if candidates.len() < 2 {
            tracing::debug!(candidates = candidates.len(), "Not enough candidates for fusion");
            return None;
        }

        let (strategy, text) = self.fuse_text(&candidates, selected);
        let structured_fields = self.fuse_fields(&candidates);
        let confidence = self.fuse_confidence(&candidates);

        let metrics = quality::analyze(&text);
        let fused_quality = quality::text_quality_score(&text, &metrics);
        let selected_quality = quality::text_quality_score(&selected.text, &selected.quality_metrics);

        let confidence_gain = confidence - selected.confidence;
        let quality_gain = fused_quality - selected_quality;
        let improves =
            confidence_gain > self.config.confidence_margin || quality_gain > self.config.quality_margin;

        // fusion may never lower confidence below the selection
        if !improves || confidence < selected.confidence {
            tracing::debug!(
                strategy = strategy.as_str(),
                confidence,
                selected_confidence = selected.confidence,
                quality_gain,
                "Fusion discarded"
            );
            return None;
        }

        tracing::info!(
            strategy = strategy.as_str(),
            sources = candidates.len(),
            confidence,
            confidence_gain,
            quality_gain,
            "Fusion accepted"
        );

        let mut provider_metadata = BTreeMap::new();
        provider_metadata.insert("fusion_strategy".to_string(), strategy.as_str().to_string());
        provider_metadata.insert(
            "fusion_sources".to_string(),
            candidates.iter().map(|c| c.label()).collect::<Vec<_>>().join(","),
        );

        Some(RecognitionResult {
            provider_id: ProviderId::new(FUSION_PROVIDER_ID),
            provider_kind: ProviderKind::Custom,
            text,
            confidence,
            processing_time_ms: candidates.iter().map(|c| c.processing_time_ms).max().unwrap_or(0),
            preprocessing_variant: selected.preprocessing_variant,
            structured_fields,
            quality_metrics: metrics,
            success: true,
            error_message: None,
            provider_metadata,
        })
    }

    // ------------------------------------------------------------------------
    // Text
    // ------------------------------------------------------------------------

    fn fuse_text(&self, candidates: &[&RecognitionResult], selected: &RecognitionResult) -> (TextStrategy, String) {
        let options = [
            (TextStrategy::WordConsensus, word_consensus(candidates, selected)),
            (TextStrategy::HighestConfidence, highest_confidence(candidates)),
            (
                TextStrategy::CommonRunMerge,
                self.common_run_merge(candidates, selected),
            ),
        ];

        let mut best: Option<(TextStrategy, String, f64)> = None;
        for (strategy, text) in options {
            let score = fusion_quality(&text, candidates);
            tracing::trace!(strategy = strategy.as_str(), score, "Fusion strategy scored");
            // strict comparison keeps the earlier strategy on ties
            if best.as_ref().is_none_or(|(_, _, s)| score > *s) {
                best = Some((strategy, text, score));
            }
        }

        best.map_or_else(
            || (TextStrategy::HighestConfidence, selected.text.clone()),
            |(strategy, text, _)| (strategy, text),
        )
    }

    /// Merge the selection with its near-duplicates around their longest
    /// common run, keeping the longer prefix and suffix of each pair
    fn common_run_merge(&self, candidates: &[&RecognitionResult], selected: &RecognitionResult) -> String {
        let mut merged = selected.text.clone();

        let mut others: Vec<&&RecognitionResult> = candidates
            .iter()
            .filter(|c| c.text != selected.text)
            .filter(|c| text_similarity(&c.text, &selected.text) >= self.config.near_duplicate_similarity)
            .collect();
        others.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        for other in others {
            let a: Vec<char> = merged.chars().collect();
            let b: Vec<char> = other.text.chars().collect();
            let (start_a, start_b, len) = longest_common_run(&a, &b);
            if len < self.config.min_common_run {
                continue;
            }

            let prefix = longer(&a[..start_a], &b[..start_b]);
            let suffix = longer(&a[start_a + len..], &b[start_b + len..]);
            merged = prefix
                .iter()
                .chain(&a[start_a..start_a + len])
                .chain(suffix)
                .collect();
        }

        merged
    }

    // ------------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------------

    /// Fuse every scalar field; line items come from the most confident source
    pub fn fuse_fields(&self, candidates: &[&RecognitionResult]) -> StructuredFields {
        let mut fused = StructuredFields::default();

        for key in FieldKey::ALL {
            let values: Vec<(FieldValue, f64)> = candidates
                .iter()
                .filter_map(|c| c.structured_fields.get(key).map(|v| (v, c.confidence)))
                .collect();
            if values.is_empty() {
                continue;
            }

            let value = if key.is_numeric() {
                self.fuse_numeric(&values)
            } else {
                fuse_categorical(&values)
            };
            if let Some(value) = value {
                fused.set(key, value);
            }
        }

        // line items are not merged row by row
        fused.line_items = candidates
            .iter()
            .filter(|c| !c.structured_fields.line_items.is_empty())
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .map(|c| c.structured_fields.line_items.clone())
            .unwrap_or_default();

        fused.prune();
        fused
    }

    fn fuse_numeric(&self, values: &[(FieldValue, f64)]) -> Option<FieldValue> {
        let amounts: Vec<(f64, f64)> = values
            .iter()
            .filter_map(|(v, c)| v.as_amount().map(|a| (a, *c)))
            .collect();

        let min = amounts.iter().map(|(a, _)| *a).fold(f64::INFINITY, f64::min);
        let max = amounts.iter().map(|(a, _)| *a).fold(f64::NEG_INFINITY, f64::max);
        let scale = min.abs().max(max.abs());
        let spread = if scale == 0.0 { 0.0 } else { (max - min) / scale };

        let weight_sum: f64 = amounts.iter().map(|(_, c)| *c).sum();
        // close readings average out, distant ones go to the most confident
        if spread <= self.config.numeric_tolerance && weight_sum > 0.0 {
            let average = amounts.iter().map(|(a, c)| a * c).sum::<f64>() / weight_sum;
            // cents
            Some(FieldValue::Amount((average * 100.0).round() / 100.0))
        } else {
            amounts
                .iter()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(a, _)| FieldValue::Amount(*a))
        }
    }

    // ------------------------------------------------------------------------
    // Confidence
    // ------------------------------------------------------------------------

    /// Confidence-weighted average plus agreement bonus, capped, and never
    /// below the weakest input
    pub fn fuse_confidence(&self, candidates: &[&RecognitionResult]) -> f64 {
        let min_input = candidates
            .iter()
            .map(|c| c.confidence)
            .fold(f64::INFINITY, f64::min);
        if !min_input.is_finite() {
            return 0.0;
        }

        // self-weighted, so strong inputs pull harder
        let weight_sum: f64 = candidates.iter().map(|c| c.confidence).sum();
        let average = if weight_sum > 0.0 {
            candidates.iter().map(|c| c.confidence * c.confidence).sum::<f64>() / weight_sum
        } else {
            0.0
        };

        let bonus = self.config.max_agreement_bonus * pairwise_agreement(candidates);
        (average + bonus).min(self.config.confidence_cap).max(min_input)
    }
}

/// Position-wise vote over words, laid out on the longest text's lines
fn word_consensus(candidates: &[&RecognitionResult], selected: &RecognitionResult) -> String {
    let Some(base) = candidates
        .iter()
        .max_by_key(|c| c.text.split_whitespace().count())
    else {
        return selected.text.clone();
    };

    let sequences: Vec<(Vec<&str>, f64)> = candidates
        .iter()
        .map(|c| (c.text.split_whitespace().collect(), c.confidence))
        .collect();
    let selected_words: Vec<&str> = selected.text.split_whitespace().collect();
    let total_weight: f64 = sequences.iter().map(|(_, c)| *c).sum();

    let mut position = 0usize;
    let mut lines = Vec::new();
    for line in base.text.lines() {
        let mut out = Vec::new();
        for base_word in line.split_whitespace() {
            let mut votes: BTreeMap<&str, f64> = BTreeMap::new();
            for (words, confidence) in &sequences {
                if let Some(word) = words.get(position) {
                    *votes.entry(*word).or_insert(0.0) += confidence;
                }
            }

            // a word needs more than half of the total weight
            let majority = votes
                .iter()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .filter(|(_, weight)| **weight * 2.0 > total_weight)
                .map(|(word, _)| *word);

            let chosen = majority
                .or_else(|| selected_words.get(position).copied())
                .unwrap_or(base_word);
            out.push(chosen);
            position += 1;
        }
        lines.push(out.join(" "));
    }

    lines.join("\n")
}

fn highest_confidence(candidates: &[&RecognitionResult]) -> String {
    candidates
        .iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .map(|c| c.text.clone())
        .unwrap_or_default()
}

/// Heuristic quality of a fused text against its inputs
fn fusion_quality(text: &str, candidates: &[&RecognitionResult]) -> f64 {
    if candidates.is_empty() || text.is_empty() {
        return 0.0;
    }
    let similarity =
        candidates.iter().map(|c| text_similarity(text, &c.text)).sum::<f64>() / candidates.len() as f64;
    let length_bonus = (text.chars().count() as f64 / 800.0).min(1.0);
    let domain_bonus = (domain_term_count(text) as f64 / 4.0).min(1.0);

    0.7 * similarity + 0.15 * length_bonus + 0.15 * domain_bonus
}

/// Mean pairwise text similarity among candidates
fn pairwise_agreement(candidates: &[&RecognitionResult]) -> f64 {
    let mut sum = 0.0;
    let mut pairs = 0usize;
    for (i, a) in candidates.iter().enumerate() {
        for b in &candidates[i + 1..] {
            sum += text_similarity(&a.text, &b.text);
            pairs += 1;
        }
    }
    if pairs == 0 {
        0.0
    } else {
        sum / pairs as f64
    }
}

/// Confidence-weighted vote over normalized values
fn fuse_categorical(values: &[(FieldValue, f64)]) -> Option<FieldValue> {
    // vote key -> (summed confidence, best single confidence, representative)
    let mut groups: BTreeMap<String, (f64, f64, &FieldValue)> = BTreeMap::new();
    for (value, confidence) in values {
        let entry = groups.entry(value.vote_key()).or_insert((0.0, *confidence, value));
        entry.0 += confidence;
        if *confidence > entry.1 {
            entry.1 = *confidence;
            entry.2 = value;
        }
    }

    groups
        .into_values()
        .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.total_cmp(&b.1)))
        .map(|(_, _, value)| value.clone())
}

/// Longest common substring as (start in a, start in b, length)
///
/// Only the first [`MAX_COMPARE_CHARS`] characters of each side are searched.
fn longest_common_run(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let a = &a[..a.len().min(MAX_COMPARE_CHARS)];
    let b = &b[..b.len().min(MAX_COMPARE_CHARS)];
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        for j in 1..=b.len() {
            curr[j] = if a[i - 1] == b[j - 1] { prev[j - 1] + 1 } else { 0 };
            if curr[j] > best.2 {
                best = (i - curr[j], j - curr[j], curr[j]);
            }
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    best
}

fn longer<'a>(a: &'a [char], b: &'a [char]) -> &'a [char] {
    if b.len() > a.len() {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::decision::test_support::result;

    const INVOICE: &str = "FAKTURA 2024-001\nDodavatel: ACME s.r.o.\nDatum: 12.03.2024\nCelkem: 1 500,00 CZK";

    #[test]
    fn test_needs_two_candidates() {
        let engine = FusionEngine::default();
        let a = result("a", ProviderKind::Custom, INVOICE, 0.9);
        let weak = result("b", ProviderKind::Custom, INVOICE, 0.2);
        assert!(engine.fuse(&[a.clone(), weak], &a).is_none());
    }

    #[test]
    fn test_strong_selection_stands() {
        let engine = FusionEngine::default();
        let results = vec![
            result("a", ProviderKind::Custom, INVOICE, 0.90),
            result("b", ProviderKind::Custom, INVOICE, 0.40),
            result("c", ProviderKind::Custom, INVOICE, 0.85),
        ];
        assert!(engine.fuse(&results, &results[0]).is_none());
    }

    #[test]
    fn test_agreeing_results_fuse_with_bonus() {
        let engine = FusionEngine::default();
        let results = vec![
            result("a", ProviderKind::Custom, INVOICE, 0.70),
            result("b", ProviderKind::Custom, INVOICE, 0.72),
            result("c", ProviderKind::Custom, INVOICE, 0.71),
        ];
        let fused = engine.fuse(&results, &results[1]).expect("fusion should be accepted");
        assert!(fused.confidence > 0.72 + 0.05);
        assert!(fused.confidence <= 0.98);
        assert_eq!(fused.provider_id.as_str(), FUSION_PROVIDER_ID);
        assert_eq!(fused.structured_fields.amount(), Some(1500.0));
        assert!(fused.provider_metadata.contains_key("fusion_strategy"));
    }

    #[test]
    fn test_confidence_floor_and_cap() {
        let engine = FusionEngine::default();
        let high = [
            result("a", ProviderKind::Custom, INVOICE, 1.0),
            result("b", ProviderKind::Custom, INVOICE, 1.0),
        ];
        let refs: Vec<&RecognitionResult> = high.iter().collect();
        // floor wins over the cap when every input is certain
        assert!((engine.fuse_confidence(&refs) - 1.0).abs() < 1e-12);

        let mixed = [
            result("a", ProviderKind::Custom, "alpha beta", 0.5),
            result("b", ProviderKind::Custom, "gamma delta", 0.9),
        ];
        let refs: Vec<&RecognitionResult> = mixed.iter().collect();
        let fused = engine.fuse_confidence(&refs);
        assert!(fused >= 0.5 && fused <= 0.98);
    }

    #[test]
    fn test_numeric_disagreement_takes_most_confident() {
        let engine = FusionEngine::default();
        let a = result("a", ProviderKind::Custom, "Invoice FV2024001\nTotal: 1000,00 CZK", 0.9);
        let b = result("b", ProviderKind::Custom, "Invoice FV2024001\nTotal: 1500,00 CZK", 0.6);
        let fields = engine.fuse_fields(&[&a, &b]);
        assert_eq!(fields.amount(), Some(1000.0));
        assert_eq!(fields.invoice_number.as_deref(), Some("FV2024001"));
    }

    #[test]
    fn test_numeric_agreement_is_averaged() {
        let engine = FusionEngine::default();
        let a = result("a", ProviderKind::Custom, "Total: 100,00", 0.5);
        let b = result("b", ProviderKind::Custom, "Total: 104,00", 0.5);
        let fields = engine.fuse_fields(&[&a, &b]);
        assert_eq!(fields.amount(), Some(102.0));
    }

    #[test]
    fn test_categorical_vote_is_weighted() {
        let values = vec![
            (FieldValue::Text("ACME s.r.o.".into()), 0.4),
            (FieldValue::Text("acme  S.R.O.".into()), 0.4),
            (FieldValue::Text("ACNE s.r.o.".into()), 0.7),
        ];
        let winner = fuse_categorical(&values).unwrap();
        assert_eq!(winner.vote_key(), "acme s.r.o.");
    }

    #[test]
    fn test_word_consensus_fixes_minority_errors() {
        let a = result("a", ProviderKind::Custom, "Total 1500 CZK", 0.6);
        let b = result("b", ProviderKind::Custom, "Tota1 1500 CZK", 0.5);
        let c = result("c", ProviderKind::Custom, "Total 1500 CZK", 0.4);
        let text = word_consensus(&[&a, &b, &c], &b);
        assert_eq!(text, "Total 1500 CZK");
    }

    #[test]
    fn test_common_run_merge_recovers_truncation() {
        let engine = FusionEngine::default();
        let head = result(
            "a",
            ProviderKind::Custom,
            "FAKTURA 2024-001 Dodavatel ACME s.r.o. Datum 12.03.2024",
            0.8,
        );
        let tail = result(
            "b",
            ProviderKind::Custom,
            "FAKTURA 2024-001 Dodavatel ACME s.r.o. Datum 12.03.2024 Celkem",
            0.7,
        );
        let merged = engine.common_run_merge(&[&head, &tail], &head);
        assert!(merged.ends_with("Celkem"));
        assert!(merged.starts_with("FAKTURA"));
    }

    #[test]
    fn test_longest_common_run() {
        let a: Vec<char> = "xxhello worldyy".chars().collect();
        let b: Vec<char> = "hello world".chars().collect();
        assert_eq!(longest_common_run(&a, &b), (2, 0, 11));
    }

    #[test]
    fn test_longest_common_run_is_bounded() {
        // the shared run starts past the search window on one side
        let a: Vec<char> = "x".repeat(MAX_COMPARE_CHARS).chars().chain("shared".chars()).collect();
        let b: Vec<char> = "shared".chars().collect();
        assert_eq!(longest_common_run(&a, &b), (0, 0, 0));

        let a: Vec<char> = "shared".chars().chain("x".repeat(MAX_COMPARE_CHARS * 2).chars()).collect();
        assert_eq!(longest_common_run(&a, &b), (0, 0, 6));
    }
}
