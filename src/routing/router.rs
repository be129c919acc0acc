//! Cost-aware model router
//!
//! Turns recognised text into structured fields:
//!
//! 1. Cache lookup keyed by normalized text, document type and complexity
//! 2. Tier ranking by accuracy, reasoning, cost fit, language and speed
//! 3. Sequential calls down the fallback chain, ending at the local pattern
//!    extractor which always succeeds
//! 4. Validation of the winning extraction, then cache write-back

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cache::{cache_key, CacheEntry, CacheStore, DEFAULT_TTL};
use crate::cancel::CancellationToken;
use crate::ensemble::field_completeness;
use crate::error::{PipelineError, Result, ValidationWarning};
use crate::fields::{DocumentType, StructuredFields};
use crate::pipeline::Provenance;

use super::client::{build_extraction_prompt, estimate_tokens, parse_extraction, CompletionClient, ModelError};
use super::complexity::{assess, is_target_language, ComplexityAssessment, ComplexityBucket};
use super::patterns::{extract_fields, pattern_confidence};
use super::tier::{ModelTier, TierCatalog, TierId};
use super::validation::validate;

/// Default timeout of a single model call
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum confidence for an extraction to be written back to the cache
pub const CACHE_MIN_CONFIDENCE: f64 = 0.8;

// ============================================================================
// Configuration
// ============================================================================

/// Weights and cost-fit levels of tier selection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectionWeights {
    pub accuracy: f64,
    pub reasoning: f64,
    /// Replaces `reasoning` for complex documents
    pub reasoning_complex: f64,
    pub cost: f64,
    pub language: f64,
    /// Applied only to latency-sensitive document types
    pub speed: f64,
    /// Estimates up to this multiple of the budget earn partial cost fit
    pub partial_budget_factor: f64,
    pub cost_fit_partial: f64,
    pub cost_fit_over_budget: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            accuracy: 0.40,
            reasoning: 0.15,
            reasoning_complex: 0.20,
            cost: 0.20,
            language: 0.15,
            speed: 0.05,
            partial_budget_factor: 1.5,
            cost_fit_partial: 0.5,
            cost_fit_over_budget: -0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    #[serde(with = "secs")]
    pub model_timeout: Duration,
    #[serde(with = "secs")]
    pub cache_ttl: Duration,
    pub cache_min_confidence: f64,
    /// ISO code of the language most documents are written in
    pub target_language: String,
    pub max_output_tokens: u32,
    /// Output size assumed by pre-call cost estimates
    pub expected_output_tokens: u32,
    pub selection: SelectionWeights,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            model_timeout: DEFAULT_MODEL_TIMEOUT,
            cache_ttl: DEFAULT_TTL,
            cache_min_confidence: CACHE_MIN_CONFIDENCE,
            target_language: "cs".to_string(),
            max_output_tokens: 1500,
            expected_output_tokens: 600,
            selection: SelectionWeights::default(),
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Per-call extraction options
#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    /// Budget in USD for one document; `None` means unbounded
    pub max_cost: Option<f64>,
    pub min_confidence: f64,
    pub enable_fallbacks: bool,
    pub deadline: Option<Instant>,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            max_cost: None,
            min_confidence: 0.7,
            enable_fallbacks: true,
            deadline: None,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// One tier call in the fallback chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierAttempt {
    pub tier: TierId,
    pub success: bool,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ranking entry for one tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierScore {
    pub tier: TierId,
    pub score: f64,
    pub estimated_cost: f64,
}

/// Outcome of a document extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub success: bool,
    pub extracted_fields: StructuredFields,
    pub confidence_score: f64,
    pub model_used: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<TierId>,
    pub cost_estimate: f64,
    pub validation_notes: Vec<ValidationWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub from_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<ComplexityBucket>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<TierAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

impl ExtractionResult {
    /// Failed result describing a pipeline error
    pub fn failed(error: &PipelineError) -> Self {
        Self {
            success: false,
            extracted_fields: StructuredFields::default(),
            confidence_score: 0.0,
            model_used: String::new(),
            tier: None,
            cost_estimate: 0.0,
            validation_notes: Vec::new(),
            error_message: Some(error.to_string()),
            from_cache: false,
            complexity: None,
            attempts: Vec::new(),
            provenance: None,
        }
    }
}

struct TierOutput {
    fields: StructuredFields,
    confidence: f64,
    cost: f64,
    model: String,
}

// ============================================================================
// Router
// ============================================================================

pub struct ModelRouter {
    catalog: RwLock<Arc<TierCatalog>>,
    clients: BTreeMap<TierId, Arc<dyn CompletionClient>>,
    cache: Arc<dyn CacheStore>,
    config: RouterConfig,
}

impl ModelRouter {
    /// Router with no model clients: only the local pattern tier is usable
    pub fn new(catalog: TierCatalog, cache: Arc<dyn CacheStore>, config: RouterConfig) -> Self {
        Self {
            catalog: RwLock::new(Arc::new(catalog)),
            clients: BTreeMap::new(),
            cache,
            config,
        }
    }

    /// Attach the client that serves `tier`
    pub fn with_client(mut self, tier: TierId, client: Arc<dyn CompletionClient>) -> Self {
        self.clients.insert(tier, client);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Current catalog snapshot
    pub fn catalog(&self) -> Arc<TierCatalog> {
        Arc::clone(&self.catalog.read())
    }

    /// Tiers that can be called: those with a client, plus local patterns
    fn is_callable(&self, catalog: &TierCatalog, tier: TierId) -> bool {
        catalog.get(tier).is_some() && (tier == TierId::LocalPattern || self.clients.contains_key(&tier))
    }

    /// Rank callable tiers for a document, best first
    pub fn rank_tiers(
        &self,
        text: &str,
        document_type: DocumentType,
        complexity: &ComplexityAssessment,
        max_cost: Option<f64>,
    ) -> Vec<TierScore> {
        let catalog = self.catalog();
        let prompt_tokens = estimate_tokens(text) + estimate_tokens(super::client::EXTRACTION_PROMPT);
        let in_target_language = is_target_language(text, &self.config.target_language);

        let mut scores: Vec<TierScore> = catalog
            .tiers
            .values()
            .filter(|tier| self.is_callable(&catalog, tier.id))
            .map(|tier| {
                let estimated_cost = tier.cost(prompt_tokens, self.config.expected_output_tokens);
                let score = score_tier(
                    &self.config.selection,
                    tier,
                    catalog.effective_accuracy(tier.id),
                    estimated_cost,
                    max_cost,
                    complexity.bucket,
                    document_type,
                    in_target_language,
                );
                TierScore {
                    tier: tier.id,
                    score,
                    estimated_cost,
                }
            })
            .collect();

        // equal scores prefer the higher tier
        scores.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.tier.cmp(&b.tier)));
        scores
    }

    /// Extract fields with default options
    pub async fn extract(
        &self,
        text: &str,
        document_type: DocumentType,
        max_cost: Option<f64>,
        min_confidence: f64,
    ) -> Result<ExtractionResult> {
        let options = ExtractionOptions {
            max_cost,
            min_confidence,
            ..Default::default()
        };
        self.extract_with(text, document_type, &options, &CancellationToken::new())
            .await
    }

    /// Extract fields from recognised text
    pub async fn extract_with(
        &self,
        text: &str,
        document_type: DocumentType,
        options: &ExtractionOptions,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let complexity = assess(text);
        // the bucket is part of the key, so a reclassified document misses
        let key = cache_key(text, document_type, complexity.bucket);

        if let Some(result) = self.cached(&key, complexity.bucket, options.min_confidence).await {
            return Ok(result);
        }

        let ranking = self.rank_tiers(text, document_type, &complexity, options.max_cost);
        let Some(best) = ranking.first() else {
            return Err(PipelineError::ModelRoutingFailed("no callable tiers".to_string()));
        };

        // one snapshot for the whole walk; feedback lands in the next one
        let catalog = self.catalog();
        let mut chain = vec![best.tier];
        if options.enable_fallbacks {
            chain.extend(
                catalog
                    .fallbacks(best.tier)
                    .into_iter()
                    .filter(|t| self.is_callable(&catalog, *t)),
            );
        }

        tracing::info!(
            tier = %best.tier,
            score = best.score,
            estimated_cost = best.estimated_cost,
            complexity = %complexity.bucket,
            chain_len = chain.len(),
            "Selected model tier"
        );

        let mut attempts = Vec::with_capacity(chain.len());
        let mut errors = Vec::new();

        for tier_id in chain {
            let Some(tier) = catalog.get(tier_id) else {
                continue;
            };
            let started = Instant::now();
            let outcome = self
                .run_tier(tier, text, document_type, options.deadline, cancel)
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(output) => {
                    attempts.push(TierAttempt {
                        tier: tier_id,
                        success: true,
                        elapsed_ms,
                        error: None,
                    });
                    if !tier.is_local_pattern() {
                        self.record_tier_outcome(tier_id, true);
                    }
                    let mut result = self
                        .finish(output, text, document_type, tier_id, options.min_confidence, &key)
                        .await;
                    result.complexity = Some(complexity.bucket);
                    result.attempts = attempts;
                    return Ok(result);
                }
                // cancellation ends the walk, it is not a tier failure
                Err(ModelError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    tracing::warn!(tier = %tier_id, error = %e, elapsed_ms, "Model tier failed");
                    self.record_tier_outcome(tier_id, false);
                    attempts.push(TierAttempt {
                        tier: tier_id,
                        success: false,
                        elapsed_ms,
                        error: Some(e.to_string()),
                    });
                    errors.push(format!("{}: {}", tier_id, e));
                }
            }
        }

        Err(PipelineError::ModelRoutingFailed(errors.join("; ")))
    }

    async fn cached(&self, key: &str, bucket: ComplexityBucket, min_confidence: f64) -> Option<ExtractionResult> {
        let entry = match self.cache.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "Cache lookup failed, continuing without cache");
                return None;
            }
        };

        tracing::info!(
            model = %entry.model_used,
            access_count = entry.access_count,
            "Serving extraction from cache"
        );

        // served as stored; only the caller's threshold is re-checked
        let mut validation_notes = Vec::new();
        if entry.confidence_score < min_confidence {
            validation_notes.push(below_minimum(entry.confidence_score, min_confidence));
        }

        Some(ExtractionResult {
            success: true,
            extracted_fields: entry.extracted_fields,
            confidence_score: entry.confidence_score,
            model_used: entry.model_used,
            tier: None,
            cost_estimate: 0.0,
            validation_notes,
            error_message: None,
            from_cache: true,
            complexity: Some(bucket),
            attempts: Vec::new(),
            provenance: None,
        })
    }

    async fn run_tier(
        &self,
        tier: &ModelTier,
        text: &str,
        document_type: DocumentType,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> std::result::Result<TierOutput, ModelError> {
        // never fails and costs nothing
        if tier.is_local_pattern() {
            let fields = extract_fields(text);
            return Ok(TierOutput {
                confidence: pattern_confidence(&fields),
                fields,
                cost: 0.0,
                model: TierId::LocalPattern.to_string(),
            });
        }

        let client = self
            .clients
            .get(&tier.id)
            .ok_or_else(|| ModelError::NotConfigured(tier.id.to_string()))?;

        // the per-call timeout never outlives the caller's deadline
        let limit = match deadline {
            Some(deadline) => self
                .config
                .model_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.config.model_timeout,
        };
        if limit.is_zero() {
            return Err(ModelError::Timeout(limit));
        }

        let prompt = build_extraction_prompt(text, document_type, &self.config.target_language);
        let call = tokio::time::timeout(limit, client.complete(&prompt, self.config.max_output_tokens));

        let completion = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            result = call => match result {
                Ok(completion) => completion?,
                Err(_) => return Err(ModelError::Timeout(limit)),
            },
        };

        let fields = parse_extraction(&completion.raw_text)?;
        // valid JSON with nothing in it still moves on to the next tier
        if fields.is_empty() {
            return Err(ModelError::Parse("no fields extracted".to_string()));
        }

        let confidence = self.catalog().effective_accuracy(tier.id) * (0.7 + 0.3 * field_completeness(&fields));
        Ok(TierOutput {
            confidence,
            cost: tier.cost(completion.input_tokens, completion.output_tokens),
            fields,
            model: tier.model.clone(),
        })
    }

    async fn finish(
        &self,
        output: TierOutput,
        text: &str,
        document_type: DocumentType,
        tier: TierId,
        min_confidence: f64,
        key: &str,
    ) -> ExtractionResult {
        let mut fields = output.fields;
        // models often omit the type they were told
        if fields.document_type.is_none() {
            fields.document_type = Some(document_type);
        }

        let report = validate(&mut fields, text, output.confidence);
        let mut validation_notes = report.notes;
        if report.confidence < min_confidence {
            validation_notes.push(below_minimum(report.confidence, min_confidence));
        }

        // weak results are not worth replaying
        if report.confidence >= self.config.cache_min_confidence {
            let entry = CacheEntry {
                normalized_text_hash: key.to_string(),
                extracted_fields: fields.clone(),
                model_used: output.model.clone(),
                confidence_score: report.confidence,
                created_at: Utc::now(),
                access_count: 0,
            };
            if let Err(e) = self.cache.put(key, entry, self.config.cache_ttl).await {
                tracing::warn!(error = %e, "Cache write failed");
            }
        }

        tracing::info!(
            tier = %tier,
            model = %output.model,
            confidence = report.confidence,
            cost = output.cost,
            "Extraction complete"
        );

        ExtractionResult {
            success: true,
            extracted_fields: fields,
            confidence_score: report.confidence,
            model_used: output.model,
            tier: Some(tier),
            cost_estimate: output.cost,
            validation_notes,
            error_message: None,
            from_cache: false,
            complexity: None,
            attempts: Vec::new(),
            provenance: None,
        }
    }

    fn record_tier_outcome(&self, tier: TierId, success: bool) {
        // readers holding the old Arc keep a consistent view
        let mut guard = self.catalog.write();
        let next = guard.record_outcome(tier, success);
        *guard = Arc::new(next);
    }
}

fn below_minimum(confidence: f64, min_confidence: f64) -> ValidationWarning {
    ValidationWarning::new(
        "confidence",
        format!("{:.2} is below the requested minimum {:.2}", confidence, min_confidence),
    )
}

/// Weighted selection score of one tier
#[allow(clippy::too_many_arguments)]
fn score_tier(
    weights: &SelectionWeights,
    tier: &ModelTier,
    accuracy: f64,
    estimated_cost: f64,
    max_cost: Option<f64>,
    bucket: ComplexityBucket,
    document_type: DocumentType,
    in_target_language: bool,
) -> f64 {
    let reasoning_weight = if bucket == ComplexityBucket::Complex {
        weights.reasoning_complex
    } else {
        weights.reasoning
    };

    // over budget is penalized, never excluded
    let cost_fit = match max_cost {
        None => 1.0,
        Some(budget) if estimated_cost <= budget => 1.0,
        Some(budget) if estimated_cost <= budget * weights.partial_budget_factor => weights.cost_fit_partial,
        Some(_) => weights.cost_fit_over_budget,
    };

    // a document outside the target language does not test language support
    let language = if in_target_language {
        tier.language_support_weight
    } else {
        1.0
    };

    let speed = if document_type.is_latency_sensitive() {
        weights.speed * tier.speed_weight
    } else {
        0.0
    };

    weights.accuracy * accuracy
        + reasoning_weight * tier.reasoning_weight
        + weights.cost * cost_fit
        + weights.language * language
        + speed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::routing::client::mock::MockClient;

    const INVOICE: &str = "FAKTURA - daňový doklad č. 2024001\n\
        Dodavatel: ACME s.r.o.\nIČO: 25596641\nDIČ: CZ25596641\n\
        Odběratel: Beta a.s.\n\
        Datum vystavení: 12.03.2024\nDatum splatnosti: 26.03.2024\n\
        Základ daně: 1 500,00 Kč\nDPH 21 %: 315,00 Kč\nCelkem k úhradě: 1 815,00 Kč\n";

    const REPLY: &str = r#"```json
{"documentType": "invoice", "invoiceNumber": "2024001", "date": "12.03.2024",
 "currency": "CZK",
 "vendor": {"name": "ACME s.r.o.", "registrationId": "25596641", "taxId": "CZ25596641"},
 "totals": {"subtotal": "1 500,00", "vatAmount": 315, "total": 1815}}
```"#;

    fn router() -> ModelRouter {
        ModelRouter::new(
            TierCatalog::default(),
            Arc::new(MemoryCacheStore::default()),
            RouterConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_local_pattern_only() {
        let result = router()
            .extract(INVOICE, DocumentType::Invoice, None, 0.5)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.tier, Some(TierId::LocalPattern));
        assert_eq!(result.cost_estimate, 0.0);
        assert_eq!(result.extracted_fields.invoice_number.as_deref(), Some("2024001"));
        assert_eq!(result.extracted_fields.date.as_deref(), Some("2024-03-12"));
    }

    #[tokio::test]
    async fn test_model_tier_result_is_validated() {
        let premium = MockClient::replying(REPLY);
        let router = router().with_client(TierId::Premium, premium.clone());

        let result = router
            .extract(INVOICE, DocumentType::Invoice, None, 0.5)
            .await
            .unwrap();

        assert_eq!(premium.calls(), 1);
        assert_eq!(result.tier, Some(TierId::Premium));
        assert_eq!(result.model_used, "gpt-4o");
        assert!(result.cost_estimate > 0.0);
        assert_eq!(result.extracted_fields.date.as_deref(), Some("2024-03-12"));
        assert_eq!(result.extracted_fields.amount(), Some(1815.0));
        assert!(result
            .validation_notes
            .iter()
            .any(|n| n.field == "vendor.registrationId" && n.message.contains("valid")));
        assert!(result.confidence_score > 0.8);
    }

    #[tokio::test]
    async fn test_failed_tier_falls_back() {
        let premium = MockClient::failing();
        let budget = MockClient::replying(REPLY);
        let router = router()
            .with_client(TierId::Premium, premium.clone())
            .with_client(TierId::Budget, budget.clone());

        let result = router
            .extract(INVOICE, DocumentType::Invoice, None, 0.5)
            .await
            .unwrap();

        assert_eq!(premium.calls(), 1);
        assert_eq!(budget.calls(), 1);
        assert_eq!(result.tier, Some(TierId::Budget));
        assert_eq!(result.attempts.len(), 2);
        assert!(!result.attempts[0].success);

        // failure lowered the premium tier's learned accuracy
        let catalog = router.catalog();
        assert!(catalog.effective_accuracy(TierId::Premium) < 0.93);
    }

    #[tokio::test]
    async fn test_unparseable_reply_falls_back_to_patterns() {
        let premium = MockClient::replying("I cannot read this document.");
        let router = router().with_client(TierId::Premium, premium);

        let result = router
            .extract(INVOICE, DocumentType::Invoice, None, 0.5)
            .await
            .unwrap();
        assert_eq!(result.tier, Some(TierId::LocalPattern));
    }

    #[tokio::test]
    async fn test_disabled_fallbacks_fail_routing() {
        let premium = MockClient::failing();
        let router = router().with_client(TierId::Premium, premium);
        let options = ExtractionOptions {
            enable_fallbacks: false,
            ..Default::default()
        };

        let err = router
            .extract_with(INVOICE, DocumentType::Invoice, &options, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ModelRoutingFailed(_)));
    }

    #[tokio::test]
    async fn test_budget_steers_tier_choice() {
        let router = router()
            .with_client(TierId::Flagship, MockClient::replying(REPLY))
            .with_client(TierId::Budget, MockClient::replying(REPLY));
        let complexity = assess(INVOICE);

        let unbounded = router.rank_tiers(INVOICE, DocumentType::Invoice, &complexity, None);
        assert_eq!(unbounded[0].tier, TierId::Flagship);

        let tight = router.rank_tiers(INVOICE, DocumentType::Invoice, &complexity, Some(0.001));
        assert_eq!(tight[0].tier, TierId::Budget);
    }

    #[tokio::test]
    async fn test_repeat_served_from_cache() {
        let premium = MockClient::replying(REPLY);
        let router = router().with_client(TierId::Premium, premium.clone());

        let first = router
            .extract(INVOICE, DocumentType::Invoice, None, 0.5)
            .await
            .unwrap();
        assert!(!first.from_cache);

        let second = router
            .extract(INVOICE, DocumentType::Invoice, None, 0.5)
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.cost_estimate, 0.0);
        assert_eq!(second.extracted_fields, first.extracted_fields);
        assert_eq!(premium.calls(), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_is_noted_not_failed() {
        let result = router()
            .extract("blurry scan with nothing useful", DocumentType::Other, None, 0.9)
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.confidence_score < 0.9);
        assert!(result.validation_notes.iter().any(|n| n.field == "confidence"));
    }

    #[tokio::test]
    async fn test_timeout_moves_to_next_tier() {
        let slow = MockClient::slow(REPLY, Duration::from_secs(5));
        let config = RouterConfig {
            model_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let router = ModelRouter::new(TierCatalog::default(), Arc::new(MemoryCacheStore::default()), config)
            .with_client(TierId::Premium, slow);

        let result = router
            .extract(INVOICE, DocumentType::Invoice, None, 0.5)
            .await
            .unwrap();
        assert_eq!(result.tier, Some(TierId::LocalPattern));
        assert!(result.attempts[0].error.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_call() {
        let slow = MockClient::slow(REPLY, Duration::from_secs(5));
        let router = router().with_client(TierId::Premium, slow);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = router
            .extract_with(INVOICE, DocumentType::Invoice, &ExtractionOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    fn score(tier: TierId, document_type: DocumentType, in_target_language: bool) -> f64 {
        let catalog = TierCatalog::default();
        let tier = catalog.get(tier).unwrap();
        score_tier(
            &SelectionWeights::default(),
            tier,
            tier.accuracy_weight,
            0.0,
            None,
            ComplexityBucket::Simple,
            document_type,
            in_target_language,
        )
    }

    #[test]
    fn test_receipts_reward_speed() {
        let invoice = score(TierId::LocalPattern, DocumentType::Invoice, true);
        let receipt = score(TierId::LocalPattern, DocumentType::Receipt, true);
        assert!(receipt > invoice);
    }

    #[test]
    fn test_non_target_language_gets_full_credit() {
        let czech = score(TierId::Free, DocumentType::Invoice, true);
        let other = score(TierId::Free, DocumentType::Invoice, false);
        assert!(other > czech);
    }
}
