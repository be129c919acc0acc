//! Document extraction pipeline
//!
//! Wires the stages together for one scanned document:
//!
//! ```text
//! providers ─► orchestrator ─► decision ─► fusion ─► router ─► ExtractionResult
//!                                  │                    │
//!                            reliability            tier catalog
//!                             snapshot               snapshot
//! ```
//!
//! Only the cache, the reliability snapshot and the tier catalog outlive a
//! call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{CacheStore, MemoryCacheStore};
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::ensemble::{DecisionEngine, FusionEngine, ReliabilityRegistry, ReliabilityTable, ScoringWeights, FUSION_PROVIDER_ID};
use crate::error::{PipelineError, Result};
use crate::fields::DocumentType;
use crate::recognition::{
    ImagePreprocessor, OllamaProvider, OpenAiVisionProvider, Orchestrator, PreprocessingVariant, ProviderId,
    ProviderKind, RecognitionProvider, RecognitionResult,
};
use crate::routing::{ExtractionOptions, ExtractionResult, ModelRouter, OpenAiCompatibleClient, TierCatalog, TierId};

/// Default budget per document, in USD
pub const DEFAULT_MAX_COST_PER_DOC: f64 = 0.05;

/// Per-document options
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub max_cost_per_doc: Option<f64>,
    pub min_confidence: f64,
    pub enable_fallbacks: bool,
    /// Overall deadline; recognition also stops at its own timeout
    pub deadline: Option<Instant>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            max_cost_per_doc: Some(DEFAULT_MAX_COST_PER_DOC),
            min_confidence: 0.7,
            enable_fallbacks: true,
            deadline: None,
        }
    }
}

/// Where an extraction came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub request_id: Uuid,
    pub filename: String,
    pub document_type: DocumentType,
    pub selected_provider: ProviderId,
    pub selected_variant: PreprocessingVariant,
    pub selected_confidence: f64,
    pub decision_score: f64,
    pub fusion_applied: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fusion_sources: Vec<String>,
    pub recognition_results: usize,
    pub successful_results: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outlier_providers: Vec<String>,
    pub elapsed_ms: u64,
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct Pipeline {
    providers: Vec<Arc<dyn RecognitionProvider>>,
    orchestrator: Orchestrator,
    variants: Vec<PreprocessingVariant>,
    recognition_timeout: Duration,
    weights: ScoringWeights,
    fusion: FusionEngine,
    reliability: ReliabilityRegistry,
    router: ModelRouter,
}

impl Pipeline {
    /// Assemble a pipeline from explicit parts
    pub fn new(providers: Vec<Arc<dyn RecognitionProvider>>, router: ModelRouter, config: &Config) -> Result<Self> {
        config.decision.validate()?;
        Ok(Self {
            providers,
            orchestrator: Orchestrator::new(
                Arc::new(ImagePreprocessor::default()),
                config.recognition.max_concurrency,
            ),
            variants: config.recognition.variants.clone(),
            recognition_timeout: config.recognition.timeout(),
            weights: config.decision,
            fusion: FusionEngine::new(config.fusion),
            reliability: ReliabilityRegistry::new(ReliabilityTable::with_static_weights(config.reliability.clone())),
            router,
        })
    }

    /// Build providers, tier clients and cache from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let providers = build_providers(config);
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new(config.cache.capacity));
        let router = build_router(config, cache);
        Self::new(providers, router, config)
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    pub fn reliability(&self) -> Arc<ReliabilityTable> {
        self.reliability.snapshot()
    }

    /// Extract structured fields from one scanned document
    pub async fn process_document(
        &self,
        image: &[u8],
        filename: &str,
        document_type_hint: Option<DocumentType>,
        options: &ProcessOptions,
    ) -> Result<ExtractionResult> {
        self.process_document_with_cancel(image, filename, document_type_hint, options, &CancellationToken::new())
            .await
    }

    /// Same as [`Pipeline::process_document`], stopping early when `cancel` fires
    pub async fn process_document_with_cancel(
        &self,
        image: &[u8],
        filename: &str,
        document_type_hint: Option<DocumentType>,
        options: &ProcessOptions,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult> {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        tracing::info!(%request_id, filename, bytes = image.len(), "Processing document");

        let providers = self.available_providers().await;
        if providers.is_empty() {
            tracing::warn!(%request_id, configured = self.providers.len(), "No recognition providers available");
            return Err(PipelineError::NoProvidersAvailable);
        }

        let recognition_deadline = match options.deadline {
            Some(deadline) => deadline.min(started + self.recognition_timeout),
            None => started + self.recognition_timeout,
        };
        let results = self
            .orchestrator
            .run(image, &providers, &self.variants, recognition_deadline, cancel)
            .await?;

        let successful = results.iter().filter(|r| r.success).count();
        if successful == 0 {
            self.record_reliability(&results, None);
            let reason = failure_summary(&results);
            tracing::warn!(%request_id, results = results.len(), reason = %reason, "All recognition providers failed");
            return Err(PipelineError::AllProvidersFailed(reason));
        }

        let engine = DecisionEngine::new(self.weights, self.reliability.snapshot())?;
        let decision = engine.select(&results)?;
        let fused = self.fusion.fuse(&results, &decision.selected_result);
        self.record_reliability(&results, Some(&decision.selected_result));

        let outlier_providers: Vec<String> = decision
            .consensus_analysis
            .outliers
            .iter()
            .filter_map(|i| results.get(*i))
            .map(RecognitionResult::label)
            .collect();
        let fusion_sources: Vec<String> = fused
            .as_ref()
            .and_then(|f| f.provider_metadata.get("fusion_sources"))
            .map(|s| s.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        let chosen = fused.as_ref().unwrap_or(&decision.selected_result);

        let document_type = document_type_hint
            .or(chosen.structured_fields.document_type)
            .or_else(|| DocumentType::detect(&chosen.text))
            .unwrap_or(DocumentType::Other);

        tracing::info!(
            %request_id,
            selected = %decision.selected_result.label(),
            score = decision.score,
            fused = fused.is_some(),
            document_type = %document_type,
            "Recognition settled"
        );

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let extraction_options = ExtractionOptions {
            max_cost: options.max_cost_per_doc,
            min_confidence: options.min_confidence,
            enable_fallbacks: options.enable_fallbacks,
            deadline: options.deadline,
        };
        let mut result = self
            .router
            .extract_with(&chosen.text, document_type, &extraction_options, cancel)
            .await?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        result.provenance = Some(Provenance {
            request_id,
            filename: filename.to_string(),
            document_type,
            selected_provider: chosen.provider_id.clone(),
            selected_variant: chosen.preprocessing_variant,
            selected_confidence: chosen.confidence,
            decision_score: decision.score,
            fusion_applied: fused.is_some(),
            fusion_sources,
            recognition_results: results.len(),
            successful_results: successful,
            outlier_providers,
            elapsed_ms,
        });

        tracing::info!(
            %request_id,
            confidence = result.confidence_score,
            model = %result.model_used,
            from_cache = result.from_cache,
            cost = result.cost_estimate,
            elapsed_ms,
            "Document processed"
        );

        Ok(result)
    }

    async fn available_providers(&self) -> Vec<Arc<dyn RecognitionProvider>> {
        let checks = self.providers.iter().map(|p| async move { (Arc::clone(p), p.is_available().await) });
        futures::future::join_all(checks)
            .await
            .into_iter()
            .filter_map(|(provider, available)| {
                if !available {
                    tracing::debug!(provider = %provider.id(), "Provider unavailable, skipping");
                }
                available.then_some(provider)
            })
            .collect()
    }

    /// Winner counts as a success, failed results as failures
    fn record_reliability(&self, results: &[RecognitionResult], winner: Option<&RecognitionResult>) {
        let mut outcomes: Vec<(&ProviderId, ProviderKind, bool)> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| (&r.provider_id, r.provider_kind, false))
            .collect();
        if let Some(winner) = winner.filter(|w| w.provider_id.as_str() != FUSION_PROVIDER_ID) {
            outcomes.push((&winner.provider_id, winner.provider_kind, true));
        }
        if !outcomes.is_empty() {
            self.reliability.record(outcomes);
        }
    }
}

fn failure_summary(results: &[RecognitionResult]) -> String {
    if results.is_empty() {
        return "no provider finished before the deadline".to_string();
    }
    results
        .iter()
        .map(|r| format!("{}: {}", r.label(), r.error_message.as_deref().unwrap_or("unknown error")))
        .collect::<Vec<_>>()
        .join("; ")
}

fn build_providers(config: &Config) -> Vec<Arc<dyn RecognitionProvider>> {
    let settings = &config.providers;
    let timeout = config.recognition.timeout();
    let mut providers: Vec<Arc<dyn RecognitionProvider>> = Vec::new();

    for kind in &settings.enabled {
        match kind {
            ProviderKind::Tesseract => {
                #[cfg(feature = "ocr-tesseract")]
                providers.push(Arc::new(crate::recognition::TesseractProvider::new(
                    &settings.tesseract_language,
                )));
                #[cfg(not(feature = "ocr-tesseract"))]
                tracing::warn!("Tesseract requested but the ocr-tesseract feature is disabled");
            }
            ProviderKind::Ollama => providers.push(Arc::new(OllamaProvider::new(
                &settings.ollama_url,
                &settings.ollama_model,
                &config.router.target_language,
                timeout,
            ))),
            ProviderKind::OpenAiVision => providers.push(Arc::new(OpenAiVisionProvider::new(
                &settings.openai_base_url,
                settings.openai_api_key.clone(),
                &settings.openai_vision_model,
                &config.router.target_language,
                timeout,
            ))),
            ProviderKind::Custom => {
                tracing::warn!("Custom providers must be injected with Pipeline::new");
            }
        }
    }

    providers
}

fn build_router(config: &Config, cache: Arc<dyn CacheStore>) -> ModelRouter {
    let mut catalog = TierCatalog::new(config.tiers.catalog.clone());
    for (tier, chain) in &config.tiers.fallbacks {
        catalog.fallbacks.insert(*tier, chain.clone());
    }

    let mut router_config = config.router.clone();
    router_config.cache_ttl = Duration::from_secs(config.cache.ttl_secs);
    let models: Vec<(TierId, String)> = catalog.tiers.values().map(|t| (t.id, t.model.clone())).collect();
    let mut router = ModelRouter::new(catalog, cache, router_config);

    let settings = &config.providers;
    for (tier, model) in models {
        match tier {
            TierId::LocalPattern => {}
            TierId::Free => {
                let base_url = format!("{}/v1", settings.ollama_url.trim_end_matches('/'));
                router = router.with_client(tier, Arc::new(OpenAiCompatibleClient::new(&base_url, None, &model)));
            }
            _ => {
                if let Some(key) = &settings.openai_api_key {
                    router = router.with_client(
                        tier,
                        Arc::new(OpenAiCompatibleClient::new(
                            &settings.openai_base_url,
                            Some(key.clone()),
                            &model,
                        )),
                    );
                }
            }
        }
    }

    router
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::recognition::mock::MockProvider;
    use crate::routing::client::mock::MockClient;
    use crate::routing::RouterConfig;

    const INVOICE: &str = "FAKTURA - daňový doklad č. 2024001\n\
        Dodavatel: ACME s.r.o.\nIČO: 25596641\nDIČ: CZ25596641\n\
        Odběratel: Beta a.s.\nIČO: 27082440\n\
        Datum vystavení: 12.03.2024\nDatum splatnosti: 26.03.2024\n\
        Základ daně: 1 500,00 Kč\nDPH 21 %: 315,00 Kč\nCelkem k úhradě: 1 815,00 Kč\n";

    const REPLY: &str = r#"{"documentType": "invoice", "invoiceNumber": "2024001", "date": "12.03.2024",
        "currency": "CZK", "vendor": {"name": "ACME s.r.o.", "registrationId": "25596641"},
        "totals": {"subtotal": 1500, "vatAmount": 315, "total": 1815}}"#;

    fn config() -> Config {
        let mut config = Config::default();
        config.recognition.variants = vec![PreprocessingVariant::Original];
        config.recognition.timeout_secs = 5;
        config
    }

    fn local_router() -> ModelRouter {
        ModelRouter::new(
            TierCatalog::default(),
            Arc::new(MemoryCacheStore::default()),
            RouterConfig::default(),
        )
    }

    fn provider(id: &str, text: &str, confidence: f64) -> Arc<dyn RecognitionProvider> {
        Arc::new(MockProvider::new(id, ProviderKind::Custom, text, confidence))
    }

    #[tokio::test]
    async fn test_agreeing_providers_select_high_confidence() {
        let providers = vec![
            provider("p90", INVOICE, 0.90),
            provider("p40", INVOICE, 0.40),
            provider("p85", INVOICE, 0.85),
        ];
        let pipeline = Pipeline::new(providers, local_router(), &config()).unwrap();

        let result = pipeline
            .process_document(b"scan", "invoice.png", None, &ProcessOptions::default())
            .await
            .unwrap();

        let provenance = result.provenance.as_ref().unwrap();
        assert_eq!(provenance.selected_provider.as_str(), "p90");
        assert!(provenance.selected_confidence >= 0.85);
        assert!(!provenance.fusion_applied);
        assert_eq!(provenance.recognition_results, 3);
        assert_eq!(provenance.document_type, DocumentType::Invoice);
        assert!(result.success);
        assert_eq!(result.extracted_fields.invoice_number.as_deref(), Some("2024001"));
    }

    #[tokio::test]
    async fn test_all_providers_failed() {
        let providers: Vec<Arc<dyn RecognitionProvider>> = vec![
            Arc::new(MockProvider::failing("a", "engine crashed")),
            Arc::new(MockProvider::failing("b", "HTTP 503")),
        ];
        let pipeline = Pipeline::new(providers, local_router(), &config()).unwrap();

        let err = pipeline
            .process_document(b"scan", "x.png", None, &ProcessOptions::default())
            .await
            .unwrap_err();
        match err {
            PipelineError::AllProvidersFailed(reason) => {
                assert!(reason.contains("engine crashed"));
                assert!(reason.contains("HTTP 503"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // failures were fed back into the reliability snapshot
        let table = pipeline.reliability();
        assert_eq!(table.version, 2);
        assert!(table.weight(&"a".into(), ProviderKind::Custom) < 0.60);
    }

    #[tokio::test]
    async fn test_unavailable_providers_are_skipped() {
        let providers: Vec<Arc<dyn RecognitionProvider>> = vec![Arc::new(
            MockProvider::new("down", ProviderKind::Ollama, INVOICE, 0.9).unavailable(),
        )];
        let pipeline = Pipeline::new(providers, local_router(), &config()).unwrap();

        let err = pipeline
            .process_document(b"scan", "x.png", None, &ProcessOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoProvidersAvailable));
    }

    #[tokio::test]
    async fn test_amount_disagreement_keeps_confident_value() {
        let cheap = INVOICE.replace("1 815,00", "2 722,50");
        let providers = vec![provider("sharp", INVOICE, 0.92), provider("blurry", &cheap, 0.60)];
        let pipeline = Pipeline::new(providers, local_router(), &config()).unwrap();

        let result = pipeline
            .process_document(b"scan", "x.png", Some(DocumentType::Invoice), &ProcessOptions::default())
            .await
            .unwrap();

        assert_eq!(result.extracted_fields.amount(), Some(1815.0));
        let provenance = result.provenance.unwrap();
        assert_eq!(provenance.selected_provider.as_str(), "sharp");
    }

    #[tokio::test]
    async fn test_repeat_document_served_from_cache() {
        let premium = MockClient::replying(REPLY);
        let router = local_router().with_client(TierId::Premium, premium.clone());
        let providers = vec![provider("ocr", INVOICE, 0.9)];
        let pipeline = Pipeline::new(providers, router, &config()).unwrap();
        let options = ProcessOptions {
            max_cost_per_doc: None,
            ..Default::default()
        };

        let first = pipeline
            .process_document(b"scan", "a.png", None, &options)
            .await
            .unwrap();
        let second = pipeline
            .process_document(b"scan", "a.png", None, &options)
            .await
            .unwrap();

        assert!(!first.from_cache);
        assert_eq!(first.tier, Some(TierId::Premium));
        assert!(second.from_cache);
        assert_eq!(second.cost_estimate, 0.0);
        assert_eq!(premium.calls(), 1);
        assert_ne!(
            first.provenance.unwrap().request_id,
            second.provenance.unwrap().request_id
        );
    }

    #[tokio::test]
    async fn test_cache_hit_skips_model_latency() {
        let delay = Duration::from_millis(400);
        let premium = MockClient::slow(REPLY, delay);
        let router = local_router().with_client(TierId::Premium, premium.clone());
        let providers = vec![provider("ocr", INVOICE, 0.9)];
        let pipeline = Pipeline::new(providers, router, &config()).unwrap();
        let options = ProcessOptions {
            max_cost_per_doc: None,
            ..Default::default()
        };

        let started = Instant::now();
        let first = pipeline
            .process_document(b"scan", "a.png", None, &options)
            .await
            .unwrap();
        let cold = started.elapsed();

        let started = Instant::now();
        let second = pipeline
            .process_document(b"scan", "a.png", None, &options)
            .await
            .unwrap();
        let warm = started.elapsed();

        assert!(!first.from_cache);
        assert!(cold >= delay);
        assert!(second.from_cache);
        assert!(warm < delay / 4, "cache hit took {:?}", warm);
        assert_eq!(premium.calls(), 1);
    }

    #[tokio::test]
    async fn test_winner_gains_reliability() {
        let providers = vec![provider("p1", INVOICE, 0.9), provider("p2", INVOICE, 0.5)];
        let pipeline = Pipeline::new(providers, local_router(), &config()).unwrap();
        let before = pipeline.reliability().weight(&"p1".into(), ProviderKind::Custom);

        pipeline
            .process_document(b"scan", "x.png", None, &ProcessOptions::default())
            .await
            .unwrap();

        let after = pipeline.reliability().weight(&"p1".into(), ProviderKind::Custom);
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let providers = vec![provider("p", INVOICE, 0.9)];
        let pipeline = Pipeline::new(providers, local_router(), &config()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline
            .process_document_with_cancel(b"scan", "x.png", None, &ProcessOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let mut config = config();
        config.decision.confidence = 0.9;
        let result = Pipeline::new(Vec::new(), local_router(), &config);
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_router_built_without_key_has_local_and_free_tiers() {
        let config = config();
        let router = build_router(&config, Arc::new(MemoryCacheStore::default()));
        let complexity = crate::routing::complexity::assess(INVOICE);
        let ranked: Vec<TierId> = router
            .rank_tiers(INVOICE, DocumentType::Invoice, &complexity, None)
            .into_iter()
            .map(|s| s.tier)
            .collect();
        assert_eq!(ranked, vec![TierId::Free, TierId::LocalPattern]);
    }
}
