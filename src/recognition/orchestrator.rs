//! Recognition Orchestrator
//!
//! Fans out one task per {provider × variant} pair under a single deadline.
//! Provider errors, preprocessing errors and task panics all come back as
//! failed results; tasks still running at the deadline are aborted and do not
//! appear in the output.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;

use crate::cancel::CancellationToken;
use crate::error::{PipelineError, Result};
use crate::routing::patterns::extract_fields;

use super::preprocess::{PreprocessingVariant, Preprocessor};
use super::provider::RecognitionProvider;
use super::quality;
use super::types::RecognitionResult;

/// Preprocessed image bytes, computed at most once per variant
type VariantCell = Arc<OnceCell<std::result::Result<Arc<Vec<u8>>, String>>>;

/// Runs recognition providers concurrently
pub struct Orchestrator {
    preprocessor: Arc<dyn Preprocessor>,
    /// Maximum concurrent tasks; 0 means one slot per task
    max_concurrency: usize,
}

impl Orchestrator {
    pub fn new(preprocessor: Arc<dyn Preprocessor>, max_concurrency: usize) -> Self {
        Self {
            preprocessor,
            max_concurrency,
        }
    }

    /// Run every provider against every variant until all finish or the
    /// deadline passes. The output order is unspecified.
    pub async fn run(
        &self,
        image: &[u8],
        providers: &[Arc<dyn RecognitionProvider>],
        variants: &[PreprocessingVariant],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Vec<RecognitionResult>> {
        if providers.is_empty() {
            return Err(PipelineError::NoProvidersAvailable);
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let variants: Vec<PreprocessingVariant> = if variants.is_empty() {
            vec![PreprocessingVariant::Original]
        } else {
            variants.to_vec()
        };

        let task_count = providers.len() * variants.len();
        let slots = if self.max_concurrency == 0 {
            task_count
        } else {
            self.max_concurrency.min(task_count)
        };
        let semaphore = Arc::new(Semaphore::new(slots.max(1)));

        let original = Arc::new(image.to_vec());
        let cells: HashMap<PreprocessingVariant, VariantCell> = variants
            .iter()
            .map(|v| (*v, Arc::new(OnceCell::new())))
            .collect();

        tracing::info!(
            providers = providers.len(),
            variants = variants.len(),
            tasks = task_count,
            slots,
            "Starting recognition fan-out"
        );

        let mut set = JoinSet::new();
        for provider in providers {
            for variant in &variants {
                let task = RecognitionTask {
                    provider: Arc::clone(provider),
                    variant: *variant,
                    original: Arc::clone(&original),
                    cell: Arc::clone(&cells[variant]),
                    preprocessor: Arc::clone(&self.preprocessor),
                    semaphore: Arc::clone(&semaphore),
                };
                set.spawn(task.run());
            }
        }

        let deadline = tokio::time::Instant::from_std(deadline);
        let mut results = Vec::with_capacity(task_count);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::warn!(pending = set.len(), "Recognition cancelled");
                    set.abort_all();
                    drain(&mut set).await;
                    return Err(PipelineError::Cancelled);
                }
                joined = tokio::time::timeout_at(deadline, set.join_next()) => match joined {
                    Ok(Some(Ok(result))) => results.push(result),
                    Ok(Some(Err(e))) => {
                        // panics are caught inside the task, so only aborts land here
                        tracing::debug!(error = %e, "Recognition task ended without a result");
                    }
                    Ok(None) => break,
                    Err(_) => {
                        tracing::warn!(
                            pending = set.len(),
                            completed = results.len(),
                            "Recognition deadline reached, aborting pending tasks"
                        );
                        set.abort_all();
                        drain(&mut set).await;
                        break;
                    }
                },
            }
        }

        tracing::info!(
            completed = results.len(),
            succeeded = results.iter().filter(|r| r.success).count(),
            "Recognition fan-out finished"
        );

        Ok(results)
    }
}

/// Wait for aborted tasks so none outlive the call
async fn drain(set: &mut JoinSet<RecognitionResult>) {
    while set.join_next().await.is_some() {}
}

struct RecognitionTask {
    provider: Arc<dyn RecognitionProvider>,
    variant: PreprocessingVariant,
    original: Arc<Vec<u8>>,
    cell: VariantCell,
    preprocessor: Arc<dyn Preprocessor>,
    semaphore: Arc<Semaphore>,
}

impl RecognitionTask {
    async fn run(self) -> RecognitionResult {
        let id = self.provider.id();
        let kind = self.provider.kind();
        let variant = self.variant;

        let _permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => return RecognitionResult::failure(id, kind, variant, 0, e),
        };

        let start = Instant::now();
        let outcome = AssertUnwindSafe(self.recognize()).catch_unwind().await;
        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(Ok(result)) => {
                tracing::debug!(
                    provider = %id,
                    variant = %variant,
                    confidence = result.confidence,
                    elapsed_ms,
                    "Recognition succeeded"
                );
                RecognitionResult {
                    processing_time_ms: elapsed_ms,
                    ..result
                }
            }
            Ok(Err(message)) => {
                tracing::warn!(provider = %id, variant = %variant, error = %message, "Recognition failed");
                RecognitionResult::failure(id, kind, variant, elapsed_ms, message)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(provider = %id, variant = %variant, panic = %message, "Recognition task panicked");
                RecognitionResult::failure(id, kind, variant, elapsed_ms, format!("task panicked: {}", message))
            }
        }
    }

    async fn recognize(&self) -> std::result::Result<RecognitionResult, String> {
        let image = self.image().await?;
        let output = self
            .provider
            .recognize(&image, self.variant)
            .await
            .map_err(|e| e.to_string())?;

        let text = output.text.trim().to_string();
        if text.is_empty() {
            return Err(super::types::RecognitionError::EmptyText.to_string());
        }

        let quality_metrics = quality::analyze(&text);
        let structured_fields = extract_fields(&text);

        Ok(RecognitionResult {
            provider_id: self.provider.id(),
            provider_kind: self.provider.kind(),
            confidence: output.confidence.clamp(0.0, 1.0),
            processing_time_ms: 0,
            preprocessing_variant: self.variant,
            structured_fields,
            quality_metrics,
            success: true,
            error_message: None,
            provider_metadata: output.metadata,
            text,
        })
    }

    /// Variant bytes; the first task to ask for a variant computes it
    async fn image(&self) -> std::result::Result<Arc<Vec<u8>>, String> {
        if self.variant == PreprocessingVariant::Original {
            return Ok(Arc::clone(&self.original));
        }

        let variant = self.variant;
        self.cell
            .get_or_init(|| {
                let original = Arc::clone(&self.original);
                let preprocessor = Arc::clone(&self.preprocessor);
                async move {
                    tokio::task::spawn_blocking(move || preprocessor.apply(&original, variant))
                        .await
                        .map_err(|e| format!("preprocessing task failed: {}", e))
                        .and_then(|r| r.map_err(|e| e.to_string()))
                        .map(Arc::new)
                }
            })
            .await
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::recognition::preprocess::ImagePreprocessor;
    use crate::recognition::provider::mock::MockProvider;
    use crate::recognition::types::{ProviderKind, RecognitionError};

    const INVOICE: &str = "INVOICE 2024-001\nSupplier: ACME s.r.o.\nDate: 12.03.2024\nTotal 1500 CZK";

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(Arc::new(ImagePreprocessor::default()), 0)
    }

    fn soon(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    struct PanickingProvider;

    #[async_trait::async_trait]
    impl RecognitionProvider for PanickingProvider {
        fn id(&self) -> crate::recognition::types::ProviderId {
            "panicky".into()
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::Custom
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn recognize(
            &self,
            _image: &[u8],
            _variant: PreprocessingVariant,
        ) -> std::result::Result<crate::recognition::types::RecognitionOutput, RecognitionError> {
            panic!("engine crashed")
        }
    }

    #[tokio::test]
    async fn test_no_providers() {
        let result = orchestrator()
            .run(b"img", &[], &[PreprocessingVariant::Original], soon(100), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PipelineError::NoProvidersAvailable)));
    }

    #[tokio::test]
    async fn test_cross_product_and_post_processing() {
        let a: Arc<dyn RecognitionProvider> =
            Arc::new(MockProvider::new("a", ProviderKind::Tesseract, INVOICE, 0.9));
        let b: Arc<dyn RecognitionProvider> =
            Arc::new(MockProvider::new("b", ProviderKind::Ollama, INVOICE, 1.7));

        let results = orchestrator()
            .run(
                b"raw bytes",
                &[a, b],
                &[PreprocessingVariant::Original],
                soon(2_000),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(result.success);
            assert!(result.confidence <= 1.0);
            assert_eq!(result.structured_fields.amount(), Some(1500.0));
            assert!(result.quality_metrics.word_count > 0);
        }
    }

    #[tokio::test]
    async fn test_errors_become_failed_results() {
        let failing: Arc<dyn RecognitionProvider> = Arc::new(MockProvider::failing("bad", "boom"));
        let panicky: Arc<dyn RecognitionProvider> = Arc::new(PanickingProvider);

        // "Contrast" on bytes that are not an image fails in preprocessing
        let ok: Arc<dyn RecognitionProvider> =
            Arc::new(MockProvider::new("ok", ProviderKind::Custom, INVOICE, 0.8));

        let results = orchestrator()
            .run(
                b"not an image",
                &[failing, panicky, ok],
                &[PreprocessingVariant::Original, PreprocessingVariant::Contrast],
                soon(2_000),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 6);
        let successes: Vec<_> = results.iter().filter(|r| r.success).collect();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].provider_id.as_str(), "ok");
        assert_eq!(successes[0].preprocessing_variant, PreprocessingVariant::Original);

        for failed in results.iter().filter(|r| !r.success) {
            assert_eq!(failed.confidence, 0.0);
            assert!(failed.error_message.is_some());
        }
        assert!(results
            .iter()
            .any(|r| r.error_message.as_deref().is_some_and(|m| m.contains("engine crashed"))));
    }

    #[tokio::test]
    async fn test_deadline_drops_slow_tasks() {
        let fast: Arc<dyn RecognitionProvider> =
            Arc::new(MockProvider::new("fast", ProviderKind::Custom, INVOICE, 0.8));
        let slow: Arc<dyn RecognitionProvider> = Arc::new(
            MockProvider::new("slow", ProviderKind::Custom, INVOICE, 0.9).with_delay(Duration::from_secs(5)),
        );

        let started = Instant::now();
        let results = orchestrator()
            .run(
                b"img",
                &[fast, slow],
                &[PreprocessingVariant::Original],
                soon(200),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].provider_id.as_str(), "fast");
    }

    #[tokio::test]
    async fn test_cancellation() {
        let slow: Arc<dyn RecognitionProvider> = Arc::new(
            MockProvider::new("slow", ProviderKind::Custom, INVOICE, 0.9).with_delay(Duration::from_secs(5)),
        );
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = orchestrator()
            .run(b"img", &[slow], &[PreprocessingVariant::Original], soon(10_000), &token)
            .await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_concurrency_cap_still_completes() {
        let providers: Vec<Arc<dyn RecognitionProvider>> = (0..4)
            .map(|i| {
                Arc::new(
                    MockProvider::new(&format!("p{}", i), ProviderKind::Custom, INVOICE, 0.7)
                        .with_delay(Duration::from_millis(20)),
                ) as Arc<dyn RecognitionProvider>
            })
            .collect();

        let results = Orchestrator::new(Arc::new(ImagePreprocessor::default()), 1)
            .run(
                b"img",
                &providers,
                &[PreprocessingVariant::Original],
                soon(5_000),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 4);
    }
}
