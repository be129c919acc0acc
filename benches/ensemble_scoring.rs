//! Ensemble Scoring Benchmarks
//!
//! Decision and fusion over a realistic result set: 3 providers × 5
//! preprocessing variants of the same invoice with small OCR differences.
//!
//! Run with: `cargo bench --bench ensemble_scoring`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use docensemble::ensemble::{DecisionEngine, FusionConfig, FusionEngine, ReliabilityTable, ScoringWeights};
use docensemble::recognition::{quality, PreprocessingVariant, ProviderId, ProviderKind, RecognitionResult};
use docensemble::routing::patterns::extract_fields;

const INVOICE: &str = "FAKTURA - daňový doklad č. 2024001
Dodavatel: ACME s.r.o.
IČO: 25596641
DIČ: CZ25596641
Odběratel: Beta a.s.
IČO: 27082440
Datum vystavení: 12.03.2024
Datum splatnosti: 26.03.2024
Konzultace 10 1500 15000
Licence 2 4500 9000
Základ daně: 24 000,00 Kč
DPH 21 %: 5 040,00 Kč
Celkem k úhradě: 29 040,00 Kč";

/// Degrade the text a little differently per variant
fn noisy(text: &str, seed: usize) -> String {
    text.chars()
        .enumerate()
        .map(|(i, c)| match c {
            'o' if (i + seed) % 7 == 0 => '0',
            'l' if (i + seed) % 5 == 0 => '1',
            _ => c,
        })
        .collect()
}

fn result_set(size: usize) -> Vec<RecognitionResult> {
    let kinds = [ProviderKind::Tesseract, ProviderKind::Ollama, ProviderKind::OpenAiVision];
    (0..size)
        .map(|i| {
            let kind = kinds[i % kinds.len()];
            let variant = PreprocessingVariant::ALL[i % PreprocessingVariant::ALL.len()];
            let text = noisy(INVOICE, i);
            RecognitionResult {
                provider_id: ProviderId::new(format!("{}-{}", kind, i)),
                provider_kind: kind,
                confidence: 0.6 + (i % 4) as f64 * 0.1,
                processing_time_ms: 100,
                preprocessing_variant: variant,
                structured_fields: extract_fields(&text),
                quality_metrics: quality::analyze(&text),
                success: true,
                error_message: None,
                provider_metadata: BTreeMap::new(),
                text,
            }
        })
        .collect()
}

fn bench_decision(c: &mut Criterion) {
    let mut group = c.benchmark_group("decision");
    group.measurement_time(Duration::from_secs(10));

    let engine = DecisionEngine::new(ScoringWeights::default(), Arc::new(ReliabilityTable::default()))
        .expect("default weights are valid");

    for size in [3, 9, 15] {
        let results = result_set(size);
        group.bench_with_input(BenchmarkId::new("select", size), &results, |b, results| {
            b.iter(|| engine.select(black_box(results)))
        });
    }

    group.finish();
}

fn bench_fusion(c: &mut Criterion) {
    let mut group = c.benchmark_group("fusion");
    group.measurement_time(Duration::from_secs(10));

    let engine = FusionEngine::new(FusionConfig::default());
    for size in [3, 15] {
        let results = result_set(size);
        let selected = results[0].clone();
        group.bench_with_input(BenchmarkId::new("fuse", size), &results, |b, results| {
            b.iter(|| engine.fuse(black_box(results), black_box(&selected)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decision, bench_fusion);
criterion_main!(benches);
