//! Provider reliability weights
//!
//! Every provider kind has a static prior (cloud engines above local ones).
//! Observed outcomes nudge a per-provider exponential moving average that may
//! drift at most [`MAX_DRIFT`] from the prior. Tables are immutable: recording
//! an outcome yields a new snapshot, and [`ReliabilityRegistry`] swaps the
//! shared `Arc` so in-flight decisions keep the snapshot they started with.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::recognition::{ProviderId, ProviderKind};

/// Smoothing factor of the outcome EMA
pub const EMA_ALPHA: f64 = 0.1;

/// Largest allowed distance between learned and static weight
pub const MAX_DRIFT: f64 = 0.15;

/// Static prior per provider kind
pub fn default_weight(kind: ProviderKind) -> f64 {
    match kind {
        ProviderKind::OpenAiVision => 0.90,
        ProviderKind::Ollama => 0.75,
        ProviderKind::Tesseract => 0.70,
        ProviderKind::Custom => 0.60,
    }
}

/// Immutable reliability snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilityTable {
    /// Incremented on every recorded outcome
    pub version: u64,
    /// Overrides of the static prior, by kind
    #[serde(default)]
    pub static_weights: BTreeMap<ProviderKind, f64>,
    /// Learned moving average, by provider id
    #[serde(default)]
    pub learned: BTreeMap<ProviderId, f64>,
}

impl ReliabilityTable {
    pub fn with_static_weights(static_weights: BTreeMap<ProviderKind, f64>) -> Self {
        Self {
            version: 0,
            static_weights,
            learned: BTreeMap::new(),
        }
    }

    pub fn static_weight(&self, kind: ProviderKind) -> f64 {
        self.static_weights
            .get(&kind)
            .copied()
            .unwrap_or_else(|| default_weight(kind))
            .clamp(0.0, 1.0)
    }

    /// Effective weight: static prior adjusted by the bounded learned average
    pub fn weight(&self, id: &ProviderId, kind: ProviderKind) -> f64 {
        let prior = self.static_weight(kind);
        match self.learned.get(id) {
            Some(ema) => ema.clamp(prior - MAX_DRIFT, prior + MAX_DRIFT).clamp(0.0, 1.0),
            None => prior,
        }
    }

    /// New snapshot with one outcome folded into the provider's average
    #[must_use = "returns a new snapshot; the receiver is unchanged"]
    pub fn record_outcome(&self, id: &ProviderId, kind: ProviderKind, success: bool) -> Self {
        let prior = self.static_weight(kind);
        // unseen providers start from their prior
        let current = self.learned.get(id).copied().unwrap_or(prior);
        let observed = if success { 1.0 } else { 0.0 };
        let updated = ((1.0 - EMA_ALPHA) * current + EMA_ALPHA * observed)
            .clamp(prior - MAX_DRIFT, prior + MAX_DRIFT);

        let mut next = self.clone();
        next.version += 1;
        next.learned.insert(id.clone(), updated);
        next
    }
}

/// Shared holder of the current snapshot
#[derive(Debug, Default)]
pub struct ReliabilityRegistry {
    current: RwLock<Arc<ReliabilityTable>>,
}

impl ReliabilityRegistry {
    pub fn new(table: ReliabilityTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    pub fn snapshot(&self) -> Arc<ReliabilityTable> {
        Arc::clone(&self.current.read())
    }

    /// Fold a batch of outcomes into a new snapshot and publish it
    pub fn record<'a>(&self, outcomes: impl IntoIterator<Item = (&'a ProviderId, ProviderKind, bool)>) {
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        for (id, kind, success) in outcomes {
            next = next.record_outcome(id, kind, success);
        }
        tracing::debug!(version = next.version, "Published reliability snapshot");
        *guard = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_outranks_local() {
        let table = ReliabilityTable::default();
        let cloud = table.weight(&"openai".into(), ProviderKind::OpenAiVision);
        let local = table.weight(&"tesseract".into(), ProviderKind::Tesseract);
        assert!(cloud > local);
    }

    #[test]
    fn test_record_outcome_returns_new_snapshot() {
        let table = ReliabilityTable::default();
        let id: ProviderId = "tesseract".into();
        let next = table.record_outcome(&id, ProviderKind::Tesseract, true);

        assert_eq!(table.version, 0);
        assert_eq!(next.version, 1);
        assert!((table.weight(&id, ProviderKind::Tesseract) - 0.70).abs() < 1e-9);
        assert!(next.weight(&id, ProviderKind::Tesseract) > 0.70);
    }

    #[test]
    fn test_drift_is_bounded() {
        let id: ProviderId = "ollama".into();
        let mut table = ReliabilityTable::default();
        for _ in 0..200 {
            table = table.record_outcome(&id, ProviderKind::Ollama, false);
        }
        let weight = table.weight(&id, ProviderKind::Ollama);
        assert!((weight - (0.75 - MAX_DRIFT)).abs() < 1e-9);

        for _ in 0..200 {
            table = table.record_outcome(&id, ProviderKind::Ollama, true);
        }
        assert!((table.weight(&id, ProviderKind::Ollama) - (0.75 + MAX_DRIFT)).abs() < 1e-9);
    }

    #[test]
    fn test_registry_swaps_snapshot() {
        let registry = ReliabilityRegistry::default();
        let before = registry.snapshot();
        let id: ProviderId = "a".into();
        registry.record([(&id, ProviderKind::Custom, true), (&id, ProviderKind::Custom, true)]);

        let after = registry.snapshot();
        assert_eq!(before.version, 0);
        assert_eq!(after.version, 2);
        assert!(after.weight(&id, ProviderKind::Custom) > before.weight(&id, ProviderKind::Custom));
    }

    #[test]
    fn test_static_override() {
        let mut weights = BTreeMap::new();
        weights.insert(ProviderKind::Tesseract, 0.95);
        let table = ReliabilityTable::with_static_weights(weights);
        assert!((table.weight(&"t".into(), ProviderKind::Tesseract) - 0.95).abs() < 1e-9);
    }
}
