//! Model tier catalog
//!
//! Tiers are ordered from the most capable (and expensive) cloud model down
//! to the local pattern extractor, which needs no model and never fails.
//! The catalog is an immutable snapshot: performance feedback yields a new
//! catalog with a bounded accuracy adjustment per tier.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Largest learned accuracy adjustment, in either direction
pub const MAX_ACCURACY_ADJUSTMENT: f64 = 0.1;

/// Decay applied to the previous adjustment before a new outcome is folded in
pub const ADJUSTMENT_DECAY: f64 = 0.9;

const SUCCESS_STEP: f64 = 0.01;
const FAILURE_STEP: f64 = -0.03;

// ============================================================================
// Tier Identity
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierId {
    Flagship,
    Premium,
    Optimal,
    Budget,
    Free,
    LocalPattern,
}

impl TierId {
    pub const ALL: [TierId; 6] = [
        TierId::Flagship,
        TierId::Premium,
        TierId::Optimal,
        TierId::Budget,
        TierId::Free,
        TierId::LocalPattern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flagship => "flagship",
            Self::Premium => "premium",
            Self::Optimal => "optimal",
            Self::Budget => "budget",
            Self::Free => "free",
            Self::LocalPattern => "local-pattern",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "flagship" => Some(Self::Flagship),
            "premium" => Some(Self::Premium),
            "optimal" => Some(Self::Optimal),
            "budget" => Some(Self::Budget),
            "free" => Some(Self::Free),
            "local-pattern" | "local" | "pattern" => Some(Self::LocalPattern),
            _ => None,
        }
    }

    /// Tiers below this one, in fallback order
    pub fn default_fallbacks(&self) -> Vec<TierId> {
        let position = TierId::ALL.iter().position(|t| t == self).unwrap_or(0);
        TierId::ALL[position + 1..].to_vec()
    }
}

impl std::fmt::Display for TierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tier Descriptor
// ============================================================================

/// Static description of a model tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTier {
    pub id: TierId,
    /// Model name sent to the endpoint; empty for the local pattern tier
    pub model: String,
    /// USD per million input tokens
    pub input_cost_per_million: f64,
    /// USD per million output tokens
    pub output_cost_per_million: f64,
    pub accuracy_weight: f64,
    pub reasoning_weight: f64,
    pub language_support_weight: f64,
    pub speed_weight: f64,
    pub context_window: u32,
}

impl ModelTier {
    /// Cost in USD of a call with the given token counts
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (f64::from(input_tokens) * self.input_cost_per_million
            + f64::from(output_tokens) * self.output_cost_per_million)
            / 1_000_000.0
    }

    pub fn is_local_pattern(&self) -> bool {
        self.id == TierId::LocalPattern
    }

    /// Built-in defaults for every tier
    pub fn defaults() -> Vec<ModelTier> {
        vec![
            ModelTier {
                id: TierId::Flagship,
                model: "o3".to_string(),
                input_cost_per_million: 10.0,
                output_cost_per_million: 40.0,
                accuracy_weight: 0.97,
                reasoning_weight: 0.98,
                language_support_weight: 0.95,
                speed_weight: 0.40,
                context_window: 200_000,
            },
            ModelTier {
                id: TierId::Premium,
                model: "gpt-4o".to_string(),
                input_cost_per_million: 2.50,
                output_cost_per_million: 10.0,
                accuracy_weight: 0.93,
                reasoning_weight: 0.88,
                language_support_weight: 0.92,
                speed_weight: 0.70,
                context_window: 128_000,
            },
            ModelTier {
                id: TierId::Optimal,
                model: "gpt-4.1-mini".to_string(),
                input_cost_per_million: 0.40,
                output_cost_per_million: 1.60,
                accuracy_weight: 0.88,
                reasoning_weight: 0.80,
                language_support_weight: 0.88,
                speed_weight: 0.85,
                context_window: 128_000,
            },
            ModelTier {
                id: TierId::Budget,
                model: "gpt-4o-mini".to_string(),
                input_cost_per_million: 0.15,
                output_cost_per_million: 0.60,
                accuracy_weight: 0.82,
                reasoning_weight: 0.70,
                language_support_weight: 0.82,
                speed_weight: 0.90,
                context_window: 128_000,
            },
            ModelTier {
                id: TierId::Free,
                model: "llama3.1:8b".to_string(),
                input_cost_per_million: 0.0,
                output_cost_per_million: 0.0,
                accuracy_weight: 0.70,
                reasoning_weight: 0.55,
                language_support_weight: 0.65,
                speed_weight: 0.60,
                context_window: 8_192,
            },
            ModelTier {
                id: TierId::LocalPattern,
                model: String::new(),
                input_cost_per_million: 0.0,
                output_cost_per_million: 0.0,
                accuracy_weight: 0.50,
                reasoning_weight: 0.10,
                language_support_weight: 1.0,
                speed_weight: 1.0,
                context_window: u32::MAX,
            },
        ]
    }
}

// ============================================================================
// Catalog Snapshot
// ============================================================================

/// Immutable tier table with fallback chains and learned adjustments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierCatalog {
    pub version: u64,
    pub tiers: BTreeMap<TierId, ModelTier>,
    pub fallbacks: BTreeMap<TierId, Vec<TierId>>,
    #[serde(default)]
    pub adjustments: BTreeMap<TierId, f64>,
}

impl Default for TierCatalog {
    fn default() -> Self {
        Self::new(ModelTier::defaults())
    }
}

impl TierCatalog {
    /// Catalog with the default `flagship → … → local-pattern` fallback table
    pub fn new(tiers: Vec<ModelTier>) -> Self {
        let tiers: BTreeMap<TierId, ModelTier> = tiers.into_iter().map(|t| (t.id, t)).collect();
        let fallbacks = tiers.keys().map(|id| (*id, id.default_fallbacks())).collect();
        Self {
            version: 0,
            tiers,
            fallbacks,
            adjustments: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: TierId) -> Option<&ModelTier> {
        self.tiers.get(&id)
    }

    /// Fallback chain after `id`, restricted to tiers present in the catalog
    pub fn fallbacks(&self, id: TierId) -> Vec<TierId> {
        self.fallbacks
            .get(&id)
            .map(|chain| chain.iter().copied().filter(|t| self.tiers.contains_key(t)).collect())
            .unwrap_or_default()
    }

    /// Static accuracy plus the learned adjustment
    pub fn effective_accuracy(&self, id: TierId) -> f64 {
        let base = self.tiers.get(&id).map(|t| t.accuracy_weight).unwrap_or(0.0);
        let adjustment = self.adjustments.get(&id).copied().unwrap_or(0.0);
        (base + adjustment).clamp(0.0, 1.0)
    }

    /// New snapshot with one call outcome folded into the tier's adjustment
    #[must_use = "returns a new snapshot; the receiver is unchanged"]
    pub fn record_outcome(&self, id: TierId, success: bool) -> Self {
        let previous = self.adjustments.get(&id).copied().unwrap_or(0.0);
        // failures weigh three times a success
        let step = if success { SUCCESS_STEP } else { FAILURE_STEP };
        let updated = (ADJUSTMENT_DECAY * previous + step).clamp(-MAX_ACCURACY_ADJUSTMENT, MAX_ACCURACY_ADJUSTMENT);

        let mut next = self.clone();
        next.version += 1;
        next.adjustments.insert(id, updated);
        next
    }
}
