//! Neuron snapshot - the value-typed payload stored in a neuron bank.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A value-typed snapshot of a neuron's weights, connectivity, and usage
/// history. Neuron banks store these keyed by canonical neuron id; snapshots
/// never carry shared references to other snapshots, only ids.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeuronSnapshot {
    pub id: Uuid,
    /// Primary concept tag, used by the partitioner's functional scoring.
    pub concept: String,
    /// Incoming connection weights, keyed by source neuron id. All values
    /// must be finite; non-finite weights are rejected at save time.
    pub input_weights: BTreeMap<Uuid, f64>,
    /// Outgoing connections.
    pub output_connections: BTreeSet<Uuid>,
    pub activation_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    /// Importance score in `[0, 1]`.
    pub importance: f64,
    /// Additional concept tags, beyond the primary `concept`. Order is
    /// preserved but duplicates (case-insensitive) are rejected by `new`.
    pub associated_concepts: Vec<String>,
}

impl NeuronSnapshot {
    pub fn new(concept: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            concept: concept.into(),
            input_weights: BTreeMap::new(),
            output_connections: BTreeSet::new(),
            activation_count: 0,
            created_at: now,
            last_used: now,
            importance: 0.0,
            associated_concepts: Vec::new(),
        }
    }

    /// Total connection count, used by the topology classifier.
    pub fn connection_count(&self) -> usize {
        self.input_weights.len() + self.output_connections.len()
    }

    /// All weights are finite (no NaN/±Inf). Checked before any write.
    pub fn has_finite_weights(&self) -> bool {
        self.input_weights.values().all(|w| w.is_finite()) && self.importance.is_finite()
    }

    /// Variance of input weights, used by the topology classifier. Zero for
    /// fewer than two weights.
    pub fn weight_variance(&self) -> f64 {
        let n = self.input_weights.len();
        if n < 2 {
            return 0.0;
        }
        let mean: f64 = self.input_weights.values().sum::<f64>() / n as f64;
        self.input_weights
            .values()
            .map(|w| (w - mean).powi(2))
            .sum::<f64>()
            / n as f64
    }

    /// Every concept tag this neuron carries, the primary plus associated,
    /// deduplicated case-insensitively.
    pub fn all_concepts(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for c in std::iter::once(&self.concept).chain(self.associated_concepts.iter()) {
            if seen.insert(c.to_lowercase()) {
                out.push(c.clone());
            }
        }
        out
    }
}
