//! Cluster metadata - the record tying a cluster id to its stable partition
//! and concept tags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::partition::PartitionPath;

/// Metadata for one cluster. If a metadata record exists for a cluster, its
/// membership and neurons live under `partition` — the coordinator never
/// moves a cluster to a different partition once this record is created,
/// except via the (planning-only) compaction path.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetadata {
    pub cluster_id: Uuid,
    pub concept_domain: String,
    pub partition: PartitionPath,
    /// Unique, case-insensitively deduplicated concept tags.
    pub associated_concepts: Vec<String>,
    pub neuron_count: usize,
    pub average_importance: f64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl ClusterMetadata {
    pub fn new(cluster_id: Uuid, concept_domain: impl Into<String>, partition: PartitionPath) -> Self {
        let now = Utc::now();
        Self {
            cluster_id,
            concept_domain: concept_domain.into(),
            partition,
            associated_concepts: Vec::new(),
            neuron_count: 0,
            average_importance: 0.0,
            created_at: now,
            last_accessed: now,
        }
    }

    /// Per-file name for this cluster's standalone `.cluster[.gz]` file.
    pub fn file_stem(&self, canonical_id: &str) -> String {
        format!("{}_{}", self.concept_domain, canonical_id)
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_accessed = at;
    }

    pub fn has_concept(&self, concept: &str) -> bool {
        let lower = concept.to_lowercase();
        self.associated_concepts.iter().any(|c| c.to_lowercase() == lower)
    }
}

/// A single cluster match returned from concept-index / similarity lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterReference {
    pub cluster_id: Uuid,
    pub partition: PartitionPath,
    pub last_accessed: DateTime<Utc>,
    pub concept_domain: String,
    /// Jaccard similarity (or 1.0 for an exact index hit) against the query
    /// concept set.
    pub similarity: f64,
}
