//! Partition metadata store: the single-file `clusterId -> ClusterMetadata`
//! map, plus the derived concept index (§4.4).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{ClusterMetadata, ClusterReference};
use crate::storage::canonical_id;

const METADATA_FILE_NAME: &str = "partition_metadata.json";

#[derive(Default)]
struct Inner {
    metadata: BTreeMap<String, ClusterMetadata>,
    concept_index: HashMap<String, Vec<Uuid>>,
    index_dirty: bool,
}

/// Owns the in-memory `clusterId -> ClusterMetadata` map and its derived
/// concept index, persisted as one JSON file under the hierarchical root.
pub struct PartitionMetadataStore {
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl PartitionMetadataStore {
    /// Load from `hierarchical_dir/partition_metadata.json`. A missing or
    /// malformed file yields an empty store (recoverable corruption, logged,
    /// per §7).
    pub async fn load(hierarchical_dir: &Path) -> Self {
        let path = hierarchical_dir.join(METADATA_FILE_NAME);
        let metadata = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, ClusterMetadata>>(&bytes) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "partition metadata corrupt, resetting to empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };

        let mut inner = Inner {
            metadata,
            concept_index: HashMap::new(),
            index_dirty: true,
        };
        rebuild_index(&mut inner);

        Self {
            path,
            inner: RwLock::new(inner),
        }
    }

    pub async fn lookup(&self, cluster_id: Uuid) -> Option<ClusterMetadata> {
        self.inner
            .read()
            .await
            .metadata
            .get(&canonical_id(cluster_id))
            .cloned()
    }

    pub async fn upsert(&self, metadata: ClusterMetadata) {
        let mut inner = self.inner.write().await;
        inner
            .metadata
            .insert(canonical_id(metadata.cluster_id), metadata);
        inner.index_dirty = true;
    }

    /// Group all known clusters by their partition's primary (functional)
    /// segment — used by the coordinator to fan saves out per partition.
    pub async fn group_by_primary(&self) -> HashMap<String, Vec<ClusterMetadata>> {
        let inner = self.inner.read().await;
        let mut groups: HashMap<String, Vec<ClusterMetadata>> = HashMap::new();
        for meta in inner.metadata.values() {
            groups
                .entry(meta.partition.functional.as_str().to_string())
                .or_default()
                .push(meta.clone());
        }
        groups
    }

    pub async fn all(&self) -> Vec<ClusterMetadata> {
        self.inner.read().await.metadata.values().cloned().collect()
    }

    /// Fast-path concept lookup via the index, falling back to a linear
    /// Jaccard scan when the index has no hits (§4.4).
    pub async fn find_similar(&self, concepts: &[String], threshold: f64) -> Vec<ClusterReference> {
        let inner = self.inner.read().await;
        let query: HashSet<String> = concepts.iter().map(|c| c.to_lowercase()).collect();

        let mut via_index: HashSet<Uuid> = HashSet::new();
        for concept in &query {
            if let Some(ids) = inner.concept_index.get(concept) {
                via_index.extend(ids.iter().copied());
            }
        }

        if !via_index.is_empty() {
            let mut results: Vec<ClusterReference> = via_index
                .into_iter()
                .filter_map(|id| inner.metadata.get(&canonical_id(id)))
                .map(|meta| ClusterReference {
                    cluster_id: meta.cluster_id,
                    partition: meta.partition,
                    last_accessed: meta.last_accessed,
                    concept_domain: meta.concept_domain.clone(),
                    similarity: 1.0,
                })
                .collect();
            results.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap());
            return results;
        }

        let mut results: Vec<ClusterReference> = inner
            .metadata
            .values()
            .filter_map(|meta| {
                let candidate: HashSet<String> = meta
                    .associated_concepts
                    .iter()
                    .map(|c| c.to_lowercase())
                    .collect();
                let similarity = jaccard(&query, &candidate);
                (similarity >= threshold).then_some(ClusterReference {
                    cluster_id: meta.cluster_id,
                    partition: meta.partition,
                    last_accessed: meta.last_accessed,
                    concept_domain: meta.concept_domain.clone(),
                    similarity,
                })
            })
            .collect();
        results.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap());
        results
    }

    /// Persist the metadata file atomically, rebuilding the concept index
    /// first if it's dirty.
    pub async fn persist(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.index_dirty {
            rebuild_index(&mut inner);
        }
        let encoded = serde_json::to_vec(&inner.metadata)
            .map_err(|e| EngineError::serialization_failure(Uuid::nil(), None, e.to_string()))?;
        crate::storage::file_lock::atomic_write(&self.path, &encoded)
            .await
            .map_err(EngineError::IoFailure)
    }
}

fn rebuild_index(inner: &mut Inner) {
    let mut index: HashMap<String, Vec<Uuid>> = HashMap::new();
    for meta in inner.metadata.values() {
        for concept in &meta.associated_concepts {
            index.entry(concept.to_lowercase()).or_default().push(meta.cluster_id);
        }
    }
    inner.concept_index = index;
    inner.index_dirty = false;
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}
