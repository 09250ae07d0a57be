//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tunables for the storage engine.
///
/// Embedders construct this directly; the engine does not read environment
/// variables or a config file of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Root directory the engine owns exclusively (the `hierarchical/` tree
    /// in §6 of the spec is created under this path).
    pub base_dir: PathBuf,
    /// Upper bound on concurrent per-partition save operations in a batch.
    /// Defaults to 2, tuned for a high-latency networked filesystem.
    #[serde(default = "default_max_parallel_saves")]
    pub max_parallel_saves: usize,
    /// Whether neuron banks and membership packs are gzip-compressed.
    #[serde(default = "default_compress_clusters")]
    pub compress_clusters: bool,
}

fn default_max_parallel_saves() -> usize {
    2
}

fn default_compress_clusters() -> bool {
    true
}

impl EngineConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_parallel_saves: default_max_parallel_saves(),
            compress_clusters: default_compress_clusters(),
        }
    }

    /// Directory holding `partition_metadata.json`, `storage_stats.json`,
    /// `concept_capacity.json`, and the `functional/.../` partition tree.
    pub fn hierarchical_dir(&self) -> PathBuf {
        self.base_dir.join("hierarchical")
    }
}
