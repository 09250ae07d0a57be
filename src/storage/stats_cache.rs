//! Stats cache: cached storage statistics with lazy background refresh, so
//! `getStats` never itself scans the filesystem (§4.5).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::storage::file_lock::atomic_write;

const STATS_FILE_NAME: &str = "storage_stats.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub cluster_count: usize,
    pub base_bytes: u64,
    pub hierarchical_bytes: u64,
    pub last_updated_utc: DateTime<Utc>,
}

impl Default for StorageStats {
    fn default() -> Self {
        Self {
            cluster_count: 0,
            base_bytes: 0,
            hierarchical_bytes: 0,
            last_updated_utc: Utc::now(),
        }
    }
}

pub struct StatsCache {
    path: PathBuf,
    hierarchical_dir: PathBuf,
    cached: RwLock<StorageStats>,
    refreshing: Arc<AtomicBool>,
}

impl StatsCache {
    pub async fn load(hierarchical_dir: &Path) -> Self {
        let path = hierarchical_dir.join(STATS_FILE_NAME);
        let cached = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<StorageStats>(&bytes) {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "storage stats cache corrupt, resetting to empty");
                    StorageStats::default()
                }
            },
            Err(_) => StorageStats::default(),
        };

        Self {
            path,
            hierarchical_dir: hierarchical_dir.to_path_buf(),
            cached: RwLock::new(cached),
            refreshing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Never scans the filesystem: returns the cached values, substituting
    /// `max(cachedCount, currentMetadataCount)` for the cluster count.
    pub async fn get_stats(&self, current_metadata_count: usize) -> StorageStats {
        let mut stats = self.cached.read().await.clone();
        stats.cluster_count = stats.cluster_count.max(current_metadata_count);
        stats
    }

    /// Hierarchical efficiency: ratio of distinct partitions in use to the
    /// theoretical maximum, clamped to [0, 1] (§4.10, invariant 6).
    pub fn hierarchical_efficiency(distinct_partitions_in_use: usize, vocab_sizes: (usize, usize, usize, usize)) -> f64 {
        let (f, p, t, q) = vocab_sizes;
        let max = (f * p * t * q).max(1);
        (distinct_partitions_in_use as f64 / max as f64).clamp(0.0, 1.0)
    }

    /// Launch a background refresh if one isn't already in flight. At most
    /// one refresh runs at a time (§4.5); returns immediately if a refresh
    /// is already running.
    pub async fn refresh_if_idle(&self) {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let hierarchical_dir = self.hierarchical_dir.clone();
        let bytes = tokio::task::spawn_blocking(move || sum_tree_bytes(&hierarchical_dir))
            .await
            .unwrap_or(0);

        let mut stats = self.cached.write().await;
        stats.hierarchical_bytes = bytes;
        stats.base_bytes = bytes;
        stats.last_updated_utc = Utc::now();

        if let Ok(encoded) = serde_json::to_vec(&*stats) {
            let _ = atomic_write(&self.path, &encoded).await;
        }

        self.refreshing.store(false, Ordering::SeqCst);
    }

    pub async fn invalidate_cluster_count(&self, cluster_count: usize) -> Result<()> {
        let mut stats = self.cached.write().await;
        stats.cluster_count = cluster_count;
        let encoded = serde_json::to_vec(&*stats)
            .map_err(|e| EngineError::corrupt_recoverable(&self.path, e))?;
        atomic_write(&self.path, &encoded).await.map_err(EngineError::IoFailure)
    }
}

fn sum_tree_bytes(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}
