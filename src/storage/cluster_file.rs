//! Per-cluster file: written by `saveClusterWithPartitioning`, read back by
//! the non-UUID fallback branch of `loadClusterWithPartitioning` (§4.6, §4.7).
//!
//! The file carries `(partitionPath, metadata, neuronIds)` with an empty
//! embedded snapshot list — the neuron payload itself always lives in the
//! partition's bank, never duplicated here.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::ClusterMetadata;
use crate::partition::{Functional, PartitionPath, Plasticity, Temporal, Topology};
use crate::storage::canonical_id;
use crate::storage::file_lock::atomic_write;

const SUFFIX_PLAIN: &str = ".cluster";
const SUFFIX_GZ: &str = ".cluster.gz";

/// On-disk shape of a cluster's standalone file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterFileRecord {
    pub partition: PartitionPath,
    pub metadata: ClusterMetadata,
    /// Canonical (hex-32) neuron ids; the bank holds the actual snapshots.
    pub neuron_ids: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

impl ClusterFileRecord {
    pub fn neuron_uuids(&self) -> Vec<Uuid> {
        self.neuron_ids
            .iter()
            .filter_map(|s| crate::storage::parse_canonical_id(s))
            .collect()
    }
}

fn file_name(domain: &str, cluster_id: Uuid, compress: bool) -> String {
    let canonical = canonical_id(cluster_id);
    let suffix = if compress { SUFFIX_GZ } else { SUFFIX_PLAIN };
    format!("{domain}_{canonical}{suffix}")
}

/// Write the per-cluster file for `cluster_id` into `partition_dir`,
/// overwriting any prior copy atomically.
pub async fn write(
    partition_dir: &Path,
    domain: &str,
    cluster_id: Uuid,
    metadata: ClusterMetadata,
    neuron_ids: &[Uuid],
    compress: bool,
) -> Result<PathBuf> {
    let record = ClusterFileRecord {
        partition: metadata.partition,
        metadata,
        neuron_ids: neuron_ids.iter().copied().map(canonical_id).collect(),
        saved_at: Utc::now(),
    };

    let json = serde_json::to_vec(&record)
        .map_err(|e| EngineError::serialization_failure(cluster_id, None, e.to_string()))?;
    let bytes = if compress { gzip(&json)? } else { json };

    let path = partition_dir.join(file_name(domain, cluster_id, compress));
    atomic_write(&path, &bytes).await.map_err(EngineError::IoFailure)?;
    Ok(path)
}

fn gzip(json: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(json).map_err(EngineError::IoFailure)?;
    encoder.finish().map_err(EngineError::IoFailure)
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(EngineError::IoFailure)?;
    Ok(out)
}

const FUNCTIONAL_VOCAB: [Functional; 5] = [
    Functional::Sensory,
    Functional::Motor,
    Functional::Memory,
    Functional::Association,
    Functional::General,
];
const PLASTICITY_VOCAB: [Plasticity; 5] = [
    Plasticity::HighAdaptive,
    Plasticity::ModeratePlastic,
    Plasticity::LowFatigued,
    Plasticity::StableMature,
    Plasticity::Baseline,
];
const TOPOLOGY_VOCAB: [Topology; 5] = [
    Topology::Hub,
    Topology::Bridge,
    Topology::Specialized,
    Topology::Modular,
    Topology::Peripheral,
];
const TEMPORAL_VOCAB: [Temporal; 5] = [
    Temporal::ActiveFrequent,
    Temporal::RecentModerate,
    Temporal::ArchivedRecent,
    Temporal::ConsolidatedImportant,
    Temporal::Dormant,
];

/// Enumerate every candidate partition path (the Cartesian product of the
/// four closed vocabularies, §6) and search each for a `.cluster`/`.cluster.gz`
/// file whose name contains `identifier` (§4.7 step 2). Returns the first
/// match found; partition iteration order is fixed but otherwise arbitrary,
/// since at most one cluster file should ever match a given identifier.
pub async fn find_by_identifier(hierarchical_dir: &Path, identifier: &str) -> Result<Option<ClusterFileRecord>> {
    for functional in FUNCTIONAL_VOCAB {
        for plasticity in PLASTICITY_VOCAB {
            for topology in TOPOLOGY_VOCAB {
                for temporal in TEMPORAL_VOCAB {
                    let partition = PartitionPath {
                        functional,
                        plasticity,
                        topology,
                        temporal,
                    };
                    let dir = hierarchical_dir.join(partition.relative_dir());
                    if let Some(record) = search_dir(&dir, identifier).await? {
                        return Ok(Some(record));
                    }
                }
            }
        }
    }
    Ok(None)
}

async fn search_dir(dir: &Path, identifier: &str) -> Result<Option<ClusterFileRecord>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return Ok(None),
    };

    while let Some(entry) = entries.next_entry().await.map_err(EngineError::IoFailure)? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let is_gz = name.ends_with(SUFFIX_GZ);
        let is_plain = !is_gz && name.ends_with(SUFFIX_PLAIN);
        if (!is_gz && !is_plain) || !name.contains(identifier) {
            continue;
        }

        let path = entry.path();
        let raw = tokio::fs::read(&path).await.map_err(EngineError::IoFailure)?;
        let json = if is_gz { gunzip(&raw)? } else { raw };
        let record: ClusterFileRecord = serde_json::from_slice(&json).map_err(|e| {
            error!(path = %path.display(), error = %e, "cluster file corrupt, propagating to caller");
            EngineError::corrupt_unrecoverable(&path, e)
        })?;
        return Ok(Some(record));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_find_by_identifier_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cluster_id = Uuid::new_v4();
        let neuron_id = Uuid::new_v4();
        let metadata = ClusterMetadata::new(cluster_id, "animals", PartitionPath::sentinel());
        let partition_dir = dir.path().join(PartitionPath::sentinel().relative_dir());

        write(&partition_dir, "animals", cluster_id, metadata, &[neuron_id], true)
            .await
            .unwrap();

        let found = find_by_identifier(dir.path(), &canonical_id(cluster_id))
            .await
            .unwrap()
            .expect("cluster file should be found");
        assert_eq!(found.neuron_uuids(), vec![neuron_id]);
    }

    #[tokio::test]
    async fn uncompressed_file_round_trips_too() {
        let dir = tempfile::tempdir().unwrap();
        let cluster_id = Uuid::new_v4();
        let metadata = ClusterMetadata::new(cluster_id, "animals", PartitionPath::sentinel());
        let partition_dir = dir.path().join(PartitionPath::sentinel().relative_dir());

        write(&partition_dir, "animals", cluster_id, metadata, &[], false)
            .await
            .unwrap();

        let found = find_by_identifier(dir.path(), &canonical_id(cluster_id))
            .await
            .unwrap()
            .expect("cluster file should be found");
        assert!(found.neuron_uuids().is_empty());
    }

    #[tokio::test]
    async fn unknown_identifier_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join(PartitionPath::sentinel().relative_dir()))
            .await
            .unwrap();
        assert!(find_by_identifier(dir.path(), "nonexistent").await.unwrap().is_none());
    }
}
