//! Membership pack: the per-partition compressed map from cluster id to
//! the neuron ids it contains (§4.3). Also maintains the in-memory
//! membership-pack cache keyed by partition.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::error;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::storage::file_lock::{atomic_write, read_optional, FileLockRegistry};
use crate::storage::{canonical_id, parse_canonical_id};

pub(crate) const PACK_FILE_NAME: &str = "membership.pack.json.gz";

/// On-disk shape of a partition's membership pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipPack {
    /// Canonical cluster id -> canonical neuron ids. Lists are unique and
    /// non-empty; empty lists are dropped entirely on write.
    pub membership: BTreeMap<String, Vec<String>>,
    pub saved_at: DateTime<Utc>,
}

impl Default for MembershipPack {
    fn default() -> Self {
        Self {
            membership: BTreeMap::new(),
            saved_at: Utc::now(),
        }
    }
}

impl MembershipPack {
    pub fn ids_for(&self, cluster_id: Uuid) -> Vec<Uuid> {
        self.membership
            .get(&canonical_id(cluster_id))
            .map(|ids| ids.iter().filter_map(|s| parse_canonical_id(s)).collect())
            .unwrap_or_default()
    }
}

/// Incremental update input: either a diff of newly added neuron ids since
/// the last persist, or the full current id set. The store prefers the diff
/// and falls back to the full set (§4.3).
pub enum MembershipUpdate {
    Diff(Vec<Uuid>),
    Full(Vec<Uuid>),
}

/// Per-partition membership packs, with an in-memory cache keyed by
/// partition directory so repeated reads in one batch avoid re-decoding.
pub struct MembershipPackStore {
    locks: Arc<FileLockRegistry>,
    cache: RwLock<HashMap<PathBuf, MembershipPack>>,
}

impl MembershipPackStore {
    pub fn new(locks: Arc<FileLockRegistry>) -> Self {
        Self {
            locks,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn pack_path(partition_dir: &Path) -> PathBuf {
        partition_dir.join(PACK_FILE_NAME)
    }

    /// Load (from cache, else disk) the pack for a partition.
    pub async fn load(&self, partition_dir: &Path) -> Result<MembershipPack> {
        if let Some(cached) = self.cache.read().await.get(partition_dir) {
            return Ok(cached.clone());
        }
        let pack = self.load_from_disk(partition_dir).await?;
        self.cache
            .write()
            .await
            .insert(partition_dir.to_path_buf(), pack.clone());
        Ok(pack)
    }

    async fn load_from_disk(&self, partition_dir: &Path) -> Result<MembershipPack> {
        let path = Self::pack_path(partition_dir);
        let Some(compressed) = read_optional(&path).await.map_err(EngineError::IoFailure)? else {
            return Ok(MembershipPack::default());
        };
        decode_pack(&path, &compressed)
    }

    /// Apply an update for one cluster within a partition's pack. Returns
    /// `true` iff the pack's on-disk content changed (and was rewritten).
    pub async fn update_cluster(
        &self,
        partition_dir: &Path,
        cluster_id: Uuid,
        update: MembershipUpdate,
    ) -> Result<bool> {
        let changed = self.apply_batch(partition_dir, vec![(cluster_id, update)]).await?;
        Ok(!changed.is_empty())
    }

    /// Apply updates for every cluster in a partition in one lock/read/write
    /// cycle — the batch-save path uses this so a partition with many
    /// clusters only rewrites its pack once per call, not once per cluster.
    /// Returns the ids of the clusters whose membership actually changed
    /// (empty if the pack was left untouched), so callers can report
    /// per-cluster change metrics instead of attributing a whole group's
    /// size to a single pack rewrite.
    pub async fn apply_batch(
        &self,
        partition_dir: &Path,
        updates: Vec<(Uuid, MembershipUpdate)>,
    ) -> Result<Vec<Uuid>> {
        let path = Self::pack_path(partition_dir);
        let lock = self.locks.lock_for(&path);
        let _guard = lock.lock().await;

        let mut pack = self.load_from_disk(partition_dir).await?;
        let mut changed_clusters = Vec::new();

        for (cluster_id, update) in updates {
            let key = canonical_id(cluster_id);
            let existing: Vec<String> = pack.membership.get(&key).cloned().unwrap_or_default();
            let new_ids = apply_update(&existing, update);

            if same_set(&new_ids, &existing) {
                continue;
            }
            changed_clusters.push(cluster_id);
            if new_ids.is_empty() {
                pack.membership.remove(&key);
            } else {
                pack.membership.insert(key, new_ids);
            }
        }

        if changed_clusters.is_empty() {
            return Ok(Vec::new());
        }

        pack.saved_at = Utc::now();
        let encoded = encode_pack(&pack)?;
        atomic_write(&path, &encoded).await.map_err(EngineError::IoFailure)?;
        self.cache
            .write()
            .await
            .insert(partition_dir.to_path_buf(), pack);
        Ok(changed_clusters)
    }
}

fn apply_update(existing: &[String], update: MembershipUpdate) -> Vec<String> {
    match update {
        MembershipUpdate::Diff(added) => {
            let mut merged: Vec<String> = existing.to_vec();
            let mut seen: std::collections::HashSet<String> = merged.iter().cloned().collect();
            for id in added {
                let canonical = canonical_id(id);
                if !Uuid::nil().eq(&id) && seen.insert(canonical.clone()) {
                    merged.push(canonical);
                }
            }
            merged
        }
        MembershipUpdate::Full(ids) => {
            let mut dedup: Vec<String> = Vec::new();
            let mut seen = std::collections::HashSet::new();
            for id in ids {
                let canonical = canonical_id(id);
                if !Uuid::nil().eq(&id) && seen.insert(canonical.clone()) {
                    dedup.push(canonical);
                }
            }
            dedup
        }
    }
}

fn same_set(a: &[String], b: &[String]) -> bool {
    let a: std::collections::HashSet<&String> = a.iter().collect();
    let b: std::collections::HashSet<&String> = b.iter().collect();
    a == b
}

fn encode_pack(pack: &MembershipPack) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(pack)
        .map_err(|e| EngineError::serialization_failure(Uuid::nil(), None, e.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(&json).map_err(EngineError::IoFailure)?;
    encoder.finish().map_err(EngineError::IoFailure)
}

fn decode_pack(path: &Path, compressed: &[u8]) -> Result<MembershipPack> {
    let mut decoder = GzDecoder::new(compressed);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json).map_err(EngineError::IoFailure)?;
    let mut pack: MembershipPack = serde_json::from_slice(&json).map_err(|e| {
        error!(path = %path.display(), error = %e, "membership pack corrupt, propagating to caller");
        EngineError::corrupt_unrecoverable(path, e)
    })?;

    // Normalize keys, dedupe, and drop empty/nil entries on read.
    let mut normalized = BTreeMap::new();
    for (key, ids) in pack.membership {
        let canonical_key = parse_canonical_id(&key).map(canonical_id).unwrap_or(key);
        let mut seen = std::collections::HashSet::new();
        let mut clean_ids = Vec::new();
        for id in ids {
            if let Some(uuid) = parse_canonical_id(&id) {
                if uuid.is_nil() {
                    continue;
                }
                let c = canonical_id(uuid);
                if seen.insert(c.clone()) {
                    clean_ids.push(c);
                }
            }
        }
        if !clean_ids.is_empty() {
            normalized.insert(canonical_key, clean_ids);
        }
    }
    pack.membership = normalized;
    Ok(pack)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MembershipPackStore {
        MembershipPackStore::new(Arc::new(FileLockRegistry::new()))
    }

    #[tokio::test]
    async fn diff_update_merges_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        let cluster = Uuid::new_v4();
        let n1 = Uuid::new_v4();
        let n2 = Uuid::new_v4();

        let changed = store
            .update_cluster(dir.path(), cluster, MembershipUpdate::Diff(vec![n1]))
            .await
            .unwrap();
        assert!(changed);

        let changed = store
            .update_cluster(dir.path(), cluster, MembershipUpdate::Diff(vec![n1, n2]))
            .await
            .unwrap();
        assert!(changed);

        let pack = store.load(dir.path()).await.unwrap();
        let ids = pack.ids_for(cluster);
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn full_update_with_same_set_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        let cluster = Uuid::new_v4();
        let n1 = Uuid::new_v4();

        store
            .update_cluster(dir.path(), cluster, MembershipUpdate::Full(vec![n1]))
            .await
            .unwrap();
        let changed = store
            .update_cluster(dir.path(), cluster, MembershipUpdate::Full(vec![n1]))
            .await
            .unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn empty_membership_list_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        let cluster = Uuid::new_v4();
        store
            .update_cluster(dir.path(), cluster, MembershipUpdate::Full(vec![]))
            .await
            .unwrap();
        let pack = store.load(dir.path()).await.unwrap();
        assert!(pack.ids_for(cluster).is_empty());
        assert!(!dir.path().join(PACK_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn apply_batch_reports_only_the_clusters_that_changed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let n1 = Uuid::new_v4();
        let n2 = Uuid::new_v4();

        store
            .apply_batch(
                dir.path(),
                vec![
                    (c1, MembershipUpdate::Full(vec![n1])),
                    (c2, MembershipUpdate::Full(vec![n2])),
                ],
            )
            .await
            .unwrap();

        // Resave both, but only c2 actually changes.
        let n3 = Uuid::new_v4();
        let changed = store
            .apply_batch(
                dir.path(),
                vec![
                    (c1, MembershipUpdate::Full(vec![n1])),
                    (c2, MembershipUpdate::Full(vec![n2, n3])),
                ],
            )
            .await
            .unwrap();

        assert_eq!(changed, vec![c2]);
    }
}
