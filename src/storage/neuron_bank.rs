//! Neuron bank: the per-partition compressed keyed store of neuron
//! snapshots (§4.2).

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::error;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::NeuronSnapshot;
use crate::storage::file_lock::{atomic_write, read_optional, FileLockRegistry};
use crate::storage::{canonical_id, parse_canonical_id};

pub(crate) const BANK_FILE_NAME: &str = "neurons.bank.json.gz";

/// Per-partition neuron bank. One bank file per partition directory.
pub struct NeuronBank {
    locks: Arc<FileLockRegistry>,
}

impl NeuronBank {
    pub fn new(locks: Arc<FileLockRegistry>) -> Self {
        Self { locks }
    }

    fn bank_path(partition_dir: &Path) -> PathBuf {
        partition_dir.join(BANK_FILE_NAME)
    }

    /// Load the full map for a partition. Missing file -> empty map.
    /// Malformed file -> `CorruptStateUnrecoverable`.
    async fn load_map(&self, partition_dir: &Path) -> Result<BTreeMap<String, NeuronSnapshot>> {
        let path = Self::bank_path(partition_dir);
        let Some(compressed) = read_optional(&path).await.map_err(EngineError::IoFailure)? else {
            return Ok(BTreeMap::new());
        };
        decode_bank(&path, &compressed)
    }

    /// Load specific neuron ids from a partition's bank. Missing ids are
    /// silently omitted.
    pub async fn load(&self, partition_dir: &Path, ids: &[Uuid]) -> Result<Vec<NeuronSnapshot>> {
        let map = self.load_map(partition_dir).await?;
        Ok(ids
            .iter()
            .filter_map(|id| map.get(&canonical_id(*id)))
            .cloned()
            .collect())
    }

    /// Upsert `neurons` into the partition's bank. Rewrites the file iff at
    /// least one entry changed or was newly added; otherwise performs zero
    /// I/O beyond the initial read.
    ///
    /// Returns the number of neurons actually written (0 if nothing changed).
    pub async fn upsert(&self, partition_dir: &Path, neurons: &[NeuronSnapshot]) -> Result<usize> {
        for n in neurons {
            if !n.has_finite_weights() {
                error!(neuron_id = %n.id, "non-finite weight or importance, aborting upsert for this partition");
                return Err(EngineError::serialization_failure(
                    n.id,
                    Some("inputWeights".to_string()),
                    "non-finite weight or importance",
                ));
            }
        }

        let path = Self::bank_path(partition_dir);
        let lock = self.locks.lock_for(&path);
        let _guard = lock.lock().await;

        let mut map = self.load_map(partition_dir).await?;
        let mut changed = 0usize;
        for n in neurons {
            let key = canonical_id(n.id);
            let is_new = match map.get(&key) {
                Some(existing) => !snapshots_equal(existing, n),
                None => true,
            };
            if is_new {
                map.insert(key, n.clone());
                changed += 1;
            }
        }

        if changed == 0 {
            return Ok(0);
        }

        let encoded = encode_bank(&map)?;
        atomic_write(&path, &encoded).await.map_err(EngineError::IoFailure)?;
        Ok(changed)
    }
}

/// Value-equality modulo the canonical id encoding; used to decide whether
/// an upsert actually changes stored state.
fn snapshots_equal(a: &NeuronSnapshot, b: &NeuronSnapshot) -> bool {
    serde_json::to_vec(a).ok() == serde_json::to_vec(b).ok()
}

fn encode_bank(map: &BTreeMap<String, NeuronSnapshot>) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(map).map_err(|e| {
        EngineError::serialization_failure(Uuid::nil(), None, format!("bank encode failed: {e}"))
    })?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(&json).map_err(EngineError::IoFailure)?;
    encoder.finish().map_err(EngineError::IoFailure)
}

fn decode_bank(path: &Path, compressed: &[u8]) -> Result<BTreeMap<String, NeuronSnapshot>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(EngineError::IoFailure)?;

    // Last-writer-wins on duplicate keys; normalize hyphenated ids on read.
    let raw: BTreeMap<String, NeuronSnapshot> = serde_json::from_slice(&json).map_err(|e| {
        error!(path = %path.display(), error = %e, "neuron bank corrupt, propagating to caller");
        EngineError::corrupt_unrecoverable(path, e)
    })?;
    let mut normalized = BTreeMap::new();
    for (key, snapshot) in raw {
        let canonical = parse_canonical_id(&key)
            .map(canonical_id)
            .unwrap_or(key);
        normalized.insert(canonical, snapshot);
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NeuronSnapshot;

    fn bank() -> NeuronBank {
        NeuronBank::new(Arc::new(FileLockRegistry::new()))
    }

    #[tokio::test]
    async fn upsert_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let bank = bank();
        let n = NeuronSnapshot::new("cat");
        let written = bank.upsert(dir.path(), &[n.clone()]).await.unwrap();
        assert_eq!(written, 1);

        let loaded = bank.load(dir.path(), &[n.id]).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, n.id);
    }

    #[tokio::test]
    async fn second_upsert_with_no_changes_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let bank = bank();
        let n = NeuronSnapshot::new("cat");
        bank.upsert(dir.path(), &[n.clone()]).await.unwrap();
        let written = bank.upsert(dir.path(), &[n.clone()]).await.unwrap();
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn missing_ids_are_omitted_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let bank = bank();
        let loaded = bank.load(dir.path(), &[Uuid::new_v4()]).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn rejects_non_finite_weight() {
        let dir = tempfile::tempdir().unwrap();
        let bank = bank();
        let mut n = NeuronSnapshot::new("cat");
        n.input_weights.insert(Uuid::new_v4(), f64::NAN);
        let err = bank.upsert(dir.path(), &[n]).await.unwrap_err();
        assert!(matches!(err, EngineError::SerializationFailure { .. }));
    }

    #[tokio::test]
    async fn corrupt_bank_file_is_unrecoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BANK_FILE_NAME);
        tokio::fs::write(&path, b"not gzip").await.unwrap();
        let bank = bank();
        let err = bank.load(dir.path(), &[Uuid::new_v4()]).await.unwrap_err();
        assert!(matches!(err, EngineError::IoFailure(_)));
    }
}
