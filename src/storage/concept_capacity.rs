//! Concept capacity store: a tiny atomic JSON file of `concept -> targetCapacity` (§4.9).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{EngineError, Result};
use crate::storage::file_lock::atomic_write;

const CAPACITY_FILE_NAME: &str = "concept_capacity.json";

pub struct ConceptCapacityStore {
    path: PathBuf,
}

impl ConceptCapacityStore {
    pub fn new(hierarchical_dir: &Path) -> Self {
        Self {
            path: hierarchical_dir.join(CAPACITY_FILE_NAME),
        }
    }

    /// Returns an empty, case-insensitive-keyed map on any read or parse
    /// error (recoverable corruption).
    pub async fn load(&self) -> HashMap<String, i64> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(_) => return HashMap::new(),
        };
        match serde_json::from_slice::<HashMap<String, i64>>(&bytes) {
            Ok(raw) => raw.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "concept capacity file corrupt, resetting to empty");
                HashMap::new()
            }
        }
    }

    pub async fn save(&self, capacities: &HashMap<String, i64>) -> Result<()> {
        let encoded = serde_json::to_vec(capacities)
            .map_err(|e| EngineError::corrupt_recoverable(&self.path, e))?;
        atomic_write(&self.path, &encoded).await.map_err(EngineError::IoFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConceptCapacityStore::new(dir.path());
        let mut caps = HashMap::new();
        caps.insert("cat".to_string(), 100);
        store.save(&caps).await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.get("cat"), Some(&100));
    }

    #[tokio::test]
    async fn missing_file_yields_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConceptCapacityStore::new(dir.path());
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_yields_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(CAPACITY_FILE_NAME), b"not json")
            .await
            .unwrap();
        let store = ConceptCapacityStore::new(dir.path());
        assert!(store.load().await.is_empty());
    }
}
