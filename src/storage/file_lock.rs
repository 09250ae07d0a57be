//! Per-file mutex registry and the atomic tmp+rename write helper shared by
//! the neuron bank, membership pack, and concept capacity stores.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

/// Process-wide map from absolute path to a mutex guarding writes to that
/// path. At most one writer per bank/pack/capacity file at a time; readers
/// do not take this lock (see §5 of the spec).
#[derive(Debug, Default)]
pub struct FileLockRegistry {
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FileLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (creating if absent) the mutex for `path`. `path` should already
    /// be absolute/canonical; callers are responsible for normalization so
    /// two different-but-equal paths don't get distinct locks.
    pub fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("file lock registry poisoned");
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Write `bytes` to `path` atomically: write to `path.tmp`, then rename over
/// the final path. If the process dies between the two steps, readers
/// observe either the old file or nothing (never a torn write) — see the
/// crash-safety discussion in §5.
///
/// Callers must already hold the `FileLockRegistry` mutex for `path`.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    tokio::fs::write(&tmp_path, bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Read `path`, returning `Ok(None)` for a missing file (tolerating the brief
/// window between an old file's delete and the new file's rename) rather
/// than treating it as an error.
pub async fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
