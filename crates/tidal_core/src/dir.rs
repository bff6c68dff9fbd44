//! Store directory management.
//!
//! On-disk layout of a persisted Tidal store:
//!
//! ```text
//! <store_path>/
//! ├─ LOCK            # Advisory lock for single-writer
//! ├─ entities.log    # Cached entities of every type
//! └─ queue.log       # Queued operations
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidal_storage::{FileBackend, KvLog};
use tracing::info;

const LOCK_FILE: &str = "LOCK";
const ENTITIES_FILE: &str = "entities.log";
const QUEUE_FILE: &str = "queue.log";
const COMPACT_SUFFIX: &str = "compact";

/// A locked store directory.
///
/// Only one `StoreDir` can hold a directory at a time, across processes.
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens a store directory, optionally creating it.
    ///
    /// # Errors
    ///
    /// Returns `StoreLocked` if another process holds the directory, and
    /// `InvalidFormat` if it is missing (without `create_if_missing`) or
    /// is not a directory.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StoreLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the entity log.
    #[must_use]
    pub fn entities_path(&self) -> PathBuf {
        self.path.join(ENTITIES_FILE)
    }

    /// Returns the path of the queue log.
    #[must_use]
    pub fn queue_path(&self) -> PathBuf {
        self.path.join(QUEUE_FILE)
    }

    /// Opens the entity log.
    pub fn open_entities(&self) -> CoreResult<Arc<KvLog>> {
        open_log(&self.entities_path())
    }

    /// Opens the queue log.
    pub fn open_queue(&self) -> CoreResult<Arc<KvLog>> {
        open_log(&self.queue_path())
    }

    /// Compacts the log at `path` in place, returning `(before, after)`
    /// sizes in bytes.
    ///
    /// Live records are written to a sibling file which then replaces the
    /// original, so a crash leaves either the old or the new log intact.
    pub fn compact(&self, log: &KvLog, path: &Path) -> CoreResult<(u64, u64)> {
        let before = log.stats()?.log_bytes;
        let temp = path.with_extension(COMPACT_SUFFIX);
        if temp.exists() {
            fs::remove_file(&temp)?;
        }
        let stats = log.compact_into(Box::new(FileBackend::open(&temp)?))?;
        fs::rename(&temp, path)?;
        info!(path = %path.display(), before, after = stats.log_bytes, "compacted log");
        Ok((before, stats.log_bytes))
    }
}

fn open_log(path: &Path) -> CoreResult<Arc<KvLog>> {
    let backend = FileBackend::open(path)?;
    Ok(Arc::new(KvLog::open(Box::new(backend))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tidal_storage::KeyValueStore;

    #[test]
    fn creates_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let store = StoreDir::open(&path, true).unwrap();
        assert!(path.join("LOCK").exists());
        assert_eq!(store.queue_path(), path.join("queue.log"));
        assert_eq!(store.entities_path(), path.join("entities.log"));
    }

    #[test]
    fn missing_without_create_fails() {
        let dir = tempdir().unwrap();
        let result = StoreDir::open(&dir.path().join("nope"), false);
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _first = StoreDir::open(dir.path(), true).unwrap();
        let second = StoreDir::open(dir.path(), true);
        assert!(matches!(second, Err(CoreError::StoreLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempdir().unwrap();
        drop(StoreDir::open(dir.path(), true).unwrap());
        assert!(StoreDir::open(dir.path(), true).is_ok());
    }

    #[test]
    fn compact_replaces_log_file() {
        let dir = tempdir().unwrap();
        let store = StoreDir::open(dir.path(), true).unwrap();
        let path = store.queue_path();
        {
            let log = store.open_queue().unwrap();
            for i in 0..20u8 {
                log.put(b"q/hot", &[i; 32]).unwrap();
            }
            let (before, after) = store.compact(&log, &path).unwrap();
            assert!(after < before);
            log.put(b"q/new", b"x").unwrap();
        }

        let log = store.open_queue().unwrap();
        assert_eq!(log.get(b"q/hot").unwrap(), Some(vec![19; 32]));
        assert_eq!(log.get(b"q/new").unwrap(), Some(b"x".to_vec()));
        assert!(!path.with_extension("compact").exists());
    }
}
