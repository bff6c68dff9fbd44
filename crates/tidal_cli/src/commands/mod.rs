//! CLI command implementations.

pub mod compact;
pub mod dump_queue;
pub mod inspect;
pub mod retry;

use crate::error::{CliError, CliResult};
use std::path::Path;
use tidal_core::{OperationQueue, StoreDir};

/// Opens an existing store directory without creating it.
pub(crate) fn open_store(path: &Path) -> CliResult<StoreDir> {
    if !path.is_dir() {
        return Err(CliError::NoStore(path.to_path_buf()));
    }
    Ok(StoreDir::open(path, false)?)
}

/// Loads the persisted operation queue of a store.
pub(crate) fn open_queue(store: &StoreDir) -> CliResult<OperationQueue> {
    Ok(OperationQueue::open(store.open_queue()?)?)
}

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.2} MiB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use tidal_core::{
        CachedEntity, EntityStore, OpId, OpKind, OperationQueue, QueuedOperation, StoreDir,
        SyncStatus, Timestamp,
    };

    /// Creates a store at `path` with one cached `Failed` entity and `ops`
    /// queued updates of distinct entities, the first of them failed.
    pub fn seed_store(path: &Path, ops: usize) -> Vec<OpId> {
        let store = StoreDir::open(path, true).unwrap();
        let entities =
            EntityStore::<serde_json::Value>::open("note", store.open_entities().unwrap()).unwrap();
        entities
            .upsert(CachedEntity::pending("n0", serde_json::json!({ "body": 0 })))
            .unwrap();
        entities.mark_status("n0", SyncStatus::Failed).unwrap();

        let queue = OperationQueue::open(store.open_queue().unwrap()).unwrap();
        let now = Timestamp::from_millis(1_000);
        let mut ids = Vec::new();
        for i in 0..ops {
            let op = QueuedOperation::new(
                "note",
                format!("n{i}"),
                OpKind::Update,
                serde_json::json!({ "body": i }),
                now,
            );
            ids.push(queue.enqueue(op).unwrap());
        }
        if let Some(first) = ids.first() {
            queue.claim_next_ready(now).unwrap();
            queue.fail_permanently(first, "rejected").unwrap();
        }
        ids
    }

    /// Returns the sync status of a cached note.
    pub fn note_status(path: &Path, id: &str) -> Option<SyncStatus> {
        let store = StoreDir::open(path, false).unwrap();
        let entities =
            EntityStore::<serde_json::Value>::open("note", store.open_entities().unwrap()).unwrap();
        entities.get(id).map(|entity| entity.sync_status)
    }
}
