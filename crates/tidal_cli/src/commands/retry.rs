//! Retry command implementation.

use super::{open_queue, open_store};
use crate::error::{CliError, CliResult};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tidal_core::{
    Clock, CoreError, EntityStore, OpId, OpStatus, QueuedOperation, StoreDir, SyncStatus,
    SystemClock,
};
use tidal_storage::KeyValueStore;
use tracing::{debug, info};

/// Runs the retry command.
pub fn run(path: &Path, op: Option<&str>) -> CliResult<()> {
    let count = retry(path, op)?;
    println!("Reset {count} operation(s) for retry");
    Ok(())
}

/// Resets one operation, or every failed one, returning how many were
/// reset. Cached entities of the reset operations go back to `Pending`.
pub fn retry(path: &Path, op: Option<&str>) -> CliResult<usize> {
    let store = open_store(path)?;
    let queue = open_queue(&store)?;
    let now = SystemClock.now();

    let reset = match op {
        Some(input) => {
            let op_id = input
                .parse::<OpId>()
                .map_err(|e| CliError::InvalidOpId {
                    input: input.to_string(),
                    reason: e.to_string(),
                })?;
            let op = queue.retry(&op_id, now)?;
            info!(op_id = %op.op_id, entity = %op.entity_id, "operation reset");
            vec![op]
        }
        None => {
            let failed: Vec<_> = queue
                .list()
                .into_iter()
                .filter(|op| op.status == OpStatus::Failed)
                .collect();
            let count = queue.retry_all_failed(now)?;
            info!(count, "failed operations reset");
            failed
        }
    };

    mark_pending(&store, &reset)?;
    Ok(reset.len())
}

/// Sets the cached entities targeted by `ops` to `Pending`.
fn mark_pending(store: &StoreDir, ops: &[QueuedOperation]) -> CliResult<()> {
    let mut by_type: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for op in ops {
        by_type
            .entry(op.entity_type.as_str())
            .or_default()
            .insert(op.entity_id.as_str());
    }
    if by_type.is_empty() {
        return Ok(());
    }

    let kv: Arc<dyn KeyValueStore> = store.open_entities()?;
    for (entity_type, ids) in by_type {
        let entities = EntityStore::<serde_json::Value>::open(entity_type, kv.clone())?;
        for id in ids {
            match entities.mark_status(id, SyncStatus::Pending) {
                Ok(()) => debug!(entity_type, entity_id = id, "entity marked pending"),
                Err(CoreError::EntityNotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}
