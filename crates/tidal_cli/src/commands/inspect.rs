//! Inspect command implementation.

use super::{format_size, open_store};
use crate::error::CliResult;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tidal_core::OperationQueue;
use tidal_storage::{KeyValueStore, KvStats};

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Entity log accounting.
    pub entities_log: LogStats,
    /// Queue log accounting.
    pub queue_log: LogStats,
    /// Cached entity count per entity type.
    pub entity_types: BTreeMap<String, usize>,
    /// Queued operation counts.
    pub queue: QueueCounts,
}

/// Size accounting of one log file.
#[derive(Debug, Serialize)]
pub struct LogStats {
    /// Live keys.
    pub live_keys: usize,
    /// Bytes of live records.
    pub live_bytes: u64,
    /// Bytes in the file.
    pub log_bytes: u64,
    /// Fraction of the file compaction would reclaim.
    pub garbage_ratio: f64,
}

impl From<KvStats> for LogStats {
    fn from(stats: KvStats) -> Self {
        Self {
            live_keys: stats.live_keys,
            live_bytes: stats.live_bytes,
            log_bytes: stats.log_bytes,
            garbage_ratio: stats.garbage_ratio(),
        }
    }
}

/// Queued operation counts by status.
#[derive(Debug, Serialize)]
pub struct QueueCounts {
    /// Waiting to be sent.
    pub pending: usize,
    /// Left in flight by an interrupted cycle.
    pub in_flight: usize,
    /// Waiting for a manual retry.
    pub failed: usize,
    /// Completed ids kept for deduplication.
    pub archived: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> CliResult<()> {
    let result = inspect(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects statistics for the store at `path`.
pub fn inspect(path: &Path) -> CliResult<InspectResult> {
    let store = open_store(path)?;
    let entities = store.open_entities()?;

    let mut entity_types = BTreeMap::new();
    for (key, _) in entities.scan_prefix(b"e/")? {
        let key = String::from_utf8_lossy(&key);
        if let Some((entity_type, _)) = key["e/".len()..].split_once('/') {
            *entity_types.entry(entity_type.to_string()).or_insert(0) += 1;
        }
    }

    let queue_log = store.open_queue()?;
    let queue_stats = queue_log.stats()?;
    let stats = OperationQueue::open(queue_log)?.stats();

    Ok(InspectResult {
        path: path.display().to_string(),
        entities_log: entities.stats()?.into(),
        queue_log: queue_stats.into(),
        entity_types,
        queue: QueueCounts {
            pending: stats.pending,
            in_flight: stats.in_flight,
            failed: stats.failed,
            archived: stats.archived,
        },
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Tidal Store Inspection");
    println!("======================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Storage:");
    print_log("Entities", &result.entities_log);
    print_log("Queue", &result.queue_log);
    println!();
    println!("Entities:");
    if result.entity_types.is_empty() {
        println!("  (none)");
    }
    for (entity_type, count) in &result.entity_types {
        println!("  {entity_type:<16} {count}");
    }
    println!();
    println!("Queue:");
    println!("  Pending:   {}", result.queue.pending);
    println!("  In flight: {}", result.queue.in_flight);
    println!("  Failed:    {}", result.queue.failed);
    println!("  Archived:  {}", result.queue.archived);
}

fn print_log(name: &str, stats: &LogStats) {
    println!(
        "  {name:<9} {} ({} live keys, {:.1}% garbage)",
        format_size(stats.log_bytes),
        stats.live_keys,
        stats.garbage_ratio * 100.0
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::seed_store;
    use crate::error::CliError;
    use tempfile::tempdir;

    #[test]
    fn counts_entities_and_operations() {
        let dir = tempdir().unwrap();
        seed_store(dir.path(), 3);

        let result = inspect(dir.path()).unwrap();
        assert_eq!(result.entity_types.get("note"), Some(&1));
        assert_eq!(result.queue.pending, 2);
        assert_eq!(result.queue.failed, 1);
        assert_eq!(result.queue_log.live_keys, 3);
    }

    #[test]
    fn missing_store_is_an_error() {
        let dir = tempdir().unwrap();
        let result = inspect(&dir.path().join("absent"));
        assert!(matches!(result, Err(CliError::NoStore(_))));
    }
}
