//! Compact command implementation.

use super::{format_size, open_store};
use crate::error::CliResult;
use std::path::Path;

/// Compaction result for one log.
#[derive(Debug)]
pub struct CompactStats {
    /// Log name.
    pub name: &'static str,
    /// Live keys kept.
    pub live_keys: usize,
    /// Bytes before compaction.
    pub bytes_before: u64,
    /// Bytes after compaction.
    pub bytes_after: u64,
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> CliResult<()> {
    println!("Compacting store at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    for stats in compact(path, dry_run)? {
        println!("{}:", stats.name);
        println!("  Live keys:   {}", stats.live_keys);
        println!("  Size before: {}", format_size(stats.bytes_before));
        println!("  Size after:  {}", format_size(stats.bytes_after));
        println!(
            "  Space saved: {}",
            format_size(stats.bytes_before.saturating_sub(stats.bytes_after))
        );
    }

    Ok(())
}

/// Compacts the entity and queue logs. With `dry_run` only reports the
/// expected sizes.
pub fn compact(path: &Path, dry_run: bool) -> CliResult<Vec<CompactStats>> {
    let store = open_store(path)?;
    let logs = [
        ("Entities", store.open_entities()?, store.entities_path()),
        ("Queue", store.open_queue()?, store.queue_path()),
    ];

    let mut results = Vec::with_capacity(logs.len());
    for (name, log, log_path) in logs {
        let stats = log.stats()?;
        let (bytes_before, bytes_after) = if dry_run {
            (stats.log_bytes, stats.live_bytes)
        } else {
            store.compact(&log, &log_path)?
        };
        results.push(CompactStats {
            name,
            live_keys: stats.live_keys,
            bytes_before,
            bytes_after,
        });
    }
    Ok(results)
}
