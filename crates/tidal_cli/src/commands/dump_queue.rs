//! Dump queue command implementation.

use super::{open_queue, open_store};
use crate::error::CliResult;
use std::path::Path;
use tidal_core::QueuedOperation;

/// Runs the dump-queue command.
pub fn run(path: &Path, limit: Option<usize>, format: &str) -> CliResult<()> {
    let ops = read_operations(path, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&ops)?);
        }
        _ => {
            print_text_output(&ops);
        }
    }

    Ok(())
}

/// Reads unfinished operations in sequence order.
pub fn read_operations(path: &Path, limit: Option<usize>) -> CliResult<Vec<QueuedOperation>> {
    let store = open_store(path)?;
    let queue = open_queue(&store)?;
    Ok(queue
        .list()
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .collect())
}

fn print_text_output(ops: &[QueuedOperation]) {
    println!(
        "{:>6}  {:<36}  {:<8}  {:<8}  {:>8}  ENTITY",
        "SEQ", "OP", "KIND", "STATUS", "ATTEMPTS"
    );
    for op in ops {
        println!(
            "{:>6}  {:<36}  {:<8}  {:<8}  {:>4}/{:<3}  {}/{}",
            op.seq,
            op.op_id,
            format!("{:?}", op.kind),
            format!("{:?}", op.status),
            op.attempt_count,
            op.max_attempts,
            op.entity_type,
            op.entity_id
        );
        if let Some(error) = &op.last_error {
            println!("        last error: {error}");
        }
    }
    println!();
    println!("{} operation(s)", ops.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::seed_store;
    use tempfile::tempdir;
    use tidal_core::OpStatus;

    #[test]
    fn lists_in_sequence_order() {
        let dir = tempdir().unwrap();
        let ids = seed_store(dir.path(), 3);

        let ops = read_operations(dir.path(), None).unwrap();
        let listed: Vec<_> = ops.iter().map(|op| op.op_id).collect();
        assert_eq!(listed, ids);
        assert_eq!(ops[0].status, OpStatus::Failed);
        assert_eq!(ops[0].last_error.as_deref(), Some("rejected"));
    }

    #[test]
    fn limit_truncates() {
        let dir = tempdir().unwrap();
        seed_store(dir.path(), 3);
        assert_eq!(read_operations(dir.path(), Some(2)).unwrap().len(), 2);
    }
}
