//! Tidal CLI
//!
//! Command-line tools for inspecting and repairing a persisted Tidal store.
//!
//! # Commands
//!
//! - `inspect` - Display log sizes, cached entities and queue counts
//! - `dump-queue` - List queued operations in sequence order
//! - `retry` - Reset failed operations for another attempt
//! - `compact` - Rewrite both logs keeping only live records
//!
//! The store must not be open in a running application: every command
//! takes the directory lock.

mod commands;
mod error;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Tidal offline store tools.
#[derive(Parser)]
#[command(name = "tidal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store statistics
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List queued operations
    DumpQueue {
        /// Maximum number of operations to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Reset failed operations for another attempt
    Retry {
        /// Retry only this operation (UUID); all failed operations otherwise
        #[arg(short, long)]
        op: Option<String>,
    },

    /// Compact both logs to reclaim space
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::DumpQueue { limit, format } => {
            let path = cli.path.ok_or("Store path required for dump-queue")?;
            commands::dump_queue::run(&path, limit, &format)?;
        }
        Commands::Retry { op } => {
            let path = cli.path.ok_or("Store path required for retry")?;
            commands::retry::run(&path, op.as_deref())?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("Tidal CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
