//! CLI error type.

use std::path::PathBuf;
use thiserror::Error;
use tidal_core::CoreError;

/// Errors raised by the maintenance commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The store could not be opened or updated.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Storage backend error.
    #[error(transparent)]
    Storage(#[from] tidal_storage::StorageError),

    /// No store exists at the given path.
    #[error("no store found at {}", .0.display())]
    NoStore(PathBuf),

    /// The operation id is not a valid UUID.
    #[error("invalid operation id {input:?}: {reason}")]
    InvalidOpId {
        /// The id as given.
        input: String,
        /// Parse failure.
        reason: String,
    },

    /// Output could not be rendered.
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),
}

/// Result alias for CLI commands.
pub type CliResult<T> = Result<T, CliError>;
