//! Error types for Tidal core.

use crate::queue::OpStatus;
use crate::types::OpId;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Tidal core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tidal_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A persisted row could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// Entity not found in the store.
    #[error("entity not found: {entity_type}/{entity_id}")]
    EntityNotFound {
        /// Entity type of the store searched.
        entity_type: String,
        /// The entity id that was not found.
        entity_id: String,
    },

    /// Operation not found in the queue.
    #[error("operation not found: {op_id}")]
    OperationNotFound {
        /// The operation id.
        op_id: OpId,
    },

    /// Another operation for the same entity is already in flight.
    #[error("operation {op_id} blocked: {entity_type}/{entity_id} already has an operation in flight")]
    AlreadyInFlight {
        /// The operation that could not be marked.
        op_id: OpId,
        /// Entity type.
        entity_type: String,
        /// Entity id.
        entity_id: String,
    },

    /// The operation's status does not allow the requested action.
    #[error("cannot {action} operation {op_id} in status {status:?}")]
    InvalidTransition {
        /// The operation id.
        op_id: OpId,
        /// Current status.
        status: OpStatus,
        /// Action that was attempted.
        action: &'static str,
    },

    /// An entity cannot be marked synced without a remote etag.
    #[error("entity {entity_type}/{entity_id} has no remote etag")]
    MissingEtag {
        /// Entity type.
        entity_type: String,
        /// Entity id.
        entity_id: String,
    },

    /// The store directory is held by another process.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,

    /// Invalid on-disk layout.
    #[error("invalid store format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an entity-not-found error.
    pub fn entity_not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::EntityNotFound {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Creates an invalid-format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Returns true for errors caused by a missing entity or operation.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::EntityNotFound { .. } | Self::OperationNotFound { .. }
        )
    }
}
