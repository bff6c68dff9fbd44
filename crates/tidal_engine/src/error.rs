//! Error types for the sync engine.

use crate::gateway::GatewayError;
use thiserror::Error;
use tidal_core::OpId;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Transient network failure; retried with backoff.
    #[error("network error: {0}")]
    Network(String),

    /// The remote diverged from the local base version.
    #[error("conflict on {entity_type}/{entity_id}")]
    Conflict {
        /// Entity type.
        entity_type: String,
        /// Entity id.
        entity_id: String,
    },

    /// The remote rejected a payload; not retried.
    #[error("validation failed: {message}")]
    Validation {
        /// Rejection message.
        message: String,
    },

    /// The remote requires re-authentication.
    #[error("authentication required for {entity_type}: {message}")]
    Auth {
        /// Entity type whose operations are paused.
        entity_type: String,
        /// Message from the remote.
        message: String,
    },

    /// An operation used up its attempts.
    #[error("operation {op_id} failed after {attempts} attempts")]
    ExhaustedRetries {
        /// The operation.
        op_id: OpId,
        /// Attempts made.
        attempts: u32,
    },

    /// The work was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The network monitor reports offline.
    #[error("offline")]
    Offline,

    /// No gateway is registered for an entity type.
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    /// No tokio runtime is available to run background work.
    #[error("no async runtime available")]
    NoRuntime,

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] tidal_core::CoreError),
}

impl SyncError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Returns true if this error is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Offline)
    }

    /// Maps a gateway failure for one entity into the error taxonomy.
    pub fn from_gateway(err: GatewayError, entity_type: &str, entity_id: &str) -> Self {
        match err {
            GatewayError::Network(message) => SyncError::Network(message),
            GatewayError::Validation(message) => SyncError::Validation { message },
            GatewayError::Auth(message) => SyncError::Auth {
                entity_type: entity_type.to_string(),
                message,
            },
            GatewayError::Conflict { .. } => SyncError::Conflict {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
            },
            GatewayError::NotFound => {
                SyncError::validation(format!("{entity_type}/{entity_id} not found remotely"))
            }
            GatewayError::Cancelled => SyncError::Cancelled,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::validation(format!("payload encoding: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::Network("reset".into()).is_retryable());
        assert!(SyncError::Offline.is_retryable());
        assert!(!SyncError::validation("bad price").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn gateway_errors_map_into_taxonomy() {
        let map = |err| SyncError::from_gateway(err, "product", "p1");
        assert!(matches!(map(GatewayError::Network("down".into())), SyncError::Network(_)));
        assert!(matches!(map(GatewayError::Cancelled), SyncError::Cancelled));
        assert!(matches!(map(GatewayError::NotFound), SyncError::Validation { .. }));

        match map(GatewayError::Auth("expired".into())) {
            SyncError::Auth { entity_type, .. } => assert_eq!(entity_type, "product"),
            other => panic!("unexpected {other:?}"),
        }
        match map(GatewayError::Conflict { current_etag: None }) {
            SyncError::Conflict { entity_id, .. } => assert_eq!(entity_id, "p1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_display() {
        let err = SyncError::UnknownEntityType("widget".into());
        assert_eq!(err.to_string(), "unknown entity type: widget");
    }
}
