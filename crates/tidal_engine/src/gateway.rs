//! Remote gateway abstraction.
//!
//! The gateway is the network API for one entity type. It is supplied by
//! the application; the engine only depends on this trait.

use crate::cancel::CancelToken;
use async_trait::async_trait;
use thiserror::Error;
use tidal_core::{OpId, RemoteRecord};

/// Result type for gateway calls.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failures reported by a remote gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The remote could not be reached or failed transiently.
    #[error("network: {0}")]
    Network(String),

    /// The remote rejected the payload.
    #[error("validation: {0}")]
    Validation(String),

    /// Credentials are missing or expired.
    #[error("auth: {0}")]
    Auth(String),

    /// The remote version differs from the expected one.
    #[error("conflict (current etag {current_etag:?})")]
    Conflict {
        /// The remote's current etag, if it reported one.
        current_etag: Option<String>,
    },

    /// The entity does not exist remotely.
    #[error("not found")]
    NotFound,

    /// The call observed the cancellation token and stopped.
    #[error("cancelled")]
    Cancelled,
}

/// Acknowledgement of a remote create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// Id under which the remote stored the entity.
    pub id: String,
    /// Etag of the stored version.
    pub etag: String,
}

/// Network API for one entity type.
///
/// Every mutation receives the operation id as an idempotency key. The
/// engine may resend an operation after a crash or timeout, so a
/// mutation repeated with the same key must not be applied twice.
///
/// Implementations should stop early and return
/// [`GatewayError::Cancelled`] once `cancel` fires; the engine also stops
/// awaiting the call on its own.
#[async_trait]
pub trait RemoteGateway<T>: Send + Sync {
    /// Fetches every entity of this type.
    async fn fetch_all(&self, cancel: &CancelToken) -> GatewayResult<Vec<RemoteRecord<T>>>;

    /// Fetches one entity.
    async fn fetch(&self, id: &str, cancel: &CancelToken) -> GatewayResult<RemoteRecord<T>>;

    /// Creates an entity. `local_id` is the id used locally so far; the
    /// remote may keep it or assign its own.
    async fn create(
        &self,
        key: OpId,
        local_id: &str,
        payload: &T,
        cancel: &CancelToken,
    ) -> GatewayResult<Created>;

    /// Replaces an entity, returning the new etag.
    ///
    /// `expected_etag` is the version the change was based on; the remote
    /// answers [`GatewayError::Conflict`] when it no longer matches.
    async fn update(
        &self,
        key: OpId,
        id: &str,
        payload: &T,
        expected_etag: Option<&str>,
        cancel: &CancelToken,
    ) -> GatewayResult<String>;

    /// Deletes an entity.
    async fn delete(&self, key: OpId, id: &str, cancel: &CancelToken) -> GatewayResult<()>;
}
