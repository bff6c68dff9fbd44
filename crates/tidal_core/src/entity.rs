//! Cached entities and their sync metadata.

use crate::types::Timestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Bounds required of an entity payload.
///
/// Implemented for every type that is cloneable, thread-safe and
/// serializable, so callers never implement it by hand.
pub trait Payload: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Payload for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Synchronization state of a cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Local copy matches the last version accepted by the remote.
    Synced,
    /// Local changes are waiting to be pushed (or being retried).
    Pending,
    /// A push for this entity is currently in flight.
    Syncing,
    /// Retries are exhausted or the remote rejected the change.
    Failed,
}

impl SyncStatus {
    /// Returns true if a local change has not yet been accepted remotely.
    #[must_use]
    pub fn has_local_changes(&self) -> bool {
        !matches!(self, SyncStatus::Synced)
    }
}

/// An entity held by the local cache together with its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity<T> {
    /// Entity id, unique within its entity type.
    pub id: String,
    /// The cached value.
    pub payload: T,
    /// Local revision, bumped by every upsert.
    pub version: u64,
    /// Etag of the last version accepted by the remote.
    pub remote_etag: Option<String>,
    /// When the entity last matched the remote.
    pub last_synced_at: Option<Timestamp>,
    /// Current sync state.
    pub sync_status: SyncStatus,
}

impl<T> CachedEntity<T> {
    /// Creates an entity carrying an unpushed local change.
    pub fn pending(id: impl Into<String>, payload: T) -> Self {
        Self {
            id: id.into(),
            payload,
            version: 0,
            remote_etag: None,
            last_synced_at: None,
            sync_status: SyncStatus::Pending,
        }
    }

    /// Creates an entity that mirrors a remote version.
    pub fn synced(
        id: impl Into<String>,
        payload: T,
        etag: impl Into<String>,
        synced_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            payload,
            version: 0,
            remote_etag: Some(etag.into()),
            last_synced_at: Some(synced_at),
            sync_status: SyncStatus::Synced,
        }
    }

    /// Returns true if this entity is stale relative to `now`.
    ///
    /// An entity that was never synced is always stale.
    #[must_use]
    pub fn is_stale(&self, now: Timestamp, ttl: std::time::Duration) -> bool {
        match self.last_synced_at {
            Some(at) => now.duration_since(at) > ttl,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn constructors_set_status() {
        let e = CachedEntity::pending("p1", 5u32);
        assert_eq!(e.sync_status, SyncStatus::Pending);
        assert!(e.remote_etag.is_none());

        let e = CachedEntity::synced("p1", 5u32, "v1", Timestamp::from_millis(10));
        assert_eq!(e.sync_status, SyncStatus::Synced);
        assert_eq!(e.remote_etag.as_deref(), Some("v1"));
        assert!(!e.sync_status.has_local_changes());
    }

    #[test]
    fn staleness() {
        let e = CachedEntity::synced("p1", (), "v1", Timestamp::from_millis(1_000));
        let ttl = Duration::from_secs(1);
        assert!(!e.is_stale(Timestamp::from_millis(2_000), ttl));
        assert!(e.is_stale(Timestamp::from_millis(2_001), ttl));
        assert!(CachedEntity::pending("p2", ()).is_stale(Timestamp::EPOCH, ttl));
    }
}
