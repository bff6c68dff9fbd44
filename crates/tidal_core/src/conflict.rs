//! Conflict resolution between a local pending change and a remote version.
//!
//! Resolvers are pure: they look at the two versions and decide which
//! payload survives. Applying the decision is left to the caller.

use crate::entity::CachedEntity;
use crate::types::Timestamp;
use std::fmt;

/// A version of an entity as held by the remote.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord<T> {
    /// Remote id.
    pub id: String,
    /// Remote value.
    pub payload: T,
    /// Remote version tag.
    pub etag: String,
    /// When the remote last modified the entity.
    pub modified_at: Timestamp,
}

impl<T> RemoteRecord<T> {
    /// Creates a remote record.
    pub fn new(
        id: impl Into<String>,
        payload: T,
        etag: impl Into<String>,
        modified_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            payload,
            etag: etag.into(),
            modified_at,
        }
    }
}

/// The outcome of a conflict, carrying the payload to keep.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    /// The local pending value wins and is pushed.
    Kept(T),
    /// The remote value wins and replaces the local one.
    Overwritten(T),
    /// A combination of both is kept and pushed.
    Merged(T),
}

impl<T> Resolution<T> {
    /// Returns the kind of outcome.
    pub fn kind(&self) -> ResolutionKind {
        match self {
            Resolution::Kept(_) => ResolutionKind::Kept,
            Resolution::Overwritten(_) => ResolutionKind::Overwritten,
            Resolution::Merged(_) => ResolutionKind::Merged,
        }
    }

    /// Returns the surviving payload.
    pub fn into_payload(self) -> T {
        match self {
            Resolution::Kept(t) | Resolution::Overwritten(t) | Resolution::Merged(t) => t,
        }
    }
}

/// Payload-free kind of a [`Resolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionKind {
    /// Local value kept.
    Kept,
    /// Remote value kept.
    Overwritten,
    /// Values merged.
    Merged,
}

/// Record of one resolved conflict, for observability and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    /// Entity type.
    pub entity_type: String,
    /// Entity id.
    pub entity_id: String,
    /// Local revision at resolution time.
    pub local_version: u64,
    /// Remote etag at resolution time.
    pub remote_version: String,
    /// Outcome.
    pub resolution: ResolutionKind,
}

impl ConflictRecord {
    /// Builds a record from the inputs and outcome of a resolution.
    pub fn new<T>(
        entity_type: impl Into<String>,
        local: &CachedEntity<T>,
        remote: &RemoteRecord<T>,
        resolution: ResolutionKind,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: local.id.clone(),
            local_version: local.version,
            remote_version: remote.etag.clone(),
            resolution,
        }
    }
}

/// Decides between a local pending entity and its remote version.
///
/// Implementations must be deterministic and free of I/O. A resolver that
/// asks the user is expressed the same way, by answering from a decision
/// gathered beforehand.
pub trait ConflictResolver<T>: Send + Sync {
    /// Resolves the conflict.
    fn resolve(&self, local: &CachedEntity<T>, remote: &RemoteRecord<T>) -> Resolution<T>;
}

/// Last-write-wins by timestamp.
///
/// The remote wins when it was modified after the local copy last synced.
/// A local copy that never synced keeps its value.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl<T: Clone> ConflictResolver<T> for LastWriteWins {
    fn resolve(&self, local: &CachedEntity<T>, remote: &RemoteRecord<T>) -> Resolution<T> {
        match local.last_synced_at {
            Some(synced_at) if remote.modified_at > synced_at => {
                Resolution::Overwritten(remote.payload.clone())
            }
            _ => Resolution::Kept(local.payload.clone()),
        }
    }
}

/// Fixed resolution policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// The remote value always wins.
    ServerWins,
    /// The local value always wins.
    ClientWins,
    /// Defer to [`LastWriteWins`].
    #[default]
    LastWriteWins,
}

impl<T: Clone> ConflictResolver<T> for ConflictPolicy {
    fn resolve(&self, local: &CachedEntity<T>, remote: &RemoteRecord<T>) -> Resolution<T> {
        match self {
            ConflictPolicy::ServerWins => Resolution::Overwritten(remote.payload.clone()),
            ConflictPolicy::ClientWins => Resolution::Kept(local.payload.clone()),
            ConflictPolicy::LastWriteWins => LastWriteWins.resolve(local, remote),
        }
    }
}

/// Field-level merge through a caller-supplied function.
///
/// The function receives the local and remote payloads and returns the
/// merged payload.
pub struct MergeResolver<F> {
    merge: F,
}

impl<F> MergeResolver<F> {
    /// Creates a merge resolver.
    pub fn new(merge: F) -> Self {
        Self { merge }
    }
}

impl<T, F> ConflictResolver<T> for MergeResolver<F>
where
    F: Fn(&T, &T) -> T + Send + Sync,
{
    fn resolve(&self, local: &CachedEntity<T>, remote: &RemoteRecord<T>) -> Resolution<T> {
        Resolution::Merged((self.merge)(&local.payload, &remote.payload))
    }
}

impl<F> fmt::Debug for MergeResolver<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SyncStatus;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn local(value: u32, synced_at: Option<u64>) -> CachedEntity<u32> {
        CachedEntity {
            id: "p1".into(),
            payload: value,
            version: 3,
            remote_etag: Some("v1".into()),
            last_synced_at: synced_at.map(Timestamp::from_millis),
            sync_status: SyncStatus::Pending,
        }
    }

    fn remote(value: u32, modified_at: u64) -> RemoteRecord<u32> {
        RemoteRecord::new("p1", value, "v2", Timestamp::from_millis(modified_at))
    }

    #[test]
    fn newer_remote_overwrites() {
        let r = LastWriteWins.resolve(&local(1, Some(100)), &remote(2, 200));
        assert_eq!(r, Resolution::Overwritten(2));
    }

    #[test]
    fn older_or_equal_remote_is_kept() {
        assert_eq!(
            LastWriteWins.resolve(&local(1, Some(200)), &remote(2, 100)),
            Resolution::Kept(1)
        );
        assert_eq!(
            LastWriteWins.resolve(&local(1, Some(200)), &remote(2, 200)),
            Resolution::Kept(1)
        );
    }

    #[test]
    fn never_synced_local_is_kept() {
        let r = LastWriteWins.resolve(&local(1, None), &remote(2, u64::MAX));
        assert_eq!(r.kind(), ResolutionKind::Kept);
    }

    #[test]
    fn fixed_policies() {
        let (l, r) = (local(1, Some(500)), remote(2, 100));
        assert_eq!(ConflictPolicy::ServerWins.resolve(&l, &r), Resolution::Overwritten(2));
        assert_eq!(ConflictPolicy::ClientWins.resolve(&l, &r), Resolution::Kept(1));
        assert_eq!(ConflictPolicy::default().resolve(&l, &r), Resolution::Kept(1));
    }

    #[test]
    fn merge_combines_fields() {
        let resolver = MergeResolver::new(|local: &Value, remote: &Value| {
            let mut merged = remote.clone();
            merged["price"] = local["price"].clone();
            merged
        });
        let l = CachedEntity::pending("p1", json!({"price": 100, "name": "old"}));
        let r = RemoteRecord::new("p1", json!({"price": 90, "name": "new"}), "v9", Timestamp::EPOCH);

        let resolution = resolver.resolve(&l, &r);
        assert_eq!(resolution.kind(), ResolutionKind::Merged);
        assert_eq!(resolution.into_payload(), json!({"price": 100, "name": "new"}));
    }

    #[test]
    fn conflict_record_captures_versions() {
        let (l, r) = (local(1, Some(1)), remote(2, 2));
        let record = ConflictRecord::new("product", &l, &r, ResolutionKind::Overwritten);
        assert_eq!(record.entity_id, "p1");
        assert_eq!(record.local_version, 3);
        assert_eq!(record.remote_version, "v2");
    }

    proptest! {
        #[test]
        fn lww_is_deterministic(t0 in any::<u64>(), t1 in any::<u64>(), l in any::<u32>(), r in any::<u32>()) {
            let local = local(l, Some(t0));
            let remote = remote(r, t1);
            let first = LastWriteWins.resolve(&local, &remote);
            let second = LastWriteWins.resolve(&local, &remote);
            prop_assert_eq!(&first, &second);
            if t1 > t0 {
                prop_assert_eq!(first, Resolution::Overwritten(r));
            } else {
                prop_assert_eq!(first, Resolution::Kept(l));
            }
        }
    }
}
