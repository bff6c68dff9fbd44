//! # Tidal Core
//!
//! Leaf components of the Tidal offline-first sync engine.
//!
//! This crate provides:
//! - `CachedEntity<T>` and the typed, observable [`EntityStore`]
//! - `QueuedOperation` and the durable, per-entity ordered [`OperationQueue`]
//! - [`BackoffPolicy`] for retry scheduling
//! - [`NetworkMonitor`] connectivity signal
//! - Pluggable [`ConflictResolver`]s (last-write-wins, fixed policies, merge)
//! - [`Clock`] injection for deterministic timing
//! - [`StoreDir`] on-disk layout with single-writer locking
//!
//! ## Ownership
//!
//! The entity store owns every cached entity and the operation queue owns
//! every queued operation. Both synchronize internally, so foreground reads
//! and writes never wait behind a running sync cycle.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod clock;
mod codec;
mod conflict;
#[cfg(feature = "std")]
mod dir;
mod entity;
mod error;
mod network;
mod queue;
mod store;
mod types;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{entity_key, entity_prefix, op_key, refreshed_key, OP_PREFIX};
pub use conflict::{
    ConflictPolicy, ConflictRecord, ConflictResolver, LastWriteWins, MergeResolver, RemoteRecord,
    Resolution, ResolutionKind,
};
#[cfg(feature = "std")]
pub use dir::StoreDir;
pub use entity::{CachedEntity, Payload, SyncStatus};
pub use error::{CoreError, CoreResult};
pub use network::{Connectivity, ConnectivityEvent, NetworkMonitor};
pub use queue::{OpKind, OpStatus, OperationQueue, QueueStats, QueuedOperation};
pub use store::EntityStore;
pub use types::{OpId, Timestamp};
