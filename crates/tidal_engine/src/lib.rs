//! # Tidal Engine
//!
//! Offline-first synchronization for Tidal.
//!
//! This crate provides:
//! - The [`RemoteGateway`] contract consumed per entity type
//! - [`SyncCoordinator`]: the pull-then-push cycle state machine
//! - [`Scheduler`] and its tokio implementation: periodic, on-reconnect and
//!   on-demand cycles with single-flight semantics
//! - [`Repository`]: the cache-first facade handed to UI code
//! - [`SyncEngine`]: wiring of all of the above
//!
//! ## Architecture
//!
//! Reads are served from the entity store immediately. Writes update the
//! entity store optimistically and append to the operation queue. A sync
//! cycle first pulls stale entity types from the remote, resolving
//! conflicts with local pending edits, then drains the queue through the
//! gateway.
//!
//! ## Key Invariants
//!
//! - Cycles never overlap
//! - Pull always happens before push within a cycle
//! - Operations of one entity are pushed in enqueue order, one at a time
//! - Gateway failures are recorded on operations and entities, never panics
//! - The coordinator holds no durable state; restarting it loses nothing

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod config;
mod coordinator;
mod engine;
mod error;
mod events;
mod gateway;
mod repository;
mod scheduler;
mod target;

pub use cancel::CancelToken;
pub use config::{SchedulerConfig, SyncConfig};
pub use coordinator::SyncCoordinator;
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use events::{
    CycleReport, CycleRequest, EngineStatus, SkipReason, SyncEvent, SyncState, SyncStats,
};
pub use gateway::{Created, GatewayError, GatewayResult, RemoteGateway};
pub use repository::Repository;
pub use scheduler::{CycleHandle, Scheduler, TokioScheduler};

pub use tidal_core::{
    CachedEntity, ConflictPolicy, ConflictRecord, ConflictResolver, LastWriteWins, MergeResolver,
    OpId, OpKind, RemoteRecord, Resolution, ResolutionKind, SyncStatus, Timestamp,
};
