//! Cycle state, events and statistics.

use std::collections::BTreeSet;
use tidal_core::{ConflictRecord, OpId, Timestamp};

/// The state of the sync coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No cycle is running.
    Idle,
    /// Pulling remote changes.
    Pulling,
    /// Pushing queued operations.
    Pushing,
    /// The last cycle hit an unrecoverable error. The next cycle starts
    /// from here.
    Failed,
}

impl SyncState {
    /// Returns true if a cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Pulling | SyncState::Pushing)
    }

    /// Returns true if a new cycle can start.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Failed)
    }
}

/// Global sync indicator for UI code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Nothing running and the last cycle succeeded.
    Idle,
    /// A cycle is running.
    Syncing,
    /// The last cycle failed.
    Failed,
}

/// Parameters of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleRequest {
    /// Pull every entity type regardless of cache age.
    pub force_all: bool,
    /// Pull these entity types regardless of cache age.
    pub force_types: BTreeSet<String>,
}

impl CycleRequest {
    /// A cycle that pulls only stale entity types.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cycle that pulls every entity type.
    pub fn forced() -> Self {
        Self {
            force_all: true,
            force_types: BTreeSet::new(),
        }
    }

    /// A cycle that pulls one entity type regardless of cache age.
    pub fn forced_type(entity_type: impl Into<String>) -> Self {
        let mut request = Self::default();
        request.force_types.insert(entity_type.into());
        request
    }

    /// Returns true if `entity_type` must be pulled regardless of age.
    pub fn forces(&self, entity_type: &str) -> bool {
        self.force_all || self.force_types.contains(entity_type)
    }
}

/// Why a cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The network monitor reported offline.
    Offline,
    /// Another cycle was already running.
    AlreadyRunning,
}

/// Summary of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// When the cycle started.
    pub started_at: Timestamp,
    /// When the cycle finished.
    pub finished_at: Timestamp,
    /// Set when the cycle did not run.
    pub skipped: Option<SkipReason>,
    /// Entity types pulled.
    pub types_pulled: usize,
    /// Remote entities applied to the store.
    pub entities_pulled: usize,
    /// Local entities removed because the remote no longer has them.
    pub entities_removed: usize,
    /// Operations acknowledged by the remote.
    pub pushed: usize,
    /// Operations rescheduled after a transient failure.
    pub retried: usize,
    /// Operations moved to `Failed`.
    pub failed: usize,
    /// Stale in-flight operations re-armed at cycle start.
    pub rearmed: usize,
    /// Conflicts resolved during the cycle.
    pub conflicts: Vec<ConflictRecord>,
    /// Unrecoverable errors, one line each.
    pub errors: Vec<String>,
    /// The push phase stopped at its time budget.
    pub budget_exhausted: bool,
    /// The cycle was cancelled.
    pub cancelled: bool,
}

impl CycleReport {
    pub(crate) fn skipped(reason: SkipReason, at: Timestamp) -> Self {
        Self {
            started_at: at,
            finished_at: at,
            skipped: Some(reason),
            ..Self::default()
        }
    }

    /// Returns true if the cycle ran to completion without errors.
    pub fn is_success(&self) -> bool {
        self.skipped.is_none() && self.errors.is_empty() && !self.cancelled
    }
}

/// Notifications from the engine that callers may react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A cycle finished.
    CycleCompleted(CycleReport),
    /// A conflict was resolved.
    ConflictResolved(ConflictRecord),
    /// The remote rejected an operation; it will not be retried.
    ValidationRejected {
        /// Entity type.
        entity_type: String,
        /// Entity id.
        entity_id: String,
        /// The rejected operation.
        op_id: OpId,
        /// Rejection message.
        message: String,
    },
    /// The remote requires re-authentication; the entity type is paused
    /// until resumed.
    AuthRequired {
        /// The paused entity type.
        entity_type: String,
        /// Message from the remote.
        message: String,
    },
    /// An operation used up its attempts.
    RetriesExhausted {
        /// Entity type.
        entity_type: String,
        /// Entity id.
        entity_id: String,
        /// The failed operation.
        op_id: OpId,
        /// Attempts made.
        attempts: u32,
    },
    /// The remote assigned a new id to a created entity.
    EntityRekeyed {
        /// Entity type.
        entity_type: String,
        /// Id used locally before the create.
        old_id: String,
        /// Id assigned by the remote.
        new_id: String,
    },
}

/// Cumulative statistics of the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Cycles that ran to completion without errors.
    pub cycles_completed: u64,
    /// Cycles that ended with errors or were cancelled.
    pub cycles_failed: u64,
    /// Cycles skipped because offline or already running.
    pub cycles_skipped: u64,
    /// Remote entities applied to stores.
    pub entities_pulled: u64,
    /// Operations acknowledged by the remote.
    pub operations_pushed: u64,
    /// Transient failures rescheduled.
    pub retries: u64,
    /// Operations moved to `Failed`.
    pub operations_failed: u64,
    /// Conflicts resolved.
    pub conflicts_resolved: u64,
    /// Stale in-flight operations re-armed.
    pub operations_rearmed: u64,
    /// Finish time of the last cycle that ran.
    pub last_cycle_at: Option<Timestamp>,
    /// First error of the last failed cycle.
    pub last_error: Option<String>,
}

impl SyncStats {
    pub(crate) fn record(&mut self, report: &CycleReport) {
        if report.skipped.is_some() {
            self.cycles_skipped += 1;
            return;
        }
        if report.is_success() {
            self.cycles_completed += 1;
        } else {
            self.cycles_failed += 1;
            self.last_error = report
                .errors
                .first()
                .cloned()
                .or_else(|| report.cancelled.then(|| "cancelled".to_string()));
        }
        self.entities_pulled += report.entities_pulled as u64;
        self.operations_pushed += report.pushed as u64;
        self.retries += report.retried as u64;
        self.operations_failed += report.failed as u64;
        self.conflicts_resolved += report.conflicts.len() as u64;
        self.operations_rearmed += report.rearmed as u64;
        self.last_cycle_at = Some(report.finished_at);
    }
}
