//! Durable queue of local mutations awaiting the remote.
//!
//! # Ordering
//!
//! Every operation gets a monotonic sequence number on enqueue. Operations
//! for the same `(entity_type, entity_id)` leave the queue strictly in that
//! order: only the oldest unfinished operation of an entity is ever ready,
//! so at most one of them is in flight and a failed one holds back the
//! rest until it is retried or superseded.
//!
//! # Coalescing
//!
//! - A `Delete` drops every queued operation of the entity that is not in
//!   flight, leaving the single `Delete`.
//! - An `Update` onto an entity whose newest operation is an unsent
//!   `Update` replaces that operation's payload instead of appending.
//! - Operations queued behind an unsent `Create` are tagged with
//!   `depends_on` and never leave before it.
//!
//! # Durability
//!
//! With a backing [`KeyValueStore`] every state change is written before
//! the call returns. Operations found `InFlight` after a restart are left
//! as they are for [`OperationQueue::rearm_stale`] to pick up.

use crate::backoff::BackoffPolicy;
use crate::codec::{decode_row, encode_row, op_key, OP_PREFIX};
use crate::error::{CoreError, CoreResult};
use crate::types::{OpId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tidal_storage::KeyValueStore;
use tracing::{debug, warn};

/// Default number of completed operation ids remembered for deduplication.
const DEFAULT_ARCHIVE_CAPACITY: usize = 1024;

/// Kind of mutation carried by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Create the entity remotely.
    Create,
    /// Replace the entity remotely.
    Update,
    /// Delete the entity remotely.
    Delete,
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpStatus {
    /// Waiting to be sent.
    Pending,
    /// Being sent to the remote.
    InFlight,
    /// Acknowledged by the remote.
    Succeeded,
    /// Rejected or out of attempts; waits for a manual retry.
    Failed,
}

/// A local mutation awaiting propagation to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Unique id, also the idempotency key sent to the remote.
    pub op_id: OpId,
    /// Position in the queue. Assigned on enqueue.
    pub seq: u64,
    /// Entity type the operation targets.
    pub entity_type: String,
    /// Entity id the operation targets.
    pub entity_id: String,
    /// Kind of mutation.
    pub kind: OpKind,
    /// Mutation payload.
    pub payload: serde_json::Value,
    /// When the operation was created.
    pub created_at: Timestamp,
    /// Failed attempts so far.
    pub attempt_count: u32,
    /// Attempts allowed before the operation fails.
    pub max_attempts: u32,
    /// Earliest time the operation may be sent.
    pub next_retry_at: Timestamp,
    /// Lifecycle state.
    pub status: OpStatus,
    /// A `Create` that must succeed before this operation is sent.
    pub depends_on: Option<OpId>,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// When the operation was last marked in flight.
    pub in_flight_since: Option<Timestamp>,
}

impl QueuedOperation {
    /// Creates a pending operation, ready immediately.
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        kind: OpKind,
        payload: serde_json::Value,
        now: Timestamp,
    ) -> Self {
        Self {
            op_id: OpId::new(),
            seq: 0,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            kind,
            payload,
            created_at: now,
            attempt_count: 0,
            max_attempts: 3,
            next_retry_at: now,
            status: OpStatus::Pending,
            depends_on: None,
            last_error: None,
            in_flight_since: None,
        }
    }

    /// Sets the operation id.
    pub fn with_op_id(mut self, op_id: OpId) -> Self {
        self.op_id = op_id;
        self
    }

    /// Sets the number of attempts allowed.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Returns true if the operation may still be sent.
    pub fn is_outstanding(&self) -> bool {
        matches!(self.status, OpStatus::Pending | OpStatus::InFlight)
    }

    fn targets(&self, entity_type: &str, entity_id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id == entity_id
    }
}

/// Counts of queued operations by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Operations waiting to be sent.
    pub pending: usize,
    /// Operations being sent.
    pub in_flight: usize,
    /// Operations waiting for a manual retry.
    pub failed: usize,
    /// Completed operation ids remembered for deduplication.
    pub archived: usize,
}

#[derive(Default)]
struct QueueState {
    /// Unfinished operations keyed by sequence number.
    ops: BTreeMap<u64, QueuedOperation>,
    by_id: HashMap<OpId, u64>,
    next_seq: u64,
    paused: HashSet<String>,
    archive: VecDeque<OpId>,
    archived: HashSet<OpId>,
}

impl QueueState {
    fn get_mut(&mut self, op_id: &OpId) -> CoreResult<&mut QueuedOperation> {
        let seq = self
            .by_id
            .get(op_id)
            .copied()
            .ok_or(CoreError::OperationNotFound { op_id: *op_id })?;
        self.ops
            .get_mut(&seq)
            .ok_or(CoreError::OperationNotFound { op_id: *op_id })
    }

    fn take(&mut self, op_id: &OpId) -> Option<QueuedOperation> {
        let seq = self.by_id.remove(op_id)?;
        self.ops.remove(&seq)
    }

    fn for_entity<'a>(
        &'a self,
        entity_type: &'a str,
        entity_id: &'a str,
    ) -> impl Iterator<Item = &'a QueuedOperation> + 'a {
        self.ops
            .values()
            .filter(move |op| op.targets(entity_type, entity_id))
    }

    fn ready(&self, now: Timestamp) -> Option<OpId> {
        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        for op in self.ops.values() {
            if !seen.insert((op.entity_type.as_str(), op.entity_id.as_str())) {
                continue;
            }
            let blocked = op
                .depends_on
                .is_some_and(|dep| self.by_id.contains_key(&dep));
            if op.status == OpStatus::Pending
                && op.next_retry_at <= now
                && !blocked
                && !self.paused.contains(&op.entity_type)
            {
                return Some(op.op_id);
            }
        }
        None
    }

    fn remember(&mut self, op_id: OpId, capacity: usize) -> Option<OpId> {
        if self.archived.insert(op_id) {
            self.archive.push_back(op_id);
        }
        if self.archive.len() > capacity {
            let evicted = self.archive.pop_front()?;
            self.archived.remove(&evicted);
            return Some(evicted);
        }
        None
    }
}

/// Durable, per-entity ordered queue of pending mutations.
///
/// # Thread Safety
///
/// All methods take `&self`; a single short-held lock guards the queue
/// state, and no method performs network I/O.
pub struct OperationQueue {
    state: Mutex<QueueState>,
    kv: Option<Arc<dyn KeyValueStore>>,
    archive_capacity: usize,
}

impl OperationQueue {
    /// Creates an empty queue held in memory only.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_seq: 1,
                ..QueueState::default()
            }),
            kv: None,
            archive_capacity: DEFAULT_ARCHIVE_CAPACITY,
        }
    }

    /// Opens a queue persisted in `kv`, loading every saved operation.
    pub fn open(kv: Arc<dyn KeyValueStore>) -> CoreResult<Self> {
        let mut rows: Vec<QueuedOperation> = kv
            .scan_prefix(OP_PREFIX)?
            .into_iter()
            .map(|(_, row)| decode_row(&row))
            .collect::<CoreResult<_>>()?;
        rows.sort_by_key(|op| op.seq);

        let mut state = QueueState {
            next_seq: 1,
            ..QueueState::default()
        };
        for op in rows {
            state.next_seq = state.next_seq.max(op.seq + 1);
            if op.status == OpStatus::Succeeded {
                state.archived.insert(op.op_id);
                state.archive.push_back(op.op_id);
            } else {
                state.by_id.insert(op.op_id, op.seq);
                state.ops.insert(op.seq, op);
            }
        }

        debug!(
            active = state.ops.len(),
            archived = state.archive.len(),
            "opened operation queue"
        );
        Ok(Self {
            state: Mutex::new(state),
            kv: Some(kv),
            archive_capacity: DEFAULT_ARCHIVE_CAPACITY,
        })
    }

    /// Sets how many completed operation ids are remembered.
    pub fn with_archive_capacity(mut self, capacity: usize) -> Self {
        self.archive_capacity = capacity;
        self
    }

    /// Adds a mutation, applying the coalescing rules.
    ///
    /// Returns the id of the operation that now carries the mutation, which
    /// is an existing operation's id when the mutation was folded into it.
    /// Enqueueing an id that already completed or is already queued is a
    /// no-op.
    pub fn enqueue(&self, mut op: QueuedOperation) -> CoreResult<OpId> {
        let mut state = self.state.lock();

        if state.archived.contains(&op.op_id) || state.by_id.contains_key(&op.op_id) {
            debug!(op_id = %op.op_id, "ignoring re-delivered operation");
            return Ok(op.op_id);
        }

        match op.kind {
            OpKind::Delete => {
                let superseded: Vec<OpId> = state
                    .for_entity(&op.entity_type, &op.entity_id)
                    .filter(|queued| queued.status != OpStatus::InFlight)
                    .map(|queued| queued.op_id)
                    .collect();
                for op_id in superseded {
                    state.take(&op_id);
                    self.unpersist(&op_id)?;
                    debug!(%op_id, superseded_by = %op.op_id, "delete superseded operation");
                }
            }
            OpKind::Update => {
                let newest = state
                    .for_entity(&op.entity_type, &op.entity_id)
                    .last()
                    .filter(|queued| {
                        queued.kind == OpKind::Update
                            && matches!(queued.status, OpStatus::Pending | OpStatus::Failed)
                    })
                    .map(|queued| queued.op_id);
                if let Some(op_id) = newest {
                    let queued = state.get_mut(&op_id)?;
                    queued.payload = op.payload;
                    if queued.status == OpStatus::Failed {
                        queued.status = OpStatus::Pending;
                        queued.attempt_count = 0;
                        queued.last_error = None;
                        queued.next_retry_at = op.created_at;
                    }
                    let snapshot = queued.clone();
                    self.persist(&snapshot)?;
                    debug!(%op_id, entity_id = %snapshot.entity_id, "coalesced update");
                    return Ok(op_id);
                }
            }
            OpKind::Create => {}
        }

        if op.kind != OpKind::Create {
            op.depends_on = state
                .for_entity(&op.entity_type, &op.entity_id)
                .find(|queued| queued.kind == OpKind::Create)
                .map(|queued| queued.op_id);
        }

        op.seq = state.next_seq;
        op.status = OpStatus::Pending;
        op.in_flight_since = None;
        state.next_seq += 1;
        self.persist(&op)?;

        debug!(
            op_id = %op.op_id,
            seq = op.seq,
            entity_type = %op.entity_type,
            entity_id = %op.entity_id,
            kind = ?op.kind,
            "enqueued operation"
        );
        let op_id = op.op_id;
        state.by_id.insert(op_id, op.seq);
        state.ops.insert(op.seq, op);
        Ok(op_id)
    }

    /// Returns the oldest operation ready at `now`, without claiming it.
    ///
    /// An operation is ready when it is `Pending`, due, the oldest unfinished
    /// operation of its entity, not waiting on a `Create`, and its entity
    /// type is not paused.
    pub fn dequeue_next_ready(&self, now: Timestamp) -> Option<QueuedOperation> {
        let state = self.state.lock();
        let op_id = state.ready(now)?;
        let seq = state.by_id.get(&op_id)?;
        state.ops.get(seq).cloned()
    }

    /// Marks a pending operation as in flight.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInFlight` if another operation of the same entity is
    /// in flight.
    pub fn mark_in_flight(&self, op_id: &OpId, now: Timestamp) -> CoreResult<QueuedOperation> {
        let mut state = self.state.lock();
        self.mark_in_flight_locked(&mut state, op_id, now)
    }

    /// Atomically finds the next ready operation and marks it in flight.
    pub fn claim_next_ready(&self, now: Timestamp) -> CoreResult<Option<QueuedOperation>> {
        let mut state = self.state.lock();
        match state.ready(now) {
            Some(op_id) => self.mark_in_flight_locked(&mut state, &op_id, now).map(Some),
            None => Ok(None),
        }
    }

    /// Records remote acknowledgement and archives the operation.
    pub fn complete(&self, op_id: &OpId) -> CoreResult<QueuedOperation> {
        let mut state = self.state.lock();
        let mut op = state
            .take(op_id)
            .ok_or(CoreError::OperationNotFound { op_id: *op_id })?;
        op.status = OpStatus::Succeeded;
        op.in_flight_since = None;
        op.last_error = None;

        let dependents: Vec<OpId> = state
            .ops
            .values()
            .filter(|queued| queued.depends_on == Some(*op_id))
            .map(|queued| queued.op_id)
            .collect();
        for dependent in dependents {
            let queued = state.get_mut(&dependent)?;
            queued.depends_on = None;
            let snapshot = queued.clone();
            self.persist(&snapshot)?;
        }

        self.persist(&op)?;
        if let Some(evicted) = state.remember(op.op_id, self.archive_capacity) {
            self.unpersist(&evicted)?;
        }
        debug!(op_id = %op.op_id, entity_id = %op.entity_id, "completed operation");
        Ok(op)
    }

    /// Records a transient failure.
    ///
    /// Increments `attempt_count`; once it reaches `max_attempts` the
    /// operation becomes `Failed`, otherwise it is rescheduled at
    /// `now + backoff.delay(attempt_count)`.
    pub fn fail(
        &self,
        op_id: &OpId,
        backoff: &BackoffPolicy,
        now: Timestamp,
        reason: impl Into<String>,
    ) -> CoreResult<QueuedOperation> {
        let mut state = self.state.lock();
        let op = state.get_mut(op_id)?;
        op.attempt_count = op.attempt_count.saturating_add(1);
        op.last_error = Some(reason.into());
        op.in_flight_since = None;
        if op.attempt_count >= op.max_attempts {
            op.status = OpStatus::Failed;
            warn!(
                op_id = %op.op_id,
                entity_id = %op.entity_id,
                attempt = op.attempt_count,
                "operation exhausted its retries"
            );
        } else {
            op.status = OpStatus::Pending;
            op.next_retry_at = now.saturating_add(backoff.delay(op.attempt_count));
            debug!(
                op_id = %op.op_id,
                attempt = op.attempt_count,
                next_retry_at = %op.next_retry_at,
                "operation rescheduled"
            );
        }
        let snapshot = op.clone();
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    /// Moves an operation straight to `Failed` without further retries.
    pub fn fail_permanently(
        &self,
        op_id: &OpId,
        reason: impl Into<String>,
    ) -> CoreResult<QueuedOperation> {
        self.update(op_id, |op| {
            op.status = OpStatus::Failed;
            op.last_error = Some(reason.into());
            op.in_flight_since = None;
            Ok(())
        })
    }

    /// Returns an in-flight operation to `Pending` without charging an
    /// attempt. It becomes ready again at `next_retry_at`.
    pub fn release(&self, op_id: &OpId, next_retry_at: Timestamp) -> CoreResult<QueuedOperation> {
        self.update(op_id, |op| {
            if op.status != OpStatus::InFlight {
                return Err(CoreError::InvalidTransition {
                    op_id: op.op_id,
                    status: op.status,
                    action: "release",
                });
            }
            op.status = OpStatus::Pending;
            op.in_flight_since = None;
            op.next_retry_at = next_retry_at;
            Ok(())
        })
    }

    /// Resets a failed or pending operation for an immediate retry.
    pub fn retry(&self, op_id: &OpId, now: Timestamp) -> CoreResult<QueuedOperation> {
        self.update(op_id, |op| {
            if op.status == OpStatus::InFlight {
                return Err(CoreError::InvalidTransition {
                    op_id: op.op_id,
                    status: op.status,
                    action: "retry",
                });
            }
            reset_for_retry(op, now);
            Ok(())
        })
    }

    /// Resets every unfinished, not in-flight operation of one entity.
    pub fn retry_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        now: Timestamp,
    ) -> CoreResult<usize> {
        self.reset_where(now, |op| {
            op.targets(entity_type, entity_id) && op.status != OpStatus::InFlight
        })
    }

    /// Resets every failed operation.
    pub fn retry_all_failed(&self, now: Timestamp) -> CoreResult<usize> {
        self.reset_where(now, |op| op.status == OpStatus::Failed)
    }

    /// Returns in-flight operations older than `flight_timeout` to
    /// `Pending`, returning their ids.
    pub fn rearm_stale(&self, now: Timestamp, flight_timeout: Duration) -> CoreResult<Vec<OpId>> {
        let mut state = self.state.lock();
        let stale: Vec<OpId> = state
            .ops
            .values()
            .filter(|op| op.status == OpStatus::InFlight)
            .filter(|op| {
                op.in_flight_since
                    .map_or(true, |since| now.duration_since(since) >= flight_timeout)
            })
            .map(|op| op.op_id)
            .collect();

        for op_id in &stale {
            let op = state.get_mut(op_id)?;
            op.status = OpStatus::Pending;
            op.in_flight_since = None;
            op.next_retry_at = now;
            let snapshot = op.clone();
            self.persist(&snapshot)?;
            warn!(%op_id, entity_id = %snapshot.entity_id, "re-armed stale in-flight operation");
        }
        Ok(stale)
    }

    /// Stops handing out operations of an entity type.
    pub fn pause_type(&self, entity_type: &str) {
        if self.state.lock().paused.insert(entity_type.to_string()) {
            warn!(entity_type, "paused operations");
        }
    }

    /// Resumes an entity type paused with [`pause_type`](Self::pause_type).
    pub fn resume_type(&self, entity_type: &str) -> bool {
        let resumed = self.state.lock().paused.remove(entity_type);
        if resumed {
            debug!(entity_type, "resumed operations");
        }
        resumed
    }

    /// Returns true if an entity type is paused.
    pub fn is_paused(&self, entity_type: &str) -> bool {
        self.state.lock().paused.contains(entity_type)
    }

    /// Points every unfinished operation of an entity at a new id.
    pub fn retarget(&self, entity_type: &str, old_id: &str, new_id: &str) -> CoreResult<usize> {
        let mut state = self.state.lock();
        let mut count = 0;
        let targets: Vec<OpId> = state
            .for_entity(entity_type, old_id)
            .map(|op| op.op_id)
            .collect();
        for op_id in targets {
            let op = state.get_mut(&op_id)?;
            op.entity_id = new_id.to_string();
            let snapshot = op.clone();
            self.persist(&snapshot)?;
            count += 1;
        }
        Ok(count)
    }

    /// Drops every unfinished, not in-flight operation of an entity.
    pub fn discard_outstanding(&self, entity_type: &str, entity_id: &str) -> CoreResult<usize> {
        let mut state = self.state.lock();
        let targets: Vec<OpId> = state
            .for_entity(entity_type, entity_id)
            .filter(|op| op.status != OpStatus::InFlight)
            .map(|op| op.op_id)
            .collect();
        for op_id in &targets {
            state.take(op_id);
            self.unpersist(op_id)?;
        }
        Ok(targets.len())
    }

    /// Returns true if an entity has any unfinished operation.
    pub fn has_outstanding(&self, entity_type: &str, entity_id: &str) -> bool {
        self.state
            .lock()
            .for_entity(entity_type, entity_id)
            .next()
            .is_some()
    }

    /// Returns true if an operation of the entity is in flight.
    pub fn has_in_flight(&self, entity_type: &str, entity_id: &str) -> bool {
        self.state
            .lock()
            .for_entity(entity_type, entity_id)
            .any(|op| op.status == OpStatus::InFlight)
    }

    /// Returns true if a `Delete` of the entity is queued.
    pub fn pending_delete(&self, entity_type: &str, entity_id: &str) -> bool {
        self.state
            .lock()
            .for_entity(entity_type, entity_id)
            .any(|op| op.kind == OpKind::Delete)
    }

    /// Returns true if an operation id completed and is still remembered.
    pub fn is_succeeded(&self, op_id: &OpId) -> bool {
        self.state.lock().archived.contains(op_id)
    }

    /// Returns an unfinished operation by id.
    pub fn get(&self, op_id: &OpId) -> Option<QueuedOperation> {
        let state = self.state.lock();
        let seq = state.by_id.get(op_id)?;
        state.ops.get(seq).cloned()
    }

    /// Returns every unfinished operation in queue order.
    pub fn list(&self) -> Vec<QueuedOperation> {
        self.state.lock().ops.values().cloned().collect()
    }

    /// Returns unfinished operations of one entity in queue order.
    pub fn list_entity(&self, entity_type: &str, entity_id: &str) -> Vec<QueuedOperation> {
        self.state
            .lock()
            .for_entity(entity_type, entity_id)
            .cloned()
            .collect()
    }

    /// Returns the number of unfinished operations.
    pub fn len(&self) -> usize {
        self.state.lock().ops.len()
    }

    /// Returns true if no operation is unfinished.
    pub fn is_empty(&self) -> bool {
        self.state.lock().ops.is_empty()
    }

    /// Returns counts by status.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = QueueStats {
            archived: state.archive.len(),
            ..QueueStats::default()
        };
        for op in state.ops.values() {
            match op.status {
                OpStatus::Pending => stats.pending += 1,
                OpStatus::InFlight => stats.in_flight += 1,
                OpStatus::Failed => stats.failed += 1,
                OpStatus::Succeeded => {}
            }
        }
        stats
    }

    fn mark_in_flight_locked(
        &self,
        state: &mut QueueState,
        op_id: &OpId,
        now: Timestamp,
    ) -> CoreResult<QueuedOperation> {
        let (entity_type, entity_id, status) = {
            let op = state.get_mut(op_id)?;
            (op.entity_type.clone(), op.entity_id.clone(), op.status)
        };
        if status != OpStatus::Pending {
            return Err(CoreError::InvalidTransition {
                op_id: *op_id,
                status,
                action: "send",
            });
        }
        let busy = state
            .for_entity(&entity_type, &entity_id)
            .any(|op| op.status == OpStatus::InFlight);
        if busy {
            return Err(CoreError::AlreadyInFlight {
                op_id: *op_id,
                entity_type,
                entity_id,
            });
        }

        let op = state.get_mut(op_id)?;
        op.status = OpStatus::InFlight;
        op.in_flight_since = Some(now);
        let snapshot = op.clone();
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    fn update<F>(&self, op_id: &OpId, f: F) -> CoreResult<QueuedOperation>
    where
        F: FnOnce(&mut QueuedOperation) -> CoreResult<()>,
    {
        let mut state = self.state.lock();
        let op = state.get_mut(op_id)?;
        f(op)?;
        let snapshot = op.clone();
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    fn reset_where<F>(&self, now: Timestamp, pred: F) -> CoreResult<usize>
    where
        F: Fn(&QueuedOperation) -> bool,
    {
        let mut state = self.state.lock();
        let mut count = 0;
        for op in state.ops.values_mut() {
            if pred(op) {
                reset_for_retry(op, now);
                if let Some(kv) = &self.kv {
                    kv.put(&op_key(&op.op_id), &encode_row(&*op)?)?;
                }
                count += 1;
            }
        }
        Ok(count)
    }

    fn persist(&self, op: &QueuedOperation) -> CoreResult<()> {
        if let Some(kv) = &self.kv {
            kv.put(&op_key(&op.op_id), &encode_row(op)?)?;
        }
        Ok(())
    }

    fn unpersist(&self, op_id: &OpId) -> CoreResult<()> {
        if let Some(kv) = &self.kv {
            kv.delete(&op_key(op_id))?;
        }
        Ok(())
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("stats", &self.stats())
            .field("persistent", &self.kv.is_some())
            .finish()
    }
}

fn reset_for_retry(op: &mut QueuedOperation, now: Timestamp) {
    op.status = OpStatus::Pending;
    op.attempt_count = 0;
    op.next_retry_at = now;
    op.last_error = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidal_storage::KvLog;

    const T0: Timestamp = Timestamp::from_millis(1_000);

    fn op(kind: OpKind, id: &str, price: u32) -> QueuedOperation {
        QueuedOperation::new("product", id, kind, json!({ "price": price }), T0)
    }

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy::default().without_jitter()
    }

    #[test]
    fn dequeue_returns_oldest_ready() {
        let queue = OperationQueue::new();
        let a = queue.enqueue(op(OpKind::Create, "a", 1)).unwrap();
        queue.enqueue(op(OpKind::Create, "b", 2)).unwrap();

        assert_eq!(queue.dequeue_next_ready(T0).unwrap().op_id, a);
        // Peeking does not claim.
        assert_eq!(queue.dequeue_next_ready(T0).unwrap().op_id, a);
        assert!(queue.dequeue_next_ready(Timestamp::EPOCH).is_none());
    }

    #[test]
    fn in_flight_entity_blocks_its_later_operations() {
        let queue = OperationQueue::new();
        let create = queue.enqueue(op(OpKind::Create, "a", 1)).unwrap();
        let update = queue.enqueue(op(OpKind::Update, "a", 2)).unwrap();
        let other = queue.enqueue(op(OpKind::Create, "b", 3)).unwrap();

        queue.mark_in_flight(&create, T0).unwrap();
        assert_eq!(queue.dequeue_next_ready(T0).unwrap().op_id, other);

        let err = queue.mark_in_flight(&update, T0).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyInFlight { .. }));

        queue.complete(&create).unwrap();
        assert_eq!(queue.dequeue_next_ready(T0).unwrap().op_id, update);
    }

    #[test]
    fn update_coalesces_into_pending_update() {
        let queue = OperationQueue::new();
        let first = queue.enqueue(op(OpKind::Update, "p1", 1)).unwrap();
        let second = queue.enqueue(op(OpKind::Update, "p1", 2)).unwrap();

        assert_eq!(first, second);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(&first).unwrap().payload, json!({ "price": 2 }));
    }

    #[test]
    fn update_does_not_coalesce_into_in_flight_update() {
        let queue = OperationQueue::new();
        let first = queue.enqueue(op(OpKind::Update, "p1", 1)).unwrap();
        queue.mark_in_flight(&first, T0).unwrap();
        let second = queue.enqueue(op(OpKind::Update, "p1", 2)).unwrap();

        assert_ne!(first, second);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn update_revives_failed_update() {
        let queue = OperationQueue::new();
        let first = queue.enqueue(op(OpKind::Update, "p1", 1)).unwrap();
        queue.fail_permanently(&first, "rejected").unwrap();

        let later = QueuedOperation::new(
            "product",
            "p1",
            OpKind::Update,
            json!({ "price": 5 }),
            Timestamp::from_millis(9_000),
        );
        assert_eq!(queue.enqueue(later).unwrap(), first);
        let revived = queue.get(&first).unwrap();
        assert_eq!(revived.status, OpStatus::Pending);
        assert_eq!(revived.attempt_count, 0);
        assert_eq!(revived.next_retry_at, Timestamp::from_millis(9_000));
    }

    #[test]
    fn delete_supersedes_queued_mutations() {
        let queue = OperationQueue::new();
        queue.enqueue(op(OpKind::Update, "p1", 1)).unwrap();
        queue.enqueue(op(OpKind::Update, "p2", 1)).unwrap();
        let delete = queue.enqueue(op(OpKind::Delete, "p1", 0)).unwrap();

        let ops = queue.list_entity("product", "p1");
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_id, delete);
        assert_eq!(ops[0].kind, OpKind::Delete);
        assert!(queue.pending_delete("product", "p1"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn delete_waits_behind_in_flight_create() {
        let queue = OperationQueue::new();
        let create = queue.enqueue(op(OpKind::Create, "p1", 1)).unwrap();
        queue.mark_in_flight(&create, T0).unwrap();
        queue.enqueue(op(OpKind::Update, "p1", 2)).unwrap();
        let delete = queue.enqueue(op(OpKind::Delete, "p1", 0)).unwrap();

        let ops = queue.list_entity("product", "p1");
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].depends_on, Some(create));
        assert!(queue.dequeue_next_ready(T0).is_none());

        queue.complete(&create).unwrap();
        let next = queue.dequeue_next_ready(T0).unwrap();
        assert_eq!(next.op_id, delete);
        assert_eq!(next.depends_on, None);
    }

    #[test]
    fn updates_after_create_depend_on_it() {
        let queue = OperationQueue::new();
        let create = queue.enqueue(op(OpKind::Create, "p1", 1)).unwrap();
        let update = queue.enqueue(op(OpKind::Update, "p1", 2)).unwrap();

        assert_eq!(queue.get(&update).unwrap().depends_on, Some(create));

        // A failed create holds back its dependents.
        queue.mark_in_flight(&create, T0).unwrap();
        queue.fail_permanently(&create, "rejected").unwrap();
        assert!(queue.dequeue_next_ready(T0).is_none());
    }

    #[test]
    fn fail_reschedules_then_exhausts() {
        let queue = OperationQueue::new();
        let id = queue.enqueue(op(OpKind::Update, "p1", 1)).unwrap();
        let policy = no_jitter();

        queue.mark_in_flight(&id, T0).unwrap();
        let after_first = queue.fail(&id, &policy, T0, "timeout").unwrap();
        assert_eq!(after_first.status, OpStatus::Pending);
        assert_eq!(after_first.attempt_count, 1);
        assert_eq!(after_first.next_retry_at, T0.saturating_add(Duration::from_secs(1)));
        assert!(queue.dequeue_next_ready(T0).is_none());

        let t1 = after_first.next_retry_at;
        queue.mark_in_flight(&id, t1).unwrap();
        let after_second = queue.fail(&id, &policy, t1, "timeout").unwrap();
        assert_eq!(after_second.next_retry_at, t1.saturating_add(Duration::from_secs(2)));

        let t2 = after_second.next_retry_at;
        queue.mark_in_flight(&id, t2).unwrap();
        let exhausted = queue.fail(&id, &policy, t2, "timeout").unwrap();
        assert_eq!(exhausted.status, OpStatus::Failed);
        assert_eq!(exhausted.attempt_count, 3);
        assert!(queue.dequeue_next_ready(Timestamp::from_millis(u64::MAX)).is_none());
        assert_eq!(queue.stats().failed, 1);
    }

    #[test]
    fn manual_retry_resets_attempts() {
        let queue = OperationQueue::new();
        let id = queue.enqueue(op(OpKind::Update, "p1", 1)).unwrap();
        queue.fail_permanently(&id, "bad").unwrap();

        let later = Timestamp::from_millis(50_000);
        assert_eq!(queue.retry_all_failed(later).unwrap(), 1);
        let op = queue.get(&id).unwrap();
        assert_eq!(op.status, OpStatus::Pending);
        assert_eq!(op.attempt_count, 0);
        assert_eq!(op.next_retry_at, later);
        assert!(op.last_error.is_none());
    }

    #[test]
    fn completed_operation_is_not_requeued() {
        let queue = OperationQueue::new();
        let original = op(OpKind::Create, "p1", 1);
        let duplicate = original.clone();
        let id = queue.enqueue(original).unwrap();
        queue.mark_in_flight(&id, T0).unwrap();
        queue.complete(&id).unwrap();

        assert_eq!(queue.enqueue(duplicate).unwrap(), id);
        assert!(queue.is_empty());
        assert!(queue.is_succeeded(&id));
    }

    #[test]
    fn archive_is_bounded() {
        let queue = OperationQueue::new().with_archive_capacity(2);
        let ids: Vec<_> = (0..3)
            .map(|i| {
                let id = queue.enqueue(op(OpKind::Create, &format!("p{i}"), i)).unwrap();
                queue.complete(&id).unwrap();
                id
            })
            .collect();
        assert!(!queue.is_succeeded(&ids[0]));
        assert!(queue.is_succeeded(&ids[2]));
        assert_eq!(queue.stats().archived, 2);
    }

    #[test]
    fn paused_type_is_skipped() {
        let queue = OperationQueue::new();
        queue.enqueue(op(OpKind::Create, "p1", 1)).unwrap();
        let order = queue
            .enqueue(QueuedOperation::new("order", "o1", OpKind::Create, json!({}), T0))
            .unwrap();

        queue.pause_type("product");
        assert_eq!(queue.dequeue_next_ready(T0).unwrap().op_id, order);
        assert!(queue.resume_type("product"));
        assert!(!queue.resume_type("product"));
    }

    #[test]
    fn stale_in_flight_is_rearmed() {
        let queue = OperationQueue::new();
        let id = queue.enqueue(op(OpKind::Update, "p1", 1)).unwrap();
        queue.mark_in_flight(&id, T0).unwrap();

        let soon = T0.saturating_add(Duration::from_secs(10));
        assert!(queue.rearm_stale(soon, Duration::from_secs(60)).unwrap().is_empty());

        let later = T0.saturating_add(Duration::from_secs(61));
        assert_eq!(queue.rearm_stale(later, Duration::from_secs(60)).unwrap(), vec![id]);
        let op = queue.get(&id).unwrap();
        assert_eq!(op.status, OpStatus::Pending);
        assert_eq!(op.attempt_count, 0);
    }

    #[test]
    fn release_requires_in_flight() {
        let queue = OperationQueue::new();
        let id = queue.enqueue(op(OpKind::Update, "p1", 1)).unwrap();
        assert!(matches!(
            queue.release(&id, T0),
            Err(CoreError::InvalidTransition { .. })
        ));
        queue.mark_in_flight(&id, T0).unwrap();
        assert_eq!(queue.release(&id, T0).unwrap().status, OpStatus::Pending);
    }

    #[test]
    fn retarget_and_discard() {
        let queue = OperationQueue::new();
        let create = queue.enqueue(op(OpKind::Create, "local", 1)).unwrap();
        queue.enqueue(op(OpKind::Update, "local", 2)).unwrap();
        queue.mark_in_flight(&create, T0).unwrap();

        assert_eq!(queue.retarget("product", "local", "srv-1").unwrap(), 2);
        assert!(!queue.has_outstanding("product", "local"));
        assert!(queue.has_outstanding("product", "srv-1"));

        // The in-flight create survives the discard.
        assert_eq!(queue.discard_outstanding("product", "srv-1").unwrap(), 1);
        assert_eq!(queue.len(), 1);
        assert!(queue.has_in_flight("product", "srv-1"));

        queue.complete(&create).unwrap();
        assert!(!queue.has_in_flight("product", "srv-1"));
    }

    #[test]
    fn missing_operation_is_not_found() {
        let queue = OperationQueue::new();
        let missing = OpId::new();
        assert!(queue.complete(&missing).unwrap_err().is_not_found());
        assert!(queue.retry(&missing, T0).unwrap_err().is_not_found());
    }

    #[test]
    fn reopen_restores_queue() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(KvLog::in_memory());
        let (done, in_flight, pending) = {
            let queue = OperationQueue::open(kv.clone()).unwrap();
            let done = queue.enqueue(op(OpKind::Create, "a", 1)).unwrap();
            queue.complete(&done).unwrap();
            let in_flight = queue.enqueue(op(OpKind::Update, "b", 1)).unwrap();
            queue.mark_in_flight(&in_flight, T0).unwrap();
            let pending = queue.enqueue(op(OpKind::Update, "c", 1)).unwrap();
            (done, in_flight, pending)
        };

        let queue = OperationQueue::open(kv).unwrap();
        assert!(queue.is_succeeded(&done));
        assert_eq!(queue.get(&in_flight).unwrap().status, OpStatus::InFlight);
        assert_eq!(queue.dequeue_next_ready(T0).unwrap().op_id, pending);

        let fresh = queue.enqueue(op(OpKind::Create, "d", 1)).unwrap();
        let seqs: Vec<u64> = queue.list().iter().map(|op| op.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(queue.get(&fresh).unwrap().seq, 4);
    }

    #[test]
    fn concurrent_claims_never_double_send() {
        let queue = Arc::new(OperationQueue::new());
        for i in 0..20 {
            queue.enqueue(op(OpKind::Create, &format!("p{}", i % 4), i)).unwrap();
            queue.enqueue(op(OpKind::Update, &format!("p{}", i % 4), i)).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    let mut claimed = Vec::new();
                    while let Some(op) = queue.claim_next_ready(T0).unwrap() {
                        let busy = queue
                            .list_entity(&op.entity_type, &op.entity_id)
                            .iter()
                            .filter(|o| o.status == OpStatus::InFlight)
                            .count();
                        assert_eq!(busy, 1);
                        claimed.push(op.op_id);
                        queue.complete(&op.op_id).unwrap();
                    }
                    claimed
                })
            })
            .collect();

        let mut total = 0;
        for h in handles {
            total += h.join().unwrap().len();
        }
        assert_eq!(total, 40);
        assert!(queue.is_empty());
    }
}
