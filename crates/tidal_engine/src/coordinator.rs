//! Sync coordinator state machine.
//!
//! One cycle runs `Idle -> Pulling -> Pushing -> Idle`. A cycle that hits
//! an unrecoverable error ends in `Failed`, which the next cycle starts
//! from like `Idle`. Cycles never overlap: a second cycle requested while
//! one is running is skipped with [`SkipReason::AlreadyRunning`].

use crate::cancel::CancelToken;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::{
    CycleReport, CycleRequest, EngineStatus, SkipReason, SyncEvent, SyncState, SyncStats,
};
use crate::gateway::RemoteGateway;
use crate::target::{CycleContext, EntitySync, PushOutcome, PushResult, SyncTarget};
use futures::future::join_all;
use futures::Stream;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tidal_core::{
    Clock, ConflictResolver, EntityStore, NetworkMonitor, OperationQueue, Payload,
    QueuedOperation,
};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Orchestrates pull and push for every registered entity type.
pub struct SyncCoordinator {
    queue: Arc<OperationQueue>,
    network: Arc<NetworkMonitor>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    targets: RwLock<BTreeMap<String, Arc<dyn SyncTarget>>>,
    in_progress: AtomicBool,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    status: watch::Sender<EngineStatus>,
    events: broadcast::Sender<SyncEvent>,
}

/// Clears the in-progress flag even if the cycle future is dropped.
struct CycleGuard<'a>(&'a SyncCoordinator);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let coordinator = self.0;
        {
            let mut state = coordinator.state.write();
            if state.is_active() {
                *state = SyncState::Idle;
                coordinator.status.send_replace(EngineStatus::Idle);
            }
        }
        coordinator.in_progress.store(false, Ordering::Release);
    }
}

impl SyncCoordinator {
    /// Creates a coordinator with no registered entity types.
    pub fn new(
        queue: Arc<OperationQueue>,
        network: Arc<NetworkMonitor>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            queue,
            network,
            clock,
            config,
            targets: RwLock::new(BTreeMap::new()),
            in_progress: AtomicBool::new(false),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            status: watch::channel(EngineStatus::Idle).0,
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    /// Registers an entity type, replacing any earlier registration of the
    /// same type.
    pub fn register<T: Payload>(
        &self,
        store: Arc<EntityStore<T>>,
        gateway: Arc<dyn RemoteGateway<T>>,
        resolver: Arc<dyn ConflictResolver<T>>,
    ) {
        let entity_type = store.entity_type().to_string();
        debug!(entity_type = %entity_type, "registered entity type");
        self.targets.write().insert(
            entity_type,
            Arc::new(EntitySync::new(store, gateway, resolver)),
        );
    }

    /// Returns the registered entity types in pull order.
    pub fn entity_types(&self) -> Vec<String> {
        self.targets.read().keys().cloned().collect()
    }

    /// Returns the operation queue.
    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    /// Returns the network monitor.
    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    /// Returns the clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Returns true while a cycle is running.
    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Returns cumulative statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Streams the global sync indicator, starting with its current value.
    pub fn sync_status_stream(&self) -> impl Stream<Item = EngineStatus> + Send + 'static {
        WatchStream::new(self.status.subscribe())
    }

    /// Returns the current global sync indicator.
    pub fn sync_status(&self) -> EngineStatus {
        *self.status.borrow()
    }

    /// Subscribes to engine events sent from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Resumes pushing an entity type paused by an authentication
    /// failure. Returns false if it was not paused.
    pub fn resume_type(&self, entity_type: &str) -> bool {
        let resumed = self.queue.resume_type(entity_type);
        if resumed {
            info!(entity_type, "entity type resumed");
        }
        resumed
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Runs one sync cycle: pull stale (or forced) entity types, then push
    /// ready operations until the queue has nothing ready or the push time
    /// budget is spent.
    ///
    /// Never fails: errors are collected in the returned report, recorded
    /// on operations and entities, and announced as events.
    pub async fn run_cycle(&self, request: &CycleRequest, cancel: &CancelToken) -> CycleReport {
        if !self.network.is_online() {
            debug!("offline, skipping sync cycle");
            return self.finish_skipped(SkipReason::Offline);
        }
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sync cycle already running");
            return self.finish_skipped(SkipReason::AlreadyRunning);
        }
        let _guard = CycleGuard(self);

        let mut report = CycleReport {
            started_at: self.clock.now(),
            ..CycleReport::default()
        };
        self.status.send_replace(EngineStatus::Syncing);
        info!(force_all = request.force_all, "sync cycle started");

        let ctx = CycleContext {
            queue: &self.queue,
            clock: self.clock.as_ref(),
            config: &self.config,
            events: &self.events,
        };

        match self
            .queue
            .rearm_stale(self.clock.now(), self.config.flight_timeout)
        {
            Ok(rearmed) => report.rearmed = rearmed.len(),
            Err(e) => report.errors.push(format!("re-arming stale operations: {e}")),
        }

        let targets: Vec<Arc<dyn SyncTarget>> = self.targets.read().values().cloned().collect();

        self.set_state(SyncState::Pulling);
        self.pull_phase(&ctx, &targets, request, cancel, &mut report)
            .await;

        if !report.cancelled {
            self.set_state(SyncState::Pushing);
            self.push_phase(&ctx, &targets, cancel, &mut report).await;
        }

        self.finish(report)
    }

    async fn pull_phase(
        &self,
        ctx: &CycleContext<'_>,
        targets: &[Arc<dyn SyncTarget>],
        request: &CycleRequest,
        cancel: &CancelToken,
        report: &mut CycleReport,
    ) {
        for target in targets {
            let entity_type = target.entity_type();
            if self.queue.is_paused(entity_type) {
                debug!(entity_type, "entity type paused, skipping pull");
                continue;
            }

            match target.pull(ctx, request.forces(entity_type), cancel).await {
                Ok(outcome) => {
                    if outcome.ran {
                        report.types_pulled += 1;
                    }
                    report.entities_pulled += outcome.applied;
                    report.entities_removed += outcome.removed;
                    report.conflicts.extend(outcome.conflicts);
                }
                Err(SyncError::Cancelled) => {
                    report.cancelled = true;
                    return;
                }
                Err(SyncError::Auth {
                    entity_type,
                    message,
                }) => {
                    warn!(%entity_type, %message, "pull requires authentication");
                    self.queue.pause_type(&entity_type);
                    report
                        .errors
                        .push(format!("{entity_type}: authentication required: {message}"));
                    let _ = self.events.send(SyncEvent::AuthRequired {
                        entity_type,
                        message,
                    });
                }
                Err(e) => {
                    warn!(entity_type, error = %e, "pull failed");
                    report.errors.push(format!("{entity_type}: {e}"));
                }
            }
        }
    }

    async fn push_phase(
        &self,
        ctx: &CycleContext<'_>,
        targets: &[Arc<dyn SyncTarget>],
        cancel: &CancelToken,
        report: &mut CycleReport,
    ) {
        let deadline = Instant::now() + self.config.push_time_budget;

        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return;
            }
            if Instant::now() >= deadline {
                report.budget_exhausted = true;
                return;
            }

            let batch = self.claim_batch(targets, report);
            if batch.is_empty() {
                return;
            }

            let batch_cancel = cancel.child();
            let pushes = join_all(
                batch
                    .into_iter()
                    .map(|(target, op)| target_push(target, ctx, op, &batch_cancel)),
            );
            tokio::pin!(pushes);

            let timed = tokio::time::timeout_at(deadline, &mut pushes).await;
            let outcomes = match timed {
                Ok(outcomes) => outcomes,
                Err(_) => {
                    info!("push time budget exhausted, cancelling in-flight operations");
                    batch_cancel.cancel();
                    report.budget_exhausted = true;
                    pushes.await
                }
            };

            for outcome in outcomes {
                match outcome {
                    Ok(PushOutcome { result, conflict }) => {
                        match result {
                            PushResult::Completed => report.pushed += 1,
                            PushResult::Retrying => report.retried += 1,
                            PushResult::Failed => report.failed += 1,
                            PushResult::Released | PushResult::Cancelled => {}
                        }
                        report.conflicts.extend(conflict);
                    }
                    Err(e) => {
                        warn!(error = %e, "push failed");
                        report.errors.push(e.to_string());
                    }
                }
            }

            if report.budget_exhausted {
                return;
            }
        }
    }

    /// Claims up to `worker_width` ready operations. Distinct claims always
    /// belong to distinct entities.
    fn claim_batch(
        &self,
        targets: &[Arc<dyn SyncTarget>],
        report: &mut CycleReport,
    ) -> Vec<(Arc<dyn SyncTarget>, QueuedOperation)> {
        let mut batch = Vec::with_capacity(self.config.worker_width);
        while batch.len() < self.config.worker_width {
            let now = self.clock.now();
            let op = match self.queue.claim_next_ready(now) {
                Ok(Some(op)) => op,
                Ok(None) => break,
                Err(e) => {
                    report.errors.push(format!("claiming operation: {e}"));
                    break;
                }
            };

            match targets
                .iter()
                .find(|target| target.entity_type() == op.entity_type)
            {
                Some(target) => batch.push((Arc::clone(target), op)),
                None => {
                    let err = SyncError::UnknownEntityType(op.entity_type.clone());
                    warn!(op_id = %op.op_id, error = %err, "pausing unregistered entity type");
                    self.queue.pause_type(&op.entity_type);
                    if let Err(e) = self.queue.release(&op.op_id, now) {
                        report.errors.push(e.to_string());
                    }
                    report.errors.push(err.to_string());
                }
            }
        }
        batch
    }

    fn finish_skipped(&self, reason: SkipReason) -> CycleReport {
        let report = CycleReport::skipped(reason, self.clock.now());
        self.stats.write().record(&report);
        report
    }

    fn finish(&self, mut report: CycleReport) -> CycleReport {
        report.finished_at = self.clock.now();

        let (state, status) = if report.errors.is_empty() {
            (SyncState::Idle, EngineStatus::Idle)
        } else {
            (SyncState::Failed, EngineStatus::Failed)
        };
        self.set_state(state);
        self.status.send_replace(status);
        self.stats.write().record(&report);

        info!(
            pulled = report.entities_pulled,
            pushed = report.pushed,
            retried = report.retried,
            failed = report.failed,
            conflicts = report.conflicts.len(),
            errors = report.errors.len(),
            cancelled = report.cancelled,
            "sync cycle finished"
        );
        let _ = self.events.send(SyncEvent::CycleCompleted(report.clone()));
        report
    }
}

async fn target_push(
    target: Arc<dyn SyncTarget>,
    ctx: &CycleContext<'_>,
    op: QueuedOperation,
    cancel: &CancelToken,
) -> crate::error::SyncResult<PushOutcome> {
    target.push(ctx, op, cancel).await
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("entity_types", &self.entity_types())
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Created, GatewayError, GatewayResult};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use tidal_core::{
        CachedEntity, Connectivity, LastWriteWins, ManualClock, OpId, OpKind, OpStatus,
        QueuedOperation, RemoteRecord, SyncStatus, Timestamp,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        name: String,
    }

    fn item(name: &str) -> Item {
        Item { name: name.into() }
    }

    #[derive(Default)]
    struct StubGateway {
        remote: Mutex<HashMap<String, (Item, String)>>,
        mutations: Mutex<Vec<OpId>>,
        fail_with: Mutex<Option<GatewayError>>,
    }

    impl StubGateway {
        fn failing(&self) -> GatewayResult<()> {
            match self.fail_with.lock().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl RemoteGateway<Item> for StubGateway {
        async fn fetch_all(&self, _cancel: &CancelToken) -> GatewayResult<Vec<RemoteRecord<Item>>> {
            tokio::task::yield_now().await;
            Ok(self
                .remote
                .lock()
                .iter()
                .map(|(id, (payload, etag))| {
                    RemoteRecord::new(id.clone(), payload.clone(), etag.clone(), Timestamp::EPOCH)
                })
                .collect())
        }

        async fn fetch(&self, id: &str, _cancel: &CancelToken) -> GatewayResult<RemoteRecord<Item>> {
            let remote = self.remote.lock();
            let (payload, etag) = remote.get(id).ok_or(GatewayError::NotFound)?;
            Ok(RemoteRecord::new(id, payload.clone(), etag.clone(), Timestamp::EPOCH))
        }

        async fn create(
            &self,
            key: OpId,
            local_id: &str,
            payload: &Item,
            _cancel: &CancelToken,
        ) -> GatewayResult<Created> {
            self.failing()?;
            self.mutations.lock().push(key);
            let etag = format!("etag-{}", self.mutations.lock().len());
            self.remote
                .lock()
                .insert(local_id.to_string(), (payload.clone(), etag.clone()));
            Ok(Created {
                id: local_id.to_string(),
                etag,
            })
        }

        async fn update(
            &self,
            key: OpId,
            id: &str,
            payload: &Item,
            _expected_etag: Option<&str>,
            _cancel: &CancelToken,
        ) -> GatewayResult<String> {
            self.failing()?;
            self.mutations.lock().push(key);
            let etag = format!("etag-{}", self.mutations.lock().len());
            self.remote
                .lock()
                .insert(id.to_string(), (payload.clone(), etag.clone()));
            Ok(etag)
        }

        async fn delete(&self, key: OpId, id: &str, _cancel: &CancelToken) -> GatewayResult<()> {
            self.failing()?;
            self.mutations.lock().push(key);
            self.remote.lock().remove(id);
            Ok(())
        }
    }

    struct Fixture {
        coordinator: SyncCoordinator,
        store: Arc<EntityStore<Item>>,
        gateway: Arc<StubGateway>,
        clock: Arc<ManualClock>,
    }

    fn fixture(online: bool) -> Fixture {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let network = Arc::new(NetworkMonitor::new(if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }));
        let coordinator = SyncCoordinator::new(
            Arc::new(OperationQueue::new()),
            network,
            clock.clone(),
            SyncConfig::default(),
        );
        let store = Arc::new(EntityStore::new("item"));
        let gateway = Arc::new(StubGateway::default());
        coordinator.register(store.clone(), gateway.clone(), Arc::new(LastWriteWins));
        Fixture {
            coordinator,
            store,
            gateway,
            clock,
        }
    }

    fn queue_create(f: &Fixture, id: &str, name: &str) -> OpId {
        f.store
            .upsert(CachedEntity::pending(id, item(name)))
            .unwrap();
        let op = QueuedOperation::new(
            "item",
            id,
            OpKind::Create,
            serde_json::to_value(item(name)).unwrap(),
            f.clock.now(),
        );
        f.coordinator.queue().enqueue(op).unwrap()
    }

    #[tokio::test]
    async fn offline_cycle_is_skipped() {
        let f = fixture(false);
        let report = f
            .coordinator
            .run_cycle(&CycleRequest::new(), &CancelToken::new())
            .await;
        assert_eq!(report.skipped, Some(SkipReason::Offline));
        assert_eq!(f.coordinator.stats().cycles_skipped, 1);
    }

    #[tokio::test]
    async fn pushes_queued_create() {
        let f = fixture(true);
        let op_id = queue_create(&f, "a", "alpha");

        let report = f
            .coordinator
            .run_cycle(&CycleRequest::new(), &CancelToken::new())
            .await;

        assert!(report.is_success());
        assert_eq!(report.pushed, 1);
        assert_eq!(*f.gateway.mutations.lock(), vec![op_id]);
        let entity = f.store.get("a").unwrap();
        assert_eq!(entity.sync_status, SyncStatus::Synced);
        assert_eq!(entity.remote_etag.as_deref(), Some("etag-1"));
        assert!(f.coordinator.queue().is_empty());
        assert_eq!(f.coordinator.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn pull_applies_remote_and_respects_ttl() {
        let f = fixture(true);
        f.gateway
            .remote
            .lock()
            .insert("r".into(), (item("remote"), "e1".into()));

        let first = f
            .coordinator
            .run_cycle(&CycleRequest::new(), &CancelToken::new())
            .await;
        assert_eq!(first.types_pulled, 1);
        assert_eq!(f.store.get("r").unwrap().payload, item("remote"));

        let second = f
            .coordinator
            .run_cycle(&CycleRequest::new(), &CancelToken::new())
            .await;
        assert_eq!(second.types_pulled, 0);

        let forced = f
            .coordinator
            .run_cycle(&CycleRequest::forced_type("item"), &CancelToken::new())
            .await;
        assert_eq!(forced.types_pulled, 1);
    }

    #[tokio::test]
    async fn concurrent_cycle_is_skipped() {
        let f = fixture(true);
        let request = CycleRequest::forced();
        let cancel = CancelToken::new();
        let (a, b) = tokio::join!(
            f.coordinator.run_cycle(&request, &cancel),
            f.coordinator.run_cycle(&request, &cancel)
        );
        assert!(a.skipped.is_none());
        assert_eq!(b.skipped, Some(SkipReason::AlreadyRunning));
        assert!(!f.coordinator.is_running());
    }

    #[tokio::test]
    async fn validation_failure_is_terminal() {
        let f = fixture(true);
        let op_id = queue_create(&f, "a", "alpha");
        *f.gateway.fail_with.lock() = Some(GatewayError::Validation("bad name".into()));
        let mut events = f.coordinator.subscribe_events();

        let report = f
            .coordinator
            .run_cycle(&CycleRequest::new(), &CancelToken::new())
            .await;

        assert_eq!(report.failed, 1);
        let op = f.coordinator.queue().get(&op_id).unwrap();
        assert_eq!(op.status, OpStatus::Failed);
        assert_eq!(f.store.get("a").unwrap().sync_status, SyncStatus::Failed);
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::ValidationRejected { .. }
        ));
    }

    #[tokio::test]
    async fn network_failure_stays_pending() {
        let f = fixture(true);
        let op_id = queue_create(&f, "a", "alpha");
        *f.gateway.fail_with.lock() = Some(GatewayError::Network("down".into()));

        let report = f
            .coordinator
            .run_cycle(&CycleRequest::new(), &CancelToken::new())
            .await;

        assert_eq!(report.retried, 1);
        assert!(report.is_success());
        let op = f.coordinator.queue().get(&op_id).unwrap();
        assert_eq!(op.status, OpStatus::Pending);
        assert_eq!(op.attempt_count, 1);
        assert_eq!(f.store.get("a").unwrap().sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn auth_failure_pauses_type() {
        let f = fixture(true);
        queue_create(&f, "a", "alpha");
        *f.gateway.fail_with.lock() = Some(GatewayError::Auth("expired".into()));

        f.coordinator
            .run_cycle(&CycleRequest::new(), &CancelToken::new())
            .await;
        assert!(f.coordinator.queue().is_paused("item"));
        assert_eq!(f.coordinator.queue().stats().pending, 1);

        *f.gateway.fail_with.lock() = None;
        assert!(f.coordinator.resume_type("item"));
        let report = f
            .coordinator
            .run_cycle(&CycleRequest::new(), &CancelToken::new())
            .await;
        assert_eq!(report.pushed, 1);
    }

    #[tokio::test]
    async fn unregistered_type_is_paused() {
        let f = fixture(true);
        let op = QueuedOperation::new(
            "ghost",
            "g1",
            OpKind::Delete,
            serde_json::Value::Null,
            f.clock.now(),
        );
        f.coordinator.queue().enqueue(op).unwrap();

        let report = f
            .coordinator
            .run_cycle(&CycleRequest::new(), &CancelToken::new())
            .await;

        assert!(!report.is_success());
        assert_eq!(f.coordinator.state(), SyncState::Failed);
        assert_eq!(f.coordinator.sync_status(), EngineStatus::Failed);
        assert!(f.coordinator.queue().is_paused("ghost"));
        assert_eq!(f.coordinator.queue().stats().pending, 1);
    }

    #[tokio::test]
    async fn cancelled_cycle_skips_push() {
        let f = fixture(true);
        queue_create(&f, "a", "alpha");
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = f.coordinator.run_cycle(&CycleRequest::forced(), &cancel).await;
        assert!(report.cancelled);
        assert_eq!(report.pushed, 0);
        assert!(f.gateway.mutations.lock().is_empty());
    }
}
