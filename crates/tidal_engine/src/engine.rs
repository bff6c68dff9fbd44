//! Engine wiring.

use crate::config::{SchedulerConfig, SyncConfig};
use crate::coordinator::SyncCoordinator;
use crate::error::SyncResult;
use crate::events::{CycleRequest, EngineStatus, SyncEvent, SyncStats};
use crate::gateway::RemoteGateway;
use crate::repository::Repository;
use crate::scheduler::{CycleHandle, Scheduler, TokioScheduler};
use futures::Stream;
use std::sync::Arc;
use tidal_core::{
    Clock, ConflictResolver, EntityStore, LastWriteWins, NetworkMonitor, OperationQueue, Payload,
};
use tokio::sync::broadcast;
use tracing::info;

/// The offline-first sync engine.
///
/// Owns one [`SyncCoordinator`] and one [`TokioScheduler`]. Entity types
/// are registered by asking for their [`Repository`].
///
/// # Example
///
/// ```ignore
/// let engine = SyncEngine::new(queue, network, clock, SyncConfig::default(), SchedulerConfig::default())?;
/// let products = engine.repository(store, gateway);
/// engine.start();
/// products.update("p1", Product { name: "Tea".into(), price: 100 })?;
/// ```
pub struct SyncEngine {
    coordinator: Arc<SyncCoordinator>,
    scheduler: Arc<TokioScheduler>,
}

impl SyncEngine {
    /// Creates an engine on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NoRuntime` when called outside a runtime.
    pub fn new(
        queue: Arc<OperationQueue>,
        network: Arc<NetworkMonitor>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
        scheduler_config: SchedulerConfig,
    ) -> SyncResult<Self> {
        let coordinator = Arc::new(SyncCoordinator::new(queue, network, clock, config));
        let scheduler = Arc::new(TokioScheduler::new(
            Arc::clone(&coordinator),
            scheduler_config,
        )?);
        Ok(Self {
            coordinator,
            scheduler,
        })
    }

    /// Registers an entity type with last-write-wins conflict resolution
    /// and returns its repository.
    pub fn repository<T: Payload>(
        &self,
        store: Arc<EntityStore<T>>,
        gateway: Arc<dyn RemoteGateway<T>>,
    ) -> Repository<T> {
        self.repository_with_resolver(store, gateway, Arc::new(LastWriteWins))
    }

    /// Registers an entity type with a custom conflict resolver and returns
    /// its repository.
    pub fn repository_with_resolver<T: Payload>(
        &self,
        store: Arc<EntityStore<T>>,
        gateway: Arc<dyn RemoteGateway<T>>,
        resolver: Arc<dyn ConflictResolver<T>>,
    ) -> Repository<T> {
        self.coordinator
            .register(Arc::clone(&store), gateway, resolver);
        let scheduler: Arc<dyn Scheduler> = self.scheduler.clone();
        Repository::new(
            store,
            Arc::clone(self.coordinator.queue()),
            Arc::clone(self.coordinator.network()),
            Arc::clone(self.coordinator.clock()),
            scheduler,
            self.coordinator.config().clone(),
        )
    }

    /// Starts periodic and reconnect-triggered cycles.
    pub fn start(&self) {
        let interval = self.scheduler.config().periodic_interval;
        self.scheduler.schedule_periodic(interval);
        self.scheduler.watch_connectivity();
        info!(?interval, "sync engine started");
    }

    /// Stops background cycles and cancels the running one.
    pub fn shutdown(&self) {
        self.scheduler.cancel_all();
        info!("sync engine stopped");
    }

    /// Runs a cycle pulling every entity type regardless of cache age.
    pub fn sync_now(&self) -> CycleHandle {
        self.scheduler.trigger(CycleRequest::forced())
    }

    /// Returns the coordinator.
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Returns the scheduler.
    pub fn scheduler(&self) -> &Arc<TokioScheduler> {
        &self.scheduler
    }

    /// Returns the operation queue.
    pub fn queue(&self) -> &Arc<OperationQueue> {
        self.coordinator.queue()
    }

    /// Returns the network monitor.
    pub fn network(&self) -> &Arc<NetworkMonitor> {
        self.coordinator.network()
    }

    /// Streams the global sync indicator.
    pub fn sync_status_stream(&self) -> impl Stream<Item = EngineStatus> + Send + 'static {
        self.coordinator.sync_status_stream()
    }

    /// Subscribes to engine events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.coordinator.subscribe_events()
    }

    /// Returns cumulative statistics.
    pub fn stats(&self) -> SyncStats {
        self.coordinator.stats()
    }

    /// Resumes an entity type paused by an authentication failure and
    /// triggers a cycle.
    pub fn resume_type(&self, entity_type: &str) -> bool {
        let resumed = self.coordinator.resume_type(entity_type);
        if resumed && self.network().is_online() {
            drop(self.scheduler.trigger_now());
        }
        resumed
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("coordinator", &self.coordinator)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
