//! Test fixtures and engine helpers.
//!
//! [`TestHarness`] wires a complete engine for one `product` entity type
//! around a [`ManualClock`], a [`MockGateway`] and a network monitor that
//! starts offline. Storage is in memory unless a store directory is given.

use crate::mock_gateway::MockGateway;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tidal_core::{
    BackoffPolicy, Clock, Connectivity, ConflictResolver, EntityStore, LastWriteWins, ManualClock,
    NetworkMonitor, OperationQueue, StoreDir, SyncStatus, Timestamp,
};
use tidal_engine::{
    CancelToken, CycleReport, CycleRequest, Repository, Scheduler, SchedulerConfig, SyncConfig,
    SyncEngine,
};

/// Entity type name used by the harness.
pub const PRODUCT: &str = "product";

/// Start time of the harness clock.
pub const START: Timestamp = Timestamp::from_millis(1_700_000_000_000);

/// The sample entity used throughout the tests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Product {
    /// Display name.
    pub name: String,
    /// Price in cents.
    pub price: u32,
}

/// Creates a product.
pub fn product(name: &str, price: u32) -> Product {
    Product {
        name: name.to_string(),
        price,
    }
}

/// A configuration with jitter-free backoff, for predictable retry times.
///
/// Retries wait 1 s, 2 s, 4 s, ... up to 60 s.
pub fn deterministic_config() -> SyncConfig {
    SyncConfig::default().with_backoff(
        BackoffPolicy::new(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(60))
            .without_jitter(),
    )
}

/// A fully wired engine for tests.
///
/// Must be built inside a tokio runtime.
pub struct TestHarness {
    /// The manual clock shared by every component.
    pub clock: Arc<ManualClock>,
    /// The network monitor. Starts offline.
    pub network: Arc<NetworkMonitor>,
    /// The operation queue.
    pub queue: Arc<OperationQueue>,
    /// The product store.
    pub store: Arc<EntityStore<Product>>,
    /// The remote.
    pub gateway: Arc<MockGateway<Product>>,
    /// The engine.
    pub engine: SyncEngine,
    /// The product repository.
    pub products: Repository<Product>,
    dir: Option<StoreDir>,
    _temp_dir: Option<TempDir>,
}

impl TestHarness {
    /// Creates an in-memory harness with [`deterministic_config`].
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts configuring a harness.
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Reports the network as online. Does not run a cycle by itself
    /// unless the engine was started.
    pub fn go_online(&self) {
        self.network.set_online();
    }

    /// Reports the network as offline.
    pub fn go_offline(&self) {
        self.network.set_offline();
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Runs one cycle through the scheduler, joining a running one.
    pub async fn sync(&self) -> CycleReport {
        self.engine.scheduler().trigger(CycleRequest::new()).await
    }

    /// Runs one cycle pulling every entity type.
    pub async fn sync_forced(&self) -> CycleReport {
        self.engine.sync_now().await
    }

    /// Runs one cycle directly on the coordinator with a caller token.
    pub async fn sync_with(&self, request: CycleRequest, cancel: &CancelToken) -> CycleReport {
        self.engine.coordinator().run_cycle(&request, cancel).await
    }

    /// Returns the sync status of a cached product.
    pub fn status(&self, id: &str) -> Option<SyncStatus> {
        self.store.get(id).map(|entity| entity.sync_status)
    }

    /// Returns the cached product payload.
    pub fn local(&self, id: &str) -> Option<Product> {
        self.store.get(id).map(|entity| entity.payload)
    }

    /// Returns the store directory path if persistent.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(StoreDir::path)
    }

    /// Shuts the engine down and releases the store directory, returning
    /// the pieces a restarted harness reuses.
    pub fn into_parts(self) -> (Arc<ManualClock>, Arc<MockGateway<Product>>) {
        self.engine.shutdown();
        (self.clock, self.gateway)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`TestHarness`].
pub struct HarnessBuilder {
    config: SyncConfig,
    scheduler_config: SchedulerConfig,
    resolver: Arc<dyn ConflictResolver<Product>>,
    clock: Option<Arc<ManualClock>>,
    gateway: Option<Arc<MockGateway<Product>>>,
    dir: Option<PathBuf>,
    temp_dir: bool,
    online: bool,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            config: deterministic_config(),
            scheduler_config: SchedulerConfig::default(),
            resolver: Arc::new(LastWriteWins),
            clock: None,
            gateway: None,
            dir: None,
            temp_dir: false,
            online: false,
        }
    }
}

impl HarnessBuilder {
    /// Sets the sync configuration.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the scheduler configuration.
    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    /// Sets the conflict resolver.
    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver<Product>>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Reuses a clock, e.g. from a harness being restarted.
    pub fn clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Reuses a remote, e.g. from a harness being restarted.
    pub fn gateway(mut self, gateway: Arc<MockGateway<Product>>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Persists entities and operations under `path`.
    pub fn store_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.dir = Some(path.into());
        self
    }

    /// Persists entities and operations in a fresh temporary directory.
    pub fn temp_store(mut self) -> Self {
        self.temp_dir = true;
        self
    }

    /// Starts online.
    pub fn online(mut self) -> Self {
        self.online = true;
        self
    }

    /// Builds the harness.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime or if the store directory cannot be
    /// opened.
    pub fn build(self) -> TestHarness {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(ManualClock::new(START)));
        let shared_clock: Arc<dyn Clock> = clock.clone();
        let gateway = self
            .gateway
            .unwrap_or_else(|| Arc::new(MockGateway::new(shared_clock.clone())));
        let network = Arc::new(NetworkMonitor::new(if self.online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }));

        let temp_dir = self
            .temp_dir
            .then(|| TempDir::new().expect("Failed to create temp directory"));
        let path = self
            .dir
            .or_else(|| temp_dir.as_ref().map(|dir| dir.path().join("store")));

        let (queue, store, dir) = match path {
            Some(path) => {
                let dir = StoreDir::open(&path, true).expect("Failed to open store directory");
                let entities = dir.open_entities().expect("Failed to open entity log");
                let ops = dir.open_queue().expect("Failed to open queue log");
                let queue = OperationQueue::open(ops).expect("Failed to load queue");
                let store = EntityStore::open(PRODUCT, entities).expect("Failed to load store");
                (queue, store, Some(dir))
            }
            None => (OperationQueue::new(), EntityStore::new(PRODUCT), None),
        };
        let queue = Arc::new(queue);
        let store = Arc::new(store);

        let engine = SyncEngine::new(
            queue.clone(),
            network.clone(),
            shared_clock,
            self.config,
            self.scheduler_config,
        )
        .expect("TestHarness must be built inside a tokio runtime");
        let products =
            engine.repository_with_resolver(store.clone(), gateway.clone(), self.resolver);

        TestHarness {
            clock,
            network,
            queue,
            store,
            gateway,
            engine,
            products,
            dir,
            _temp_dir: temp_dir,
        }
    }
}
