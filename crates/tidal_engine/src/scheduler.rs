//! Cycle scheduling: periodic, on reconnect and on demand.

use crate::cancel::CancelToken;
use crate::config::SchedulerConfig;
use crate::coordinator::SyncCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::events::{CycleReport, CycleRequest};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tidal_core::{ConnectivityEvent, Timestamp};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A cloneable handle resolving to the report of one cycle.
///
/// Every clone resolves to the same report. The cycle runs whether or not
/// the handle is awaited.
pub type CycleHandle = Shared<BoxFuture<'static, CycleReport>>;

/// Decides when sync cycles run.
///
/// Only one cycle runs at a time. Triggering while a cycle is running
/// returns a handle to the running cycle instead of starting another.
pub trait Scheduler: Send + Sync {
    /// Runs a cycle every `interval` while online, keeping at least the
    /// configured minimum spacing from the previous cycle.
    fn schedule_periodic(&self, interval: Duration);

    /// Runs a cycle now, bypassing the minimum spacing.
    fn trigger_now(&self) -> CycleHandle;

    /// Runs a cycle with explicit parameters now.
    fn trigger(&self, request: CycleRequest) -> CycleHandle;

    /// Stops periodic and reconnect triggers and cancels the running cycle.
    ///
    /// Explicit triggers keep working afterwards.
    fn cancel_all(&self);
}

/// [`Scheduler`] running cycles on a tokio runtime.
pub struct TokioScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    coordinator: Arc<SyncCoordinator>,
    config: SchedulerConfig,
    runtime: Handle,
    current: Mutex<Option<CycleHandle>>,
    cancel: Mutex<CancelToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_started: Mutex<Option<Timestamp>>,
    last_reconnect: Mutex<Option<Timestamp>>,
}

impl TokioScheduler {
    /// Creates a scheduler on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NoRuntime`] when called outside a runtime.
    pub fn new(coordinator: Arc<SyncCoordinator>, config: SchedulerConfig) -> SyncResult<Self> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        Ok(Self::with_handle(coordinator, config, runtime))
    }

    /// Creates a scheduler spawning onto `runtime`.
    pub fn with_handle(
        coordinator: Arc<SyncCoordinator>,
        config: SchedulerConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                coordinator,
                config,
                runtime,
                current: Mutex::new(None),
                cancel: Mutex::new(CancelToken::new()),
                tasks: Mutex::new(Vec::new()),
                last_started: Mutex::new(None),
                last_reconnect: Mutex::new(None),
            }),
        }
    }

    /// Returns the scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Triggers a cycle on every `BecameOnline` transition, at most once
    /// per reconnect debounce window.
    pub fn watch_connectivity(&self) {
        // Subscribe before spawning so no transition is missed.
        let events = self.inner.coordinator.network().observe();
        let inner = Arc::clone(&self.inner);
        let task = self.inner.runtime.spawn(inner.reconnect_loop(events));
        self.inner.tasks.lock().push(task);
    }

    /// Returns true while a cycle started by this scheduler is running.
    pub fn is_cycle_running(&self) -> bool {
        self.inner.running_handle().is_some()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_periodic(&self, interval: Duration) {
        info!(?interval, "scheduling periodic sync");
        let inner = Arc::clone(&self.inner);
        let task = self.inner.runtime.spawn(inner.periodic_loop(interval));
        self.inner.tasks.lock().push(task);
    }

    fn trigger_now(&self) -> CycleHandle {
        self.inner.trigger(CycleRequest::new())
    }

    fn trigger(&self, request: CycleRequest) -> CycleHandle {
        self.inner.trigger(request)
    }

    fn cancel_all(&self) {
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        let previous = std::mem::take(&mut *self.inner.cancel.lock());
        previous.cancel();
        info!(stopped = tasks.len(), "scheduler cancelled");
    }
}

impl SchedulerInner {
    fn running_handle(&self) -> Option<CycleHandle> {
        self.current
            .lock()
            .as_ref()
            .filter(|handle| handle.peek().is_none())
            .cloned()
    }

    fn trigger(self: &Arc<Self>, request: CycleRequest) -> CycleHandle {
        let mut current = self.current.lock();
        if let Some(handle) = current.as_ref() {
            if handle.peek().is_none() {
                debug!("cycle already running, joining it");
                return handle.clone();
            }
        }

        let inner = Arc::clone(self);
        let cancel = self.cancel.lock().clone();
        let handle = async move { inner.run(request, cancel).await }
            .boxed()
            .shared();
        // The spawned clone drives the cycle; other clones only observe it.
        self.runtime.spawn(handle.clone().map(|_| ()));
        *current = Some(handle.clone());
        handle
    }

    async fn run(&self, request: CycleRequest, cancel: CancelToken) -> CycleReport {
        *self.last_started.lock() = Some(self.coordinator.clock().now());
        self.coordinator.run_cycle(&request, &cancel).await
    }

    /// Time left until the minimum spacing from the last cycle is kept.
    fn spacing_wait(&self) -> Option<Duration> {
        let last = (*self.last_started.lock())?;
        let since = self.coordinator.clock().now().duration_since(last);
        let min = self.config.min_interval;
        (since < min).then(|| min - since)
    }

    async fn periodic_loop(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            if let Some(wait) = self.spacing_wait() {
                debug!(?wait, "deferring periodic sync for minimum spacing");
                tokio::time::sleep(wait).await;
            }
            if !self.coordinator.network().is_online() {
                debug!("offline, periodic sync skipped");
                continue;
            }
            let report = self.trigger(CycleRequest::new()).await;
            if !report.is_success() && report.skipped.is_none() {
                warn!(errors = report.errors.len(), "periodic sync failed");
            }
        }
    }

    async fn reconnect_loop(
        self: Arc<Self>,
        events: impl futures::Stream<Item = ConnectivityEvent> + Send + 'static,
    ) {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            if event != ConnectivityEvent::BecameOnline {
                continue;
            }
            let now = self.coordinator.clock().now();
            {
                let mut last = self.last_reconnect.lock();
                let debounce = self.coordinator.config().reconnect_debounce;
                if let Some(previous) = *last {
                    if now.duration_since(previous) < debounce {
                        debug!("reconnect within debounce window, not triggering");
                        continue;
                    }
                }
                *last = Some(now);
            }
            info!("network reconnected, triggering sync");
            drop(self.trigger(CycleRequest::new()));
        }
    }
}

impl std::fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("config", &self.inner.config)
            .field("tasks", &self.inner.tasks.lock().len())
            .finish_non_exhaustive()
    }
}
