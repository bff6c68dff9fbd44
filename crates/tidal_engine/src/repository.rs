//! Cache-first facade handed to UI code.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::CycleRequest;
use crate::scheduler::{CycleHandle, Scheduler};
use futures::Stream;
use std::sync::Arc;
use tidal_core::{
    CachedEntity, Clock, CoreError, EntityStore, NetworkMonitor, OpId, OpKind, OperationQueue,
    Payload, QueuedOperation, SyncStatus,
};
use tracing::debug;

/// Typed access to one entity type.
///
/// Reads always answer from the local cache, immediately and also while
/// offline. A read of missing or stale data while online asks the
/// scheduler for a sync in the background; observers see the refreshed
/// value when it lands.
///
/// Writes are optimistic: [`mutate`](Self::mutate) records the operation,
/// updates the cache with `SyncStatus::Pending` and returns. Completion is
/// observed through the entity's `sync_status`.
pub struct Repository<T> {
    store: Arc<EntityStore<T>>,
    queue: Arc<OperationQueue>,
    network: Arc<NetworkMonitor>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    config: SyncConfig,
}

impl<T: Payload> Repository<T> {
    pub(crate) fn new(
        store: Arc<EntityStore<T>>,
        queue: Arc<OperationQueue>,
        network: Arc<NetworkMonitor>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            queue,
            network,
            clock,
            scheduler,
            config,
        }
    }

    /// Returns the entity type.
    pub fn entity_type(&self) -> &str {
        self.store.entity_type()
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<EntityStore<T>> {
        &self.store
    }

    /// Returns the cached entity.
    pub fn get(&self, id: &str) -> Option<CachedEntity<T>> {
        let entity = self.store.get(id);
        match &entity {
            None => self.request_refresh(CycleRequest::forced_type(self.entity_type())),
            Some(cached)
                if cached.sync_status == SyncStatus::Synced
                    && cached.is_stale(self.clock.now(), self.config.cache_ttl) =>
            {
                self.request_refresh(CycleRequest::new())
            }
            Some(_) => self.refresh_if_stale(),
        }
        entity
    }

    /// Returns every cached entity, ordered by id.
    pub fn get_all(&self) -> Vec<CachedEntity<T>> {
        self.refresh_if_stale();
        self.store.get_all()
    }

    /// Observes one entity, starting with its cached value if present.
    pub fn observe_entity(&self, id: &str) -> impl Stream<Item = CachedEntity<T>> + Send + 'static {
        if !self.store.contains(id) {
            self.request_refresh(CycleRequest::forced_type(self.entity_type()));
        } else {
            self.refresh_if_stale();
        }
        self.store.observe(id)
    }

    /// Observes the whole collection, starting with its cached contents.
    pub fn observe_collection(&self) -> impl Stream<Item = Vec<CachedEntity<T>>> + Send + 'static {
        self.refresh_if_stale();
        self.store.observe_collection()
    }

    /// Records a local mutation and applies it to the cache optimistically.
    ///
    /// `payload` is required for `Create` and `Update` and ignored for
    /// `Delete`. Returns the id of the operation now carrying the
    /// mutation, which after coalescing may be an earlier operation's id.
    pub fn mutate(&self, kind: OpKind, id: &str, payload: Option<T>) -> SyncResult<OpId> {
        let entity_type = self.entity_type();
        let value = match (kind, payload.as_ref()) {
            (OpKind::Delete, _) => serde_json::Value::Null,
            (_, Some(payload)) => serde_json::to_value(payload)?,
            (_, None) => {
                return Err(SyncError::validation(format!(
                    "{kind:?} of {entity_type}/{id} requires a payload"
                )))
            }
        };

        let op = QueuedOperation::new(entity_type, id, kind, value, self.clock.now())
            .with_max_attempts(self.config.max_attempts);
        let op_id = self.queue.enqueue(op)?;

        match payload {
            Some(payload) if kind != OpKind::Delete => {
                let previous = self.store.get(id);
                self.store.upsert(CachedEntity {
                    id: id.to_string(),
                    payload,
                    version: 0,
                    remote_etag: previous.as_ref().and_then(|e| e.remote_etag.clone()),
                    last_synced_at: previous.and_then(|e| e.last_synced_at),
                    sync_status: SyncStatus::Pending,
                })?;
            }
            _ => {
                self.store.remove(id)?;
            }
        }

        debug!(entity_type, entity_id = id, %op_id, ?kind, "local mutation recorded");
        if self.network.is_online() {
            drop(self.scheduler.trigger_now());
        }
        Ok(op_id)
    }

    /// Creates an entity locally and queues its creation remotely.
    pub fn create(&self, id: &str, payload: T) -> SyncResult<OpId> {
        self.mutate(OpKind::Create, id, Some(payload))
    }

    /// Replaces an entity locally and queues the update.
    pub fn update(&self, id: &str, payload: T) -> SyncResult<OpId> {
        self.mutate(OpKind::Update, id, Some(payload))
    }

    /// Deletes an entity locally and queues the deletion.
    pub fn delete(&self, id: &str) -> SyncResult<OpId> {
        self.mutate(OpKind::Delete, id, None)
    }

    /// Retries the failed operations of an entity, resetting their attempt
    /// counts. Returns how many operations were reset.
    pub fn retry(&self, id: &str) -> SyncResult<usize> {
        let reset = self
            .queue
            .retry_entity(self.entity_type(), id, self.clock.now())?;
        if reset > 0 {
            match self.store.mark_status(id, SyncStatus::Pending) {
                Ok(()) | Err(CoreError::EntityNotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            if self.network.is_online() {
                drop(self.scheduler.trigger_now());
            }
        }
        Ok(reset)
    }

    /// Pulls this entity type now regardless of cache age, then pushes.
    pub fn refresh(&self) -> CycleHandle {
        self.scheduler
            .trigger(CycleRequest::forced_type(self.entity_type()))
    }

    /// Returns the queued operations of an entity in send order.
    pub fn pending_operations(&self, id: &str) -> Vec<QueuedOperation> {
        self.queue.list_entity(self.entity_type(), id)
    }

    fn type_is_stale(&self) -> bool {
        self.store
            .last_refreshed_at()
            .map_or(true, |at| {
                self.clock.now().duration_since(at) > self.config.cache_ttl
            })
    }

    fn refresh_if_stale(&self) {
        if self.type_is_stale() {
            self.request_refresh(CycleRequest::new());
        }
    }

    fn request_refresh(&self, request: CycleRequest) {
        if self.network.is_online() {
            debug!(entity_type = self.entity_type(), "requesting background refresh");
            drop(self.scheduler.trigger(request));
        }
    }
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            network: Arc::clone(&self.network),
            clock: Arc::clone(&self.clock),
            scheduler: Arc::clone(&self.scheduler),
            config: self.config.clone(),
        }
    }
}

impl<T: Payload> std::fmt::Debug for Repository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("entity_type", &self.store.entity_type())
            .finish_non_exhaustive()
    }
}
