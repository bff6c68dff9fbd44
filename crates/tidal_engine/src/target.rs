//! Per-entity-type pull and push logic.
//!
//! The coordinator works with any number of entity types through the
//! object-safe [`SyncTarget`] trait; [`EntitySync`] implements it for one
//! typed store and gateway.

use crate::cancel::CancelToken;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::gateway::{GatewayError, RemoteGateway};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tidal_core::{
    CachedEntity, Clock, ConflictRecord, ConflictResolver, CoreError, CoreResult, EntityStore,
    OpKind, OpStatus, OperationQueue, Payload, QueuedOperation, RemoteRecord, Resolution,
    ResolutionKind, SyncStatus,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Shared collaborators of one running cycle.
pub(crate) struct CycleContext<'a> {
    pub queue: &'a OperationQueue,
    pub clock: &'a dyn Clock,
    pub config: &'a SyncConfig,
    pub events: &'a broadcast::Sender<SyncEvent>,
}

impl CycleContext<'_> {
    fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

/// Result of pulling one entity type.
#[derive(Debug, Default)]
pub(crate) struct PullOutcome {
    pub ran: bool,
    pub applied: usize,
    pub removed: usize,
    pub conflicts: Vec<ConflictRecord>,
}

/// What happened to one pushed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushResult {
    /// Acknowledged by the remote.
    Completed,
    /// Transient failure, rescheduled.
    Retrying,
    /// Moved to `Failed`.
    Failed,
    /// Returned to the queue without charging an attempt.
    Released,
    /// Cancelled mid-flight and left in flight.
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct PushOutcome {
    pub result: PushResult,
    pub conflict: Option<ConflictRecord>,
}

impl PushOutcome {
    fn plain(result: PushResult) -> Self {
        Self {
            result,
            conflict: None,
        }
    }
}

/// Object-safe sync logic for one entity type.
#[async_trait]
pub(crate) trait SyncTarget: Send + Sync {
    fn entity_type(&self) -> &str;

    /// Pulls the entity type if it is stale or `force` is set.
    async fn pull(
        &self,
        ctx: &CycleContext<'_>,
        force: bool,
        cancel: &CancelToken,
    ) -> SyncResult<PullOutcome>;

    /// Pushes one claimed (in-flight) operation.
    async fn push(
        &self,
        ctx: &CycleContext<'_>,
        op: QueuedOperation,
        cancel: &CancelToken,
    ) -> SyncResult<PushOutcome>;
}

/// Store, gateway and resolver for one entity type.
pub(crate) struct EntitySync<T> {
    store: Arc<EntityStore<T>>,
    gateway: Arc<dyn RemoteGateway<T>>,
    resolver: Arc<dyn ConflictResolver<T>>,
}

impl<T: Payload> EntitySync<T> {
    pub fn new(
        store: Arc<EntityStore<T>>,
        gateway: Arc<dyn RemoteGateway<T>>,
        resolver: Arc<dyn ConflictResolver<T>>,
    ) -> Self {
        Self {
            store,
            gateway,
            resolver,
        }
    }

    fn entity_type_str(&self) -> &str {
        self.store.entity_type()
    }

    /// Sets an entity's status, ignoring entities deleted locally.
    fn set_status(&self, id: &str, status: SyncStatus) -> CoreResult<()> {
        match self.store.mark_status(id, status) {
            Err(CoreError::EntityNotFound { .. }) => Ok(()),
            other => other,
        }
    }

    /// Resolves a local pending entity against its remote version and
    /// applies the outcome to the store and queue.
    fn reconcile(
        &self,
        ctx: &CycleContext<'_>,
        local: &CachedEntity<T>,
        remote: &RemoteRecord<T>,
    ) -> SyncResult<ConflictRecord> {
        let entity_type = self.entity_type_str();
        let now = ctx.clock.now();
        let resolution = self.resolver.resolve(local, remote);
        let record = ConflictRecord::new(entity_type, local, remote, resolution.kind());

        match resolution {
            Resolution::Overwritten(payload) => {
                ctx.queue.discard_outstanding(entity_type, &local.id)?;
                self.store.upsert(CachedEntity::synced(
                    local.id.clone(),
                    payload,
                    remote.etag.clone(),
                    now,
                ))?;
            }
            Resolution::Kept(payload) => {
                self.store.set_remote_etag(&local.id, remote.etag.clone())?;
                if !ctx.queue.has_outstanding(entity_type, &local.id) {
                    self.enqueue_update(ctx, &local.id, &payload)?;
                }
            }
            Resolution::Merged(payload) => {
                self.store.upsert(CachedEntity {
                    id: local.id.clone(),
                    payload: payload.clone(),
                    version: local.version,
                    remote_etag: Some(remote.etag.clone()),
                    last_synced_at: local.last_synced_at,
                    sync_status: SyncStatus::Pending,
                })?;
                self.enqueue_update(ctx, &local.id, &payload)?;
            }
        }

        info!(
            entity_type,
            entity_id = %local.id,
            local_version = local.version,
            remote_etag = %remote.etag,
            resolution = ?record.resolution,
            "resolved conflict"
        );
        ctx.emit(SyncEvent::ConflictResolved(record.clone()));
        Ok(record)
    }

    fn enqueue_update(&self, ctx: &CycleContext<'_>, id: &str, payload: &T) -> SyncResult<()> {
        let op = QueuedOperation::new(
            self.entity_type_str(),
            id,
            OpKind::Update,
            serde_json::to_value(payload)?,
            ctx.clock.now(),
        )
        .with_max_attempts(ctx.config.max_attempts);
        ctx.queue.enqueue(op)?;
        Ok(())
    }

    /// Handles a successful remote mutation.
    fn on_success(
        &self,
        ctx: &CycleContext<'_>,
        op: &QueuedOperation,
        created_id: Option<String>,
        etag: Option<String>,
    ) -> SyncResult<()> {
        let entity_type = self.entity_type_str();
        ctx.queue.complete(&op.op_id)?;

        let mut id = op.entity_id.clone();
        if let Some(new_id) = created_id.filter(|new_id| *new_id != op.entity_id) {
            if self.store.contains(&op.entity_id) {
                self.store.rekey(&op.entity_id, &new_id)?;
            }
            ctx.queue.retarget(entity_type, &op.entity_id, &new_id)?;
            info!(entity_type, old_id = %op.entity_id, %new_id, "entity re-keyed by remote");
            ctx.emit(SyncEvent::EntityRekeyed {
                entity_type: entity_type.to_string(),
                old_id: op.entity_id.clone(),
                new_id: new_id.clone(),
            });
            id = new_id;
        }

        if let Some(etag) = etag {
            if !self.store.contains(&id) {
                return Ok(());
            }
            if ctx.queue.has_outstanding(entity_type, &id) {
                // Later edits are still queued; they build on this version.
                self.store.set_remote_etag(&id, etag)?;
                self.set_status(&id, SyncStatus::Pending)?;
            } else {
                self.store.mark_synced(&id, etag, ctx.clock.now())?;
            }
        }
        Ok(())
    }

    /// Handles a failed remote mutation other than a version conflict.
    fn on_error(
        &self,
        ctx: &CycleContext<'_>,
        op: &QueuedOperation,
        err: GatewayError,
    ) -> SyncResult<PushOutcome> {
        let entity_type = self.entity_type_str();

        match err {
            GatewayError::Network(message) => self.fail_transient(ctx, op, message),
            GatewayError::Validation(message) => self.reject(ctx, op, message),
            GatewayError::NotFound if op.kind == OpKind::Delete => {
                self.on_success(ctx, op, None, None)?;
                Ok(PushOutcome::plain(PushResult::Completed))
            }
            GatewayError::NotFound => {
                self.reject(ctx, op, format!("{entity_type}/{} not found remotely", op.entity_id))
            }
            GatewayError::Auth(message) => {
                ctx.queue.release(&op.op_id, ctx.clock.now())?;
                ctx.queue.pause_type(entity_type);
                self.set_status(&op.entity_id, SyncStatus::Pending)?;
                warn!(entity_type, op_id = %op.op_id, %message, "authentication required");
                ctx.emit(SyncEvent::AuthRequired {
                    entity_type: entity_type.to_string(),
                    message,
                });
                Ok(PushOutcome::plain(PushResult::Released))
            }
            GatewayError::Cancelled => {
                self.set_status(&op.entity_id, SyncStatus::Pending)?;
                Ok(PushOutcome::plain(PushResult::Cancelled))
            }
            GatewayError::Conflict { .. } => {
                self.fail_transient(ctx, op, "unresolved version conflict".to_string())
            }
        }
    }

    async fn on_conflict(
        &self,
        ctx: &CycleContext<'_>,
        op: &QueuedOperation,
        cancel: &CancelToken,
    ) -> SyncResult<PushOutcome> {
        let remote = match cancel.run(self.gateway.fetch(&op.entity_id, cancel)).await {
            None | Some(Err(GatewayError::Cancelled)) => {
                self.set_status(&op.entity_id, SyncStatus::Pending)?;
                return Ok(PushOutcome::plain(PushResult::Cancelled));
            }
            Some(Err(GatewayError::NotFound)) if op.kind == OpKind::Update => {
                return self.reject(ctx, op, "remote entity was deleted".to_string());
            }
            Some(Err(err)) => return self.on_error(ctx, op, err),
            Some(Ok(remote)) => remote,
        };

        let Some(local) = self.store.get(&op.entity_id) else {
            // Nothing local left to defend; the remote copy stands.
            ctx.queue.complete(&op.op_id)?;
            return Ok(PushOutcome::plain(PushResult::Completed));
        };

        match op.kind {
            // The entity exists remotely, so the create itself is done.
            OpKind::Create => {
                ctx.queue.complete(&op.op_id)?;
            }
            _ => {
                let retry_at = ctx
                    .clock
                    .now()
                    .saturating_add(ctx.config.backoff.initial_delay);
                ctx.queue.release(&op.op_id, retry_at)?;
            }
        }

        let record = self.reconcile(ctx, &local, &remote)?;
        if record.resolution == ResolutionKind::Kept {
            self.set_status(&op.entity_id, SyncStatus::Pending)?;
        }
        Ok(PushOutcome {
            result: PushResult::Released,
            conflict: Some(record),
        })
    }

    fn fail_transient(
        &self,
        ctx: &CycleContext<'_>,
        op: &QueuedOperation,
        message: String,
    ) -> SyncResult<PushOutcome> {
        let updated = ctx
            .queue
            .fail(&op.op_id, &ctx.config.backoff, ctx.clock.now(), message)?;
        if updated.status == OpStatus::Failed {
            self.set_status(&op.entity_id, SyncStatus::Failed)?;
            ctx.emit(SyncEvent::RetriesExhausted {
                entity_type: op.entity_type.clone(),
                entity_id: op.entity_id.clone(),
                op_id: op.op_id,
                attempts: updated.attempt_count,
            });
            Ok(PushOutcome::plain(PushResult::Failed))
        } else {
            self.set_status(&op.entity_id, SyncStatus::Pending)?;
            Ok(PushOutcome::plain(PushResult::Retrying))
        }
    }

    fn reject(
        &self,
        ctx: &CycleContext<'_>,
        op: &QueuedOperation,
        message: String,
    ) -> SyncResult<PushOutcome> {
        ctx.queue.fail_permanently(&op.op_id, message.clone())?;
        self.set_status(&op.entity_id, SyncStatus::Failed)?;
        warn!(
            entity_type = %op.entity_type,
            entity_id = %op.entity_id,
            op_id = %op.op_id,
            %message,
            "operation rejected"
        );
        ctx.emit(SyncEvent::ValidationRejected {
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            op_id: op.op_id,
            message,
        });
        Ok(PushOutcome::plain(PushResult::Failed))
    }
}

#[async_trait]
impl<T: Payload> SyncTarget for EntitySync<T> {
    fn entity_type(&self) -> &str {
        self.entity_type_str()
    }

    async fn pull(
        &self,
        ctx: &CycleContext<'_>,
        force: bool,
        cancel: &CancelToken,
    ) -> SyncResult<PullOutcome> {
        let entity_type = self.entity_type_str();
        let now = ctx.clock.now();
        let stale = self
            .store
            .last_refreshed_at()
            .map_or(true, |at| now.duration_since(at) > ctx.config.cache_ttl);
        if !stale && !force {
            debug!(entity_type, "cache fresh, skipping pull");
            return Ok(PullOutcome::default());
        }

        let records = match cancel.run(self.gateway.fetch_all(cancel)).await {
            None => return Err(SyncError::Cancelled),
            Some(result) => result.map_err(|e| SyncError::from_gateway(e, entity_type, "*"))?,
        };

        let mut outcome = PullOutcome {
            ran: true,
            ..PullOutcome::default()
        };
        let mut seen = HashSet::with_capacity(records.len());

        for remote in records {
            seen.insert(remote.id.clone());
            if ctx.queue.pending_delete(entity_type, &remote.id) {
                continue;
            }
            // Settled by the push in flight, not by the pull.
            if ctx.queue.has_in_flight(entity_type, &remote.id) {
                debug!(entity_type, entity_id = %remote.id, "operation in flight, not reconciling");
                continue;
            }

            match self.store.get(&remote.id) {
                None => {
                    self.store.upsert(CachedEntity::synced(
                        remote.id.clone(),
                        remote.payload,
                        remote.etag,
                        now,
                    ))?;
                    outcome.applied += 1;
                }
                Some(local)
                    if local.sync_status.has_local_changes()
                        || ctx.queue.has_outstanding(entity_type, &local.id) =>
                {
                    // Same base version: the remote has not moved, our edit stands.
                    if local.remote_etag.as_deref() == Some(remote.etag.as_str()) {
                        continue;
                    }
                    outcome.conflicts.push(self.reconcile(ctx, &local, &remote)?);
                }
                Some(local) => {
                    if local.remote_etag.as_deref() == Some(remote.etag.as_str()) {
                        self.store.mark_synced(&local.id, remote.etag, now)?;
                    } else {
                        self.store.upsert(CachedEntity::synced(
                            remote.id.clone(),
                            remote.payload,
                            remote.etag,
                            now,
                        ))?;
                        outcome.applied += 1;
                    }
                }
            }
        }

        for local in self.store.get_all() {
            if !seen.contains(&local.id)
                && local.sync_status == SyncStatus::Synced
                && !ctx.queue.has_outstanding(entity_type, &local.id)
            {
                self.store.remove(&local.id)?;
                outcome.removed += 1;
            }
        }

        self.store.set_refreshed_at(now)?;
        debug!(
            entity_type,
            applied = outcome.applied,
            removed = outcome.removed,
            conflicts = outcome.conflicts.len(),
            "pulled entity type"
        );
        Ok(outcome)
    }

    async fn push(
        &self,
        ctx: &CycleContext<'_>,
        op: QueuedOperation,
        cancel: &CancelToken,
    ) -> SyncResult<PushOutcome> {
        let payload: Option<T> = match op.kind {
            OpKind::Delete => None,
            OpKind::Create | OpKind::Update => match serde_json::from_value(op.payload.clone()) {
                Ok(payload) => Some(payload),
                Err(e) => return self.reject(ctx, &op, format!("payload does not decode: {e}")),
            },
        };

        self.set_status(&op.entity_id, SyncStatus::Syncing)?;
        debug!(
            entity_type = %op.entity_type,
            entity_id = %op.entity_id,
            op_id = %op.op_id,
            kind = ?op.kind,
            attempt = op.attempt_count + 1,
            "pushing operation"
        );

        let gateway = &self.gateway;
        let answer = match (op.kind, payload.as_ref()) {
            (OpKind::Create, Some(payload)) => cancel
                .run(gateway.create(op.op_id, &op.entity_id, payload, cancel))
                .await
                .map(|r| r.map(|created| (Some(created.id), Some(created.etag)))),
            (OpKind::Update, Some(payload)) => {
                let expected = self
                    .store
                    .get(&op.entity_id)
                    .and_then(|entity| entity.remote_etag);
                cancel
                    .run(gateway.update(
                        op.op_id,
                        &op.entity_id,
                        payload,
                        expected.as_deref(),
                        cancel,
                    ))
                    .await
                    .map(|r| r.map(|etag| (None, Some(etag))))
            }
            _ => cancel
                .run(gateway.delete(op.op_id, &op.entity_id, cancel))
                .await
                .map(|r| r.map(|()| (None, None))),
        };

        match answer {
            None => {
                debug!(op_id = %op.op_id, "push cancelled mid-flight");
                self.set_status(&op.entity_id, SyncStatus::Pending)?;
                Ok(PushOutcome::plain(PushResult::Cancelled))
            }
            Some(Ok((created_id, etag))) => {
                self.on_success(ctx, &op, created_id, etag)?;
                Ok(PushOutcome::plain(PushResult::Completed))
            }
            Some(Err(GatewayError::Conflict { .. })) if op.kind != OpKind::Delete => {
                self.on_conflict(ctx, &op, cancel).await
            }
            Some(Err(err)) => self.on_error(ctx, &op, err),
        }
    }
}
