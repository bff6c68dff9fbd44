//! Typed, observable local cache for one entity type.
//!
//! Each entity lives in its own `watch` slot inside a sharded map, so a
//! write only locks its own shard and every observer of an id sees the
//! latest value the moment it subscribes.

use crate::codec::{decode_row, encode_row, entity_key, entity_prefix, refreshed_key};
use crate::entity::{CachedEntity, Payload, SyncStatus};
use crate::error::{CoreError, CoreResult};
use crate::types::Timestamp;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tidal_storage::KeyValueStore;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

type Slot<T> = watch::Sender<Option<CachedEntity<T>>>;

/// Local persistence for cached entities of a single type.
///
/// # Observation
///
/// [`observe`](Self::observe) replays the current value on subscription and
/// then emits on every change to that id.
/// [`observe_collection`](Self::observe_collection) does the same for the
/// sorted list of all entities.
pub struct EntityStore<T> {
    entity_type: String,
    slots: DashMap<String, Slot<T>>,
    collection: watch::Sender<Vec<CachedEntity<T>>>,
    publish: Mutex<()>,
    refreshed_at: RwLock<Option<Timestamp>>,
    kv: Option<Arc<dyn KeyValueStore>>,
}

impl<T: Payload> EntityStore<T> {
    /// Creates an empty store that keeps entities in memory only.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            slots: DashMap::new(),
            collection: watch::channel(Vec::new()).0,
            publish: Mutex::new(()),
            refreshed_at: RwLock::new(None),
            kv: None,
        }
    }

    /// Opens a store persisted in `kv`, loading every saved entity.
    pub fn open(entity_type: impl Into<String>, kv: Arc<dyn KeyValueStore>) -> CoreResult<Self> {
        let mut store = Self::new(entity_type);

        for (_, row) in kv.scan_prefix(&entity_prefix(&store.entity_type))? {
            let entity: CachedEntity<T> = decode_row(&row)?;
            store
                .slots
                .insert(entity.id.clone(), watch::channel(Some(entity)).0);
        }
        if let Some(row) = kv.get(&refreshed_key(&store.entity_type))? {
            *store.refreshed_at.get_mut() = Some(decode_row(&row)?);
        }

        debug!(
            entity_type = %store.entity_type,
            entities = store.slots.len(),
            "opened entity store"
        );
        store.kv = Some(kv);
        store.publish_collection();
        Ok(store)
    }

    /// Returns the entity type served by this store.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Returns the cached entity with `id`.
    pub fn get(&self, id: &str) -> Option<CachedEntity<T>> {
        self.slots.get(id).and_then(|slot| slot.value().borrow().clone())
    }

    /// Returns true if an entity with `id` is cached.
    pub fn contains(&self, id: &str) -> bool {
        self.slots
            .get(id)
            .is_some_and(|slot| slot.value().borrow().is_some())
    }

    /// Returns every cached entity, ordered by id.
    pub fn get_all(&self) -> Vec<CachedEntity<T>> {
        let mut all: Vec<_> = self
            .slots
            .iter()
            .filter_map(|slot| slot.value().borrow().clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Returns the number of cached entities.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.value().borrow().is_some())
            .count()
    }

    /// Returns true if no entities are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts or replaces an entity, returning the stored copy.
    ///
    /// The stored version is one more than the previous version of that id
    /// (or 1 for a new id), whatever `entity.version` held.
    ///
    /// # Errors
    ///
    /// Returns `MissingEtag` for a `Synced` entity without a remote etag.
    pub fn upsert(&self, mut entity: CachedEntity<T>) -> CoreResult<CachedEntity<T>> {
        if entity.sync_status == SyncStatus::Synced && entity.remote_etag.is_none() {
            return Err(self.missing_etag(&entity.id));
        }

        self.store_after(&mut entity, 0)?;

        debug!(
            entity_type = %self.entity_type,
            entity_id = %entity.id,
            version = entity.version,
            status = ?entity.sync_status,
            "upserted entity"
        );
        self.publish_collection();
        Ok(entity)
    }

    /// Sets the sync status of an entity.
    ///
    /// # Errors
    ///
    /// Returns `EntityNotFound` for a missing id and `MissingEtag` when
    /// marking an entity without a remote etag as `Synced`.
    pub fn mark_status(&self, id: &str, status: SyncStatus) -> CoreResult<()> {
        self.modify(id, |entity| {
            if status == SyncStatus::Synced && entity.remote_etag.is_none() {
                return Err(self.missing_etag(id));
            }
            entity.sync_status = status;
            Ok(())
        })
        .map(|_| ())
    }

    /// Records that the remote accepted the entity with `etag`.
    pub fn mark_synced(
        &self,
        id: &str,
        etag: impl Into<String>,
        at: Timestamp,
    ) -> CoreResult<CachedEntity<T>> {
        let etag = etag.into();
        self.modify(id, move |entity| {
            entity.remote_etag = Some(etag);
            entity.last_synced_at = Some(at);
            entity.sync_status = SyncStatus::Synced;
            Ok(())
        })
    }

    /// Replaces the remote etag an entity's pending change is based on.
    pub fn set_remote_etag(&self, id: &str, etag: impl Into<String>) -> CoreResult<()> {
        let etag = etag.into();
        self.modify(id, move |entity| {
            entity.remote_etag = Some(etag);
            Ok(())
        })
        .map(|_| ())
    }

    /// Removes an entity from the cache, returning it.
    ///
    /// Observers of the id stop receiving values until it is re-inserted;
    /// collection observers see it disappear.
    pub fn remove(&self, id: &str) -> CoreResult<Option<CachedEntity<T>>> {
        let removed = match self.slots.get_mut(id) {
            Some(slot) => {
                let current = slot.value().borrow().clone();
                if current.is_some() {
                    if let Some(kv) = &self.kv {
                        kv.delete(&entity_key(&self.entity_type, id))?;
                    }
                    slot.value().send_replace(None);
                }
                current
            }
            None => None,
        };

        if removed.is_some() {
            debug!(entity_type = %self.entity_type, entity_id = %id, "removed entity");
            self.prune_slots();
            self.publish_collection();
        }
        Ok(removed)
    }

    /// Moves an entity to a new id, such as one assigned by the remote
    /// after a create.
    ///
    /// The moved entity keeps counting versions from where the old id left
    /// off.
    pub fn rekey(&self, old_id: &str, new_id: &str) -> CoreResult<CachedEntity<T>> {
        if old_id == new_id {
            return self
                .get(old_id)
                .ok_or_else(|| CoreError::entity_not_found(&self.entity_type, old_id));
        }
        let mut entity = self
            .remove(old_id)?
            .ok_or_else(|| CoreError::entity_not_found(&self.entity_type, old_id))?;
        entity.id = new_id.to_string();
        let floor = entity.version;
        self.store_after(&mut entity, floor)?;

        debug!(
            entity_type = %self.entity_type,
            old_id,
            new_id,
            version = entity.version,
            "rekeyed entity"
        );
        self.publish_collection();
        Ok(entity)
    }

    /// Subscribes to one entity.
    ///
    /// The stream yields the current value immediately if the entity is
    /// cached, then every later change. It never waits on the network.
    pub fn observe(&self, id: &str) -> impl Stream<Item = CachedEntity<T>> + Send + 'static {
        self.prune_slots();
        let rx = self
            .slots
            .entry(id.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .value()
            .subscribe();
        WatchStream::new(rx).filter_map(|entity| entity)
    }

    /// Subscribes to the sorted list of all cached entities.
    pub fn observe_collection(&self) -> impl Stream<Item = Vec<CachedEntity<T>>> + Send + 'static {
        WatchStream::new(self.collection.subscribe())
    }

    /// Returns when this entity type was last refreshed in full.
    pub fn last_refreshed_at(&self) -> Option<Timestamp> {
        *self.refreshed_at.read()
    }

    /// Records a full refresh of this entity type.
    pub fn set_refreshed_at(&self, at: Timestamp) -> CoreResult<()> {
        let mut refreshed = self.refreshed_at.write();
        if let Some(kv) = &self.kv {
            kv.put(&refreshed_key(&self.entity_type), &encode_row(&at)?)?;
        }
        *refreshed = Some(at);
        Ok(())
    }

    fn modify<F>(&self, id: &str, f: F) -> CoreResult<CachedEntity<T>>
    where
        F: FnOnce(&mut CachedEntity<T>) -> CoreResult<()>,
    {
        let updated = {
            let slot = self
                .slots
                .get_mut(id)
                .ok_or_else(|| CoreError::entity_not_found(&self.entity_type, id))?;
            let mut entity = slot
                .value()
                .borrow()
                .clone()
                .ok_or_else(|| CoreError::entity_not_found(&self.entity_type, id))?;
            f(&mut entity)?;
            self.persist(&entity)?;
            slot.value().send_replace(Some(entity.clone()));
            entity
        };
        self.publish_collection();
        Ok(updated)
    }

    /// Writes `entity` at its id with a version past both `floor` and the
    /// version currently stored there.
    fn store_after(&self, entity: &mut CachedEntity<T>, floor: u64) -> CoreResult<()> {
        let slot = self
            .slots
            .entry(entity.id.clone())
            .or_insert_with(|| watch::channel(None).0);
        let previous = slot.value().borrow().as_ref().map_or(0, |e| e.version);
        entity.version = previous.max(floor) + 1;
        self.persist(entity)?;
        slot.value().send_replace(Some(entity.clone()));
        Ok(())
    }

    /// Drops slots that hold no entity and have no observers left.
    fn prune_slots(&self) {
        self.slots
            .retain(|_, slot| slot.borrow().is_some() || slot.receiver_count() > 0);
    }

    fn persist(&self, entity: &CachedEntity<T>) -> CoreResult<()> {
        if let Some(kv) = &self.kv {
            kv.put(&entity_key(&self.entity_type, &entity.id), &encode_row(entity)?)?;
        }
        Ok(())
    }

    fn publish_collection(&self) {
        // Snapshots are taken and sent under one lock so the last snapshot
        // published is never older than one published before it.
        let _guard = self.publish.lock();
        self.collection.send_replace(self.get_all());
    }

    fn missing_etag(&self, id: &str) -> CoreError {
        CoreError::MissingEtag {
            entity_type: self.entity_type.clone(),
            entity_id: id.to_string(),
        }
    }
}

impl<T> std::fmt::Debug for EntityStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("entity_type", &self.entity_type)
            .field("slots", &self.slots.len())
            .field("persistent", &self.kv.is_some())
            .finish()
    }
}
