//! In-memory remote gateway.
//!
//! [`MockGateway`] behaves like a well-formed REST backend: every stored
//! version has an etag and a last-modified time, updates check the
//! expected etag, and mutations are idempotent per key. Every call is
//! logged so tests can assert exactly what reached the "network".

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tidal_core::{Clock, OpId, Payload, RemoteRecord};
use tidal_engine::{CancelToken, Created, GatewayError, GatewayResult, RemoteGateway};

/// One call received by a [`MockGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// `fetch_all`.
    FetchAll,
    /// `fetch(id)`.
    Fetch {
        /// Requested id.
        id: String,
    },
    /// `create`.
    Create {
        /// Idempotency key.
        key: OpId,
        /// Id the client used locally.
        local_id: String,
    },
    /// `update`.
    Update {
        /// Idempotency key.
        key: OpId,
        /// Target id.
        id: String,
        /// Etag the client based its change on.
        expected_etag: Option<String>,
    },
    /// `delete`.
    Delete {
        /// Idempotency key.
        key: OpId,
        /// Target id.
        id: String,
    },
}

impl GatewayCall {
    /// Returns the idempotency key of a mutation.
    pub fn key(&self) -> Option<OpId> {
        match self {
            GatewayCall::Create { key, .. }
            | GatewayCall::Update { key, .. }
            | GatewayCall::Delete { key, .. } => Some(*key),
            GatewayCall::FetchAll | GatewayCall::Fetch { .. } => None,
        }
    }

    /// Returns true for create, update and delete.
    pub fn is_mutation(&self) -> bool {
        self.key().is_some()
    }
}

/// Answer remembered for an idempotency key.
#[derive(Debug, Clone)]
enum Applied {
    Created(Created),
    Updated(String),
    Deleted,
}

struct RemoteState<T> {
    records: BTreeMap<String, RemoteRecord<T>>,
    next_etag: u64,
    next_server_id: u64,
    calls: Vec<GatewayCall>,
    applied: HashMap<OpId, Applied>,
    scripted: VecDeque<GatewayError>,
    fail_always: Option<GatewayError>,
    fetch_failure: Option<GatewayError>,
}

impl<T> RemoteState<T> {
    fn etag(&mut self) -> String {
        self.next_etag += 1;
        format!("etag-{}", self.next_etag)
    }

    fn mutation_failure(&mut self) -> GatewayResult<()> {
        if let Some(err) = self.scripted.pop_front() {
            return Err(err);
        }
        match &self.fail_always {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// An in-memory remote for one entity type.
pub struct MockGateway<T> {
    clock: Arc<dyn Clock>,
    state: Mutex<RemoteState<T>>,
    assign_ids: bool,
    check_etags: bool,
    latency: Option<Duration>,
}

impl<T: Payload> MockGateway<T> {
    /// Creates an empty remote stamping modifications with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(RemoteState {
                records: BTreeMap::new(),
                next_etag: 0,
                next_server_id: 0,
                calls: Vec::new(),
                applied: HashMap::new(),
                scripted: VecDeque::new(),
                fail_always: None,
                fetch_failure: None,
            }),
            assign_ids: false,
            check_etags: true,
            latency: None,
        }
    }

    /// Makes the remote assign its own ids (`srv-1`, `srv-2`, ...) on create.
    pub fn with_server_ids(mut self) -> Self {
        self.assign_ids = true;
        self
    }

    /// Accepts every update regardless of the expected etag.
    pub fn without_etag_checks(mut self) -> Self {
        self.check_etags = false;
        self
    }

    /// Delays every call by `latency` unless cancelled.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Stores a record as if another client created it. Returns its etag.
    pub fn seed(&self, id: &str, payload: T) -> String {
        self.remote_edit(id, payload)
    }

    /// Replaces a record as if another client edited it. Returns the new etag.
    pub fn remote_edit(&self, id: &str, payload: T) -> String {
        let mut state = self.state.lock();
        let etag = state.etag();
        let record = RemoteRecord::new(id, payload, etag.clone(), self.clock.now());
        state.records.insert(id.to_string(), record);
        etag
    }

    /// Removes a record as if another client deleted it.
    pub fn remote_delete(&self, id: &str) -> bool {
        self.state.lock().records.remove(id).is_some()
    }

    /// Returns the stored record.
    pub fn get(&self, id: &str) -> Option<RemoteRecord<T>> {
        self.state.lock().records.get(id).cloned()
    }

    /// Returns the stored payload.
    pub fn payload(&self, id: &str) -> Option<T> {
        self.get(id).map(|record| record.payload)
    }

    /// Returns every stored record ordered by id.
    pub fn records(&self) -> Vec<RemoteRecord<T>> {
        self.state.lock().records.values().cloned().collect()
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails the next mutation with `err`. Calls queue up in order.
    pub fn fail_next(&self, err: GatewayError) {
        self.state.lock().scripted.push_back(err);
    }

    /// Fails every mutation with `err` until cleared.
    pub fn fail_always(&self, err: GatewayError) {
        self.state.lock().fail_always = Some(err);
    }

    /// Fails every fetch with `err` until cleared.
    pub fn fail_fetches(&self, err: GatewayError) {
        self.state.lock().fetch_failure = Some(err);
    }

    /// Clears scripted and permanent failures.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.scripted.clear();
        state.fail_always = None;
        state.fetch_failure = None;
    }

    /// Returns every call received, in order.
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().calls.clone()
    }

    /// Returns the mutation calls received, in order.
    pub fn mutations(&self) -> Vec<GatewayCall> {
        self.calls()
            .into_iter()
            .filter(GatewayCall::is_mutation)
            .collect()
    }

    /// Returns how many calls carried `key`.
    pub fn calls_with_key(&self, key: OpId) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.key() == Some(key))
            .count()
    }

    /// Forgets the call log.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, call: GatewayCall) {
        self.state.lock().calls.push(call);
    }

    async fn delay(&self, cancel: &CancelToken) -> GatewayResult<()> {
        if let Some(latency) = self.latency {
            tokio::select! {
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        Ok(())
    }

    fn fetch_failure(&self) -> GatewayResult<()> {
        match &self.state.lock().fetch_failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<T: Payload> RemoteGateway<T> for MockGateway<T> {
    async fn fetch_all(&self, cancel: &CancelToken) -> GatewayResult<Vec<RemoteRecord<T>>> {
        self.record(GatewayCall::FetchAll);
        self.delay(cancel).await?;
        self.fetch_failure()?;
        Ok(self.records())
    }

    async fn fetch(&self, id: &str, cancel: &CancelToken) -> GatewayResult<RemoteRecord<T>> {
        self.record(GatewayCall::Fetch { id: id.to_string() });
        self.delay(cancel).await?;
        self.fetch_failure()?;
        self.get(id).ok_or(GatewayError::NotFound)
    }

    async fn create(
        &self,
        key: OpId,
        local_id: &str,
        payload: &T,
        cancel: &CancelToken,
    ) -> GatewayResult<Created> {
        self.record(GatewayCall::Create {
            key,
            local_id: local_id.to_string(),
        });
        self.delay(cancel).await?;

        let mut state = self.state.lock();
        if let Some(Applied::Created(created)) = state.applied.get(&key) {
            return Ok(created.clone());
        }
        state.mutation_failure()?;

        let id = if self.assign_ids {
            state.next_server_id += 1;
            format!("srv-{}", state.next_server_id)
        } else {
            local_id.to_string()
        };
        if let Some(existing) = state.records.get(&id) {
            return Err(GatewayError::Conflict {
                current_etag: Some(existing.etag.clone()),
            });
        }

        let etag = state.etag();
        let record = RemoteRecord::new(id.clone(), payload.clone(), etag.clone(), self.clock.now());
        state.records.insert(id.clone(), record);
        let created = Created { id, etag };
        state.applied.insert(key, Applied::Created(created.clone()));
        Ok(created)
    }

    async fn update(
        &self,
        key: OpId,
        id: &str,
        payload: &T,
        expected_etag: Option<&str>,
        cancel: &CancelToken,
    ) -> GatewayResult<String> {
        self.record(GatewayCall::Update {
            key,
            id: id.to_string(),
            expected_etag: expected_etag.map(str::to_string),
        });
        self.delay(cancel).await?;

        let mut state = self.state.lock();
        if let Some(Applied::Updated(etag)) = state.applied.get(&key) {
            return Ok(etag.clone());
        }
        state.mutation_failure()?;

        let current = state
            .records
            .get(id)
            .map(|record| record.etag.clone())
            .ok_or(GatewayError::NotFound)?;
        if self.check_etags {
            if let Some(expected) = expected_etag {
                if expected != current {
                    return Err(GatewayError::Conflict {
                        current_etag: Some(current),
                    });
                }
            }
        }

        let etag = state.etag();
        let record = RemoteRecord::new(id, payload.clone(), etag.clone(), self.clock.now());
        state.records.insert(id.to_string(), record);
        state.applied.insert(key, Applied::Updated(etag.clone()));
        Ok(etag)
    }

    async fn delete(&self, key: OpId, id: &str, cancel: &CancelToken) -> GatewayResult<()> {
        self.record(GatewayCall::Delete {
            key,
            id: id.to_string(),
        });
        self.delay(cancel).await?;

        let mut state = self.state.lock();
        if let Some(Applied::Deleted) = state.applied.get(&key) {
            return Ok(());
        }
        state.mutation_failure()?;

        if state.records.remove(id).is_none() {
            return Err(GatewayError::NotFound);
        }
        state.applied.insert(key, Applied::Deleted);
        Ok(())
    }
}

impl<T> std::fmt::Debug for MockGateway<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockGateway")
            .field("records", &state.records.len())
            .field("calls", &state.calls.len())
            .field("assign_ids", &self.assign_ids)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_core::{ManualClock, Timestamp};

    fn gateway() -> MockGateway<u32> {
        MockGateway::new(Arc::new(ManualClock::new(Timestamp::from_millis(5))))
    }

    #[tokio::test]
    async fn create_is_idempotent_per_key() {
        let gw = gateway();
        let key = OpId::new();
        let cancel = CancelToken::new();

        let first = gw.create(key, "a", &1, &cancel).await.unwrap();
        let again = gw.create(key, "a", &1, &cancel).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(gw.len(), 1);
        assert_eq!(gw.calls_with_key(key), 2);
    }

    #[tokio::test]
    async fn update_checks_expected_etag() {
        let gw = gateway();
        let etag = gw.seed("a", 1);
        let cancel = CancelToken::new();

        let err = gw
            .update(OpId::new(), "a", &2, Some("stale"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::Conflict {
                current_etag: Some(etag.clone())
            }
        );

        let next = gw
            .update(OpId::new(), "a", &2, Some(&etag), &cancel)
            .await
            .unwrap();
        assert_ne!(next, etag);
        assert_eq!(gw.payload("a"), Some(2));
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let gw = gateway();
        gw.fail_next(GatewayError::Network("reset".into()));
        let cancel = CancelToken::new();

        let err = gw.delete(OpId::new(), "a", &cancel).await.unwrap_err();
        assert_eq!(err, GatewayError::Network("reset".into()));
        let err = gw.delete(OpId::new(), "a", &cancel).await.unwrap_err();
        assert_eq!(err, GatewayError::NotFound);
    }

    #[tokio::test]
    async fn server_ids_are_assigned() {
        let gw = gateway().with_server_ids();
        let created = gw
            .create(OpId::new(), "local-1", &7, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(created.id, "srv-1");
        assert!(gw.get("local-1").is_none());
    }

    #[tokio::test]
    async fn latency_honours_cancellation() {
        let gw = gateway().with_latency(Duration::from_secs(3600));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = gw.fetch_all(&cancel).await.unwrap_err();
        assert_eq!(err, GatewayError::Cancelled);
        assert_eq!(gw.calls(), vec![GatewayCall::FetchAll]);
    }
}
