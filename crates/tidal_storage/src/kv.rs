//! Log-structured key-value store.
//!
//! Every mutation is appended to a [`StorageBackend`] as a framed record:
//!
//! ```text
//! | magic "TKV1" | kind u8 | key_len u32 | value_len u32 | key | value | crc32 u32 |
//! ```
//!
//! The full key space is kept in an in-memory ordered index rebuilt on open,
//! so reads never touch the backend. A record that is cut short or fails its
//! checksum at the very end of the log is treated as a torn write from a
//! crash and truncated away; the same failure anywhere else, or a header
//! that is not a record header at all, is corruption.

use crate::backend::StorageBackend;
use crate::crc::crc32;
use crate::error::{StorageError, StorageResult};
use crate::memory::InMemoryBackend;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const MAGIC: [u8; 4] = *b"TKV1";
const HEADER_LEN: usize = 4 + 1 + 4 + 4;
const CRC_LEN: usize = 4;

const KIND_PUT: u8 = 1;
const KIND_DELETE: u8 = 2;

/// The narrow persistence contract used by the entity store and the
/// operation queue.
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored under `key`.
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Returns every pair whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Size accounting for a [`KvLog`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KvStats {
    /// Number of live keys.
    pub live_keys: usize,
    /// Bytes the live records would occupy after compaction.
    pub live_bytes: u64,
    /// Bytes currently in the log.
    pub log_bytes: u64,
}

impl KvStats {
    /// Fraction of the log occupied by superseded records.
    #[must_use]
    pub fn garbage_ratio(&self) -> f64 {
        if self.log_bytes == 0 {
            return 0.0;
        }
        1.0 - (self.live_bytes as f64 / self.log_bytes as f64)
    }
}

/// A key-value store persisted as an append-only log.
pub struct KvLog {
    backend: Mutex<Box<dyn StorageBackend>>,
    index: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    sync_on_write: bool,
}

impl KvLog {
    /// Opens a log over `backend`, replaying existing records.
    ///
    /// Every write is synced before it returns.
    pub fn open(backend: Box<dyn StorageBackend>) -> StorageResult<Self> {
        Self::open_with(backend, true)
    }

    /// Opens a log, choosing whether each write is synced immediately.
    pub fn open_with(
        mut backend: Box<dyn StorageBackend>,
        sync_on_write: bool,
    ) -> StorageResult<Self> {
        let bytes = backend.read_all()?;
        let (index, valid_len) = replay(&bytes)?;

        if (valid_len as usize) < bytes.len() {
            warn!(
                dropped = bytes.len() - valid_len as usize,
                "truncating torn record at end of log"
            );
            backend.truncate(valid_len)?;
            backend.sync()?;
        }
        debug!(keys = index.len(), bytes = valid_len, "replayed key-value log");

        Ok(Self {
            backend: Mutex::new(backend),
            index: RwLock::new(index),
            sync_on_write,
        })
    }

    /// Creates an empty log held entirely in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backend: Mutex::new(Box::new(InMemoryBackend::new())),
            index: RwLock::new(BTreeMap::new()),
            sync_on_write: false,
        }
    }

    /// Returns size accounting for this log.
    pub fn stats(&self) -> StorageResult<KvStats> {
        let log_bytes = self.backend.lock().size()?;
        let index = self.index.read();
        let live_bytes = index
            .iter()
            .map(|(k, v)| record_len(k.len(), v.len()) as u64)
            .sum();
        Ok(KvStats {
            live_keys: index.len(),
            live_bytes,
            log_bytes,
        })
    }

    /// Returns the number of live keys.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Returns true if no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Forces all appended records to durable storage.
    pub fn sync(&self) -> StorageResult<()> {
        self.backend.lock().sync()
    }

    /// Rewrites only the live records into `target` and switches to it.
    ///
    /// The old backend is dropped once `target` has been synced, so a crash
    /// during compaction leaves the original log untouched.
    pub fn compact_into(&self, mut target: Box<dyn StorageBackend>) -> StorageResult<KvStats> {
        let mut backend = self.backend.lock();
        let index = self.index.read();

        if target.size()? != 0 {
            return Err(StorageError::Corrupted(
                "compaction target must be empty".to_string(),
            ));
        }

        let mut buf = Vec::new();
        for (key, value) in index.iter() {
            encode_record(&mut buf, KIND_PUT, key, value)?;
        }
        target.append(&buf)?;
        target.sync()?;

        let before = backend.size()?;
        *backend = target;
        debug!(before, after = buf.len(), "compacted key-value log");

        Ok(KvStats {
            live_keys: index.len(),
            live_bytes: buf.len() as u64,
            log_bytes: buf.len() as u64,
        })
    }

    fn write(&self, kind: u8, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let mut buf = Vec::with_capacity(record_len(key.len(), value.len()));
        encode_record(&mut buf, kind, key, value)?;

        let mut backend = self.backend.lock();
        backend.append(&buf)?;
        if self.sync_on_write {
            backend.sync()?;
        }

        // Index is updated while the backend lock is held so log order and
        // index order agree.
        let mut index = self.index.write();
        match kind {
            KIND_PUT => {
                index.insert(key.to_vec(), value.to_vec());
            }
            _ => {
                index.remove(key);
            }
        }
        Ok(())
    }
}

impl KeyValueStore for KvLog {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.index.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.write(KIND_PUT, key, value)
    }

    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        if !self.index.read().contains_key(key) {
            return Ok(());
        }
        self.write(KIND_DELETE, key, &[])
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let index = self.index.read();
        Ok(index
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

impl std::fmt::Debug for KvLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvLog")
            .field("live_keys", &self.len())
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

fn record_len(key_len: usize, value_len: usize) -> usize {
    HEADER_LEN + key_len + value_len + CRC_LEN
}

fn encode_record(buf: &mut Vec<u8>, kind: u8, key: &[u8], value: &[u8]) -> StorageResult<()> {
    let key_len = u32::try_from(key.len()).map_err(|_| StorageError::RecordTooLarge(key.len()))?;
    let value_len =
        u32::try_from(value.len()).map_err(|_| StorageError::RecordTooLarge(value.len()))?;

    let start = buf.len();
    buf.extend_from_slice(&MAGIC);
    buf.push(kind);
    buf.extend_from_slice(&key_len.to_le_bytes());
    buf.extend_from_slice(&value_len.to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    let crc = crc32(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Replays `bytes`, returning the index and the length of the valid prefix.
fn replay(bytes: &[u8]) -> StorageResult<(BTreeMap<Vec<u8>, Vec<u8>>, u64)> {
    let mut index = BTreeMap::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let rest = &bytes[pos..];
        if !header_is_plausible(rest) {
            return Err(StorageError::Corrupted(format!(
                "invalid record header at offset {pos}"
            )));
        }
        if rest.len() < HEADER_LEN {
            break;
        }

        let key_len = read_u32(&rest[5..9]) as usize;
        let value_len = read_u32(&rest[9..13]) as usize;
        let total = record_len(key_len, value_len);
        if rest.len() < total {
            // A torn write is a prefix of one record and holds no complete
            // record after its header.
            if holds_record(&rest[HEADER_LEN..]) {
                return Err(StorageError::Corrupted(format!(
                    "record at offset {pos} overruns the records after it"
                )));
            }
            break;
        }

        let body = &rest[..total - CRC_LEN];
        let stored_crc = read_u32(&rest[total - CRC_LEN..total]);
        if crc32(body) != stored_crc {
            if pos + total == bytes.len() {
                break;
            }
            return Err(StorageError::Corrupted(format!(
                "checksum mismatch at offset {pos}"
            )));
        }

        let key = rest[HEADER_LEN..HEADER_LEN + key_len].to_vec();
        if rest[4] == KIND_PUT {
            let value = rest[HEADER_LEN + key_len..HEADER_LEN + key_len + value_len].to_vec();
            index.insert(key, value);
        } else {
            index.remove(&key);
        }
        pos += total;
    }

    Ok((index, pos as u64))
}

/// Returns true if `rest` starts like a record: the magic (or a prefix of
/// it, when cut short) followed by a known kind.
fn header_is_plausible(rest: &[u8]) -> bool {
    let magic_len = rest.len().min(MAGIC.len());
    rest[..magic_len] == MAGIC[..magic_len]
        && rest
            .get(MAGIC.len())
            .map_or(true, |kind| matches!(*kind, KIND_PUT | KIND_DELETE))
}

/// Returns true if a complete record with a valid checksum starts anywhere
/// in `bytes`.
fn holds_record(bytes: &[u8]) -> bool {
    (0..bytes.len()).any(|start| {
        let rest = &bytes[start..];
        if rest.len() < HEADER_LEN + CRC_LEN || !rest.starts_with(&MAGIC) {
            return false;
        }
        if !header_is_plausible(rest) {
            return false;
        }
        let total = record_len(
            read_u32(&rest[5..9]) as usize,
            read_u32(&rest[9..13]) as usize,
        );
        rest.len() >= total
            && crc32(&rest[..total - CRC_LEN]) == read_u32(&rest[total - CRC_LEN..total])
    })
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(arr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileBackend;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn image_of(log: &KvLog) -> Vec<u8> {
        log.backend.lock().read_all().unwrap()
    }

    #[test]
    fn put_get_delete() {
        let log = KvLog::in_memory();
        log.put(b"q/1", b"create").unwrap();
        log.put(b"q/1", b"update").unwrap();
        assert_eq!(log.get(b"q/1").unwrap(), Some(b"update".to_vec()));

        log.delete(b"q/1").unwrap();
        assert_eq!(log.get(b"q/1").unwrap(), None);
        assert!(log.is_empty());

        // Deleting a missing key writes nothing.
        let size = log.stats().unwrap().log_bytes;
        log.delete(b"q/404").unwrap();
        assert_eq!(log.stats().unwrap().log_bytes, size);
    }

    #[test]
    fn scan_prefix_is_ordered_and_bounded() {
        let log = KvLog::in_memory();
        log.put(b"e/product/b", b"2").unwrap();
        log.put(b"e/product/a", b"1").unwrap();
        log.put(b"e/order/a", b"x").unwrap();
        log.put(b"q/1", b"op").unwrap();

        let rows = log.scan_prefix(b"e/product/").unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"e/product/a".to_vec(), b"e/product/b".to_vec()]);
    }

    #[test]
    fn reopen_replays_records() {
        let log = KvLog::in_memory();
        log.put(b"a", b"1").unwrap();
        log.put(b"b", b"2").unwrap();
        log.delete(b"a").unwrap();

        let reopened = KvLog::open(Box::new(InMemoryBackend::with_data(image_of(&log)))).unwrap();
        assert_eq!(reopened.get(b"a").unwrap(), None);
        assert_eq!(reopened.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn torn_tail_is_truncated() {
        let log = KvLog::in_memory();
        log.put(b"kept", b"value").unwrap();
        let good = image_of(&log);

        log.put(b"torn", b"half-written").unwrap();
        let mut image = image_of(&log);
        image.truncate(image.len() - 5);

        let reopened = KvLog::open(Box::new(InMemoryBackend::with_data(image))).unwrap();
        assert_eq!(reopened.get(b"kept").unwrap(), Some(b"value".to_vec()));
        assert_eq!(reopened.get(b"torn").unwrap(), None);
        assert_eq!(reopened.stats().unwrap().log_bytes, good.len() as u64);
    }

    #[test]
    fn corrupted_tail_checksum_is_truncated() {
        let log = KvLog::in_memory();
        log.put(b"a", b"1").unwrap();
        log.put(b"b", b"2").unwrap();
        let mut image = image_of(&log);
        let last = image.len() - 1;
        image[last] ^= 0xFF;

        let reopened = KvLog::open(Box::new(InMemoryBackend::with_data(image))).unwrap();
        assert_eq!(reopened.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(reopened.get(b"b").unwrap(), None);
    }

    #[test]
    fn corruption_before_tail_is_an_error() {
        let log = KvLog::in_memory();
        log.put(b"a", b"1").unwrap();
        log.put(b"b", b"2").unwrap();
        let mut image = image_of(&log);
        image[HEADER_LEN] ^= 0xFF;

        let result = KvLog::open(Box::new(InMemoryBackend::with_data(image)));
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn corrupt_length_before_tail_is_an_error() {
        let log = KvLog::in_memory();
        log.put(b"a", b"1").unwrap();
        log.put(b"b", b"2").unwrap();
        log.put(b"c", b"3").unwrap();
        let mut image = image_of(&log);
        // First record's key_len now runs past the end of the log.
        image[8] = 0x7F;

        let result = KvLog::open(Box::new(InMemoryBackend::with_data(image)));
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn bad_magic_is_an_error() {
        let log = KvLog::in_memory();
        log.put(b"a", b"1").unwrap();
        let mut image = image_of(&log);
        image[0] = b'X';

        let result = KvLog::open(Box::new(InMemoryBackend::with_data(image)));
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn torn_header_is_truncated() {
        let log = KvLog::in_memory();
        log.put(b"kept", b"value").unwrap();
        let good = image_of(&log);
        let mut image = good.clone();
        image.extend_from_slice(&MAGIC[..3]);

        let reopened = KvLog::open(Box::new(InMemoryBackend::with_data(image))).unwrap();
        assert_eq!(reopened.get(b"kept").unwrap(), Some(b"value".to_vec()));
        assert_eq!(reopened.stats().unwrap().log_bytes, good.len() as u64);
    }

    #[test]
    fn compaction_drops_superseded_records() {
        let log = KvLog::in_memory();
        for i in 0..10u8 {
            log.put(b"hot", &[i]).unwrap();
        }
        log.put(b"cold", b"c").unwrap();
        assert!(log.stats().unwrap().garbage_ratio() > 0.5);

        let stats = log.compact_into(Box::new(InMemoryBackend::new())).unwrap();
        assert_eq!(stats.live_keys, 2);
        assert_eq!(stats.log_bytes, stats.live_bytes);
        assert_eq!(log.get(b"hot").unwrap(), Some(vec![9]));

        let reopened = KvLog::open(Box::new(InMemoryBackend::with_data(image_of(&log)))).unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn file_backed_log_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        {
            let log = KvLog::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
            log.put(b"q/op-1", b"pending").unwrap();
        }
        let log = KvLog::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
        assert_eq!(log.get(b"q/op-1").unwrap(), Some(b"pending".to_vec()));
    }

    proptest! {
        #[test]
        fn replay_matches_model(ops in prop::collection::vec(
            (any::<bool>(), 0u8..8, prop::collection::vec(any::<u8>(), 0..16)),
            0..64,
        )) {
            let log = KvLog::in_memory();
            let mut model = BTreeMap::new();
            for (is_put, key, value) in ops {
                let key = vec![key];
                if is_put {
                    log.put(&key, &value).unwrap();
                    model.insert(key, value);
                } else {
                    log.delete(&key).unwrap();
                    model.remove(&key);
                }
            }

            let reopened = KvLog::open(Box::new(InMemoryBackend::with_data(image_of(&log)))).unwrap();
            let replayed: BTreeMap<_, _> = reopened.scan_prefix(b"").unwrap().into_iter().collect();
            prop_assert_eq!(replayed, model);
        }
    }
}
