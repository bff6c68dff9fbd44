//! # Tidal Storage
//!
//! Durable storage for the Tidal offline-first sync engine.
//!
//! Two layers live here:
//!
//! - [`StorageBackend`] - an opaque, append-only byte store. Backends know
//!   nothing about records; they read, append, sync and truncate bytes.
//! - [`KvLog`] - a log-structured key-value store layered on any backend.
//!   It implements [`KeyValueStore`], the get/put/delete/scan contract the
//!   entity store and operation queue persist through.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - for tests and ephemeral caches
//! - [`FileBackend`] - for persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use tidal_storage::{KeyValueStore, KvLog};
//!
//! let log = KvLog::in_memory();
//! log.put(b"e/product/p1", b"payload").unwrap();
//! assert_eq!(log.get(b"e/product/p1").unwrap().as_deref(), Some(&b"payload"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod crc;
mod error;
mod file;
mod kv;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use kv::{KeyValueStore, KvLog, KvStats};
pub use memory::InMemoryBackend;
