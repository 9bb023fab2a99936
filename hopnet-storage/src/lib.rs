//! # Hopnet Storage
//!
//! Persistence for the hopnet node: an append-only write-ahead log of
//! state changes and the events they produced, a single overwritten
//! snapshot row, per-channel rows, and the auxiliary indices the
//! protocol needs across restarts (disposed locks, sent secrets, latest
//! block, contract addresses).
//!
//! Everything sits on the [`kv::KvBackend`] abstraction with an
//! in-memory implementation for tests and a RocksDB implementation for
//! production.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod keys;
pub mod kv;
pub mod lock_file;
pub mod store;
pub mod wal;

pub use error::StorageError;
pub use kv::{KvBackend, MemoryBackend, RocksBackend, WriteBatch};
pub use lock_file::DirectoryLock;
pub use store::{NodeStore, OutboxEntry, SentSecretStatus};
pub use wal::{InternalEvent, SnapshotRecord, StateChangeRecord};
