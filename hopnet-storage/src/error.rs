//! Storage error types.
//!
//! Any storage failure is treated as fatal by the node: the process
//! aborts rather than risk drifting from the write-ahead log.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// RocksDB error.
    #[error("rocksdb error: {0}")]
    RocksDb(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A record that must exist is missing or unreadable.
    #[error("store corruption: {0}")]
    Corruption(String),

    /// The database was created by an incompatible version.
    #[error("database version {found} is not supported (expected {expected})")]
    VersionMismatch {
        /// Version found in the meta bucket.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },

    /// Another node instance holds the data directory.
    #[error("data directory {path:?} is locked by pid {holder}")]
    Locked {
        /// The contested directory.
        path: PathBuf,
        /// Pid recorded in the lock file.
        holder: u32,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::RocksDb(e.to_string())
    }
}

impl From<hopnet_core::SerializationError> for StorageError {
    fn from(e: hopnet_core::SerializationError) -> Self {
        StorageError::Serialization(e.to_string())
    }
}
