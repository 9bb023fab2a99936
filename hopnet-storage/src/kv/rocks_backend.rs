//! RocksDB key-value backend.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{IteratorMode, Options, DB};

use super::{BatchOp, KvBackend, PrefixIterator, WriteBatch};
use crate::error::StorageError;

/// Persistent RocksDB-backed store.
///
/// The write-ahead log depends on batch atomicity: either a batch's
/// rows are all replayable after a crash or none are, which RocksDB's
/// WriteBatch guarantees.
pub struct RocksBackend {
    db: Arc<DB>,
}

impl RocksBackend {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_write_buffer_size(16 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);

        let db = DB::open(&opts, path)?;
        Ok(Self { db: Arc::new(db) })
    }
}

impl KvBackend for RocksBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.put(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db.delete(key)?;
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => rocks_batch.put(&key, &value),
                BatchOp::Delete { key } => rocks_batch.delete(&key),
            }
        }
        self.db.write(rocks_batch)?;
        Ok(())
    }

    fn prefix_iterator(&self, prefix: &[u8]) -> Result<PrefixIterator<'_>, StorageError> {
        let iter = self.db.iterator(IteratorMode::From(prefix, rocksdb::Direction::Forward));
        let prefix = prefix.to_vec();
        let iter = iter
            .filter_map(|result| result.ok())
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .take_while(move |(k, _)| k.starts_with(&prefix));
        Ok(Box::new(iter))
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
