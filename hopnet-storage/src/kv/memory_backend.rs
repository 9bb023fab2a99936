//! In-memory key-value backend for tests.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{BatchOp, KvBackend, PrefixIterator, WriteBatch};
use crate::error::StorageError;

/// BTreeMap-backed store. Keys stay sorted, so prefix iteration behaves
/// like the RocksDB backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().is_empty()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.data.write().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn prefix_iterator(&self, prefix: &[u8]) -> Result<PrefixIterator<'_>, StorageError> {
        let data = self.data.read().unwrap();
        let prefix = prefix.to_vec();
        let entries: Vec<(Vec<u8>, Vec<u8>)> = data
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(entries.into_iter()))
    }
}
