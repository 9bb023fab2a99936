//! The write-ahead log.
//!
//! Protocol per dispatched state change:
//! 1. Append the state change; its id is assigned here.
//! 2. Run the pure transition.
//! 3. Append every emitted event under that id, in emission order.
//! 4. Only then perform side effects (send, submit, ack).
//!
//! On startup the node loads the snapshot and replays every state
//! change past it. Events regenerated during replay are compared
//! against the persisted rows; a mismatch means the code and the log
//! disagree and startup must not continue.

use serde::{Deserialize, Serialize};

use hopnet_core::serialization::{deserialize, serialize};
use hopnet_core::BlockNumber;
use hopnet_state::{Event, StateChange};

use crate::error::StorageError;
use crate::keys;
use crate::kv::{KvBackend, WriteBatch};
use crate::store::NodeStore;

/// A persisted state change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeRecord {
    /// Log-assigned, strictly increasing.
    pub id: u64,
    /// The state change itself.
    pub payload: StateChange,
}

/// A persisted event, tied to the state change that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalEvent {
    /// Id of the producing state change.
    pub state_change_id: u64,
    /// Emission order within that state change.
    pub seq: u32,
    /// Block at which the event was produced.
    pub block_number: BlockNumber,
    /// The event itself.
    pub payload: Event,
}

/// The single snapshot row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Id of the last state change folded into the snapshot.
    pub state_change_id: u64,
    /// Opaque serialized global state; the node owns the layout.
    pub state: Vec<u8>,
}

impl<B: KvBackend> NodeStore<B> {
    /// Append a state change to the log and return its id.
    ///
    /// The id counter and the row are written in one atomic batch, so a
    /// crash can never leave a gap the replay would trip over.
    pub fn log_state_change(&self, change: &StateChange) -> Result<u64, StorageError> {
        let id = self.bump_state_change_id();
        let record = StateChangeRecord { id, payload: change.clone() };

        let mut batch = WriteBatch::new();
        batch.put(keys::state_change(id), serialize(&record)?);
        batch.put(keys::meta_next_state_change(), serialize(&(id + 1))?);
        self.backend.write_batch(batch)?;
        Ok(id)
    }

    /// Append the events a state change produced, in emission order.
    pub fn log_events(
        &self,
        state_change_id: u64,
        block_number: BlockNumber,
        events: &[Event],
    ) -> Result<(), StorageError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for (i, event) in events.iter().enumerate() {
            let seq = i as u32;
            let record = InternalEvent {
                state_change_id,
                seq,
                block_number,
                payload: event.clone(),
            };
            let row_key = keys::event(state_change_id, seq);
            batch.put(row_key.clone(), serialize(&record)?);
            batch.put(keys::event_by_block(block_number, state_change_id, seq), row_key);
        }
        self.backend.write_batch(batch)?;
        Ok(())
    }

    /// State changes with `id > after`, in id order.
    pub fn state_changes_after(&self, after: u64) -> Result<Vec<StateChangeRecord>, StorageError> {
        let mut out = Vec::new();
        for (key, bytes) in self
            .backend
            .prefix_iterator(&keys::KeyPrefix::StateChange.key())?
        {
            let id = keys::parse_id(&key)
                .ok_or_else(|| StorageError::Corruption("malformed state change key".into()))?;
            if id <= after {
                continue;
            }
            out.push(deserialize(&bytes)?);
        }
        Ok(out)
    }

    /// The events one state change produced, in emission order.
    pub fn events_for_state_change(
        &self,
        state_change_id: u64,
    ) -> Result<Vec<InternalEvent>, StorageError> {
        let mut out = Vec::new();
        for (_, bytes) in self
            .backend
            .prefix_iterator(&keys::event_prefix(state_change_id))?
        {
            out.push(deserialize(&bytes)?);
        }
        Ok(out)
    }

    /// Events produced in the block range `from..=to`.
    pub fn events_in_block_range(
        &self,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<InternalEvent>, StorageError> {
        let mut out = Vec::new();
        for (key, row_key) in self
            .backend
            .prefix_iterator(&keys::KeyPrefix::EventByBlock.key())?
        {
            let block = keys::parse_event_block(&key)
                .ok_or_else(|| StorageError::Corruption("malformed block index key".into()))?;
            if block < from {
                continue;
            }
            if block > to {
                break;
            }
            let bytes = self.backend.get(&row_key)?.ok_or_else(|| {
                StorageError::Corruption("block index points at a missing event".into())
            })?;
            out.push(deserialize(&bytes)?);
        }
        Ok(out)
    }

    /// Overwrite the snapshot row.
    pub fn write_snapshot(&self, state_change_id: u64, state: Vec<u8>) -> Result<(), StorageError> {
        let record = SnapshotRecord { state_change_id, state };
        self.backend
            .put(&keys::KeyPrefix::Snapshot.key(), &serialize(&record)?)
    }

    /// Load the snapshot row, if one was ever written.
    pub fn load_snapshot(&self) -> Result<Option<SnapshotRecord>, StorageError> {
        match self.backend.get(&keys::KeyPrefix::Snapshot.key())? {
            None => Ok(None),
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
        }
    }

    /// Compare events regenerated during replay against the log.
    ///
    /// Returns an error naming the first divergence; identical output
    /// passes. Replayed events must never be delivered, only compared.
    pub fn verify_replayed_events(
        &self,
        state_change_id: u64,
        regenerated: &[Event],
    ) -> Result<(), StorageError> {
        let logged = self.events_for_state_change(state_change_id)?;
        if logged.len() != regenerated.len() {
            return Err(StorageError::Corruption(format!(
                "replay of state change {} produced {} events, log has {}",
                state_change_id,
                regenerated.len(),
                logged.len()
            )));
        }
        for (stored, fresh) in logged.iter().zip(regenerated) {
            if stored.payload != *fresh {
                return Err(StorageError::Corruption(format!(
                    "replay of state change {} diverged at event {}",
                    state_change_id, stored.seq
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryBackend;
    use std::sync::Arc;

    fn store() -> NodeStore<MemoryBackend> {
        NodeStore::open(Arc::new(MemoryBackend::new())).unwrap()
    }

    fn block_change(number: BlockNumber) -> StateChange {
        StateChange::Block { number }
    }

    fn invalid_event(tag: &str) -> Event {
        Event::InvalidReceived { reason: tag.into() }
    }

    #[test]
    fn test_ids_are_strictly_increasing() {
        let store = store();
        let a = store.log_state_change(&block_change(1)).unwrap();
        let b = store.log_state_change(&block_change(2)).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_ids_survive_reopen() {
        let backend = Arc::new(MemoryBackend::new());
        let last = {
            let store = NodeStore::open(Arc::clone(&backend)).unwrap();
            store.log_state_change(&block_change(1)).unwrap();
            store.log_state_change(&block_change(2)).unwrap()
        };
        let store = NodeStore::open(backend).unwrap();
        let next = store.log_state_change(&block_change(3)).unwrap();
        assert!(next > last);
    }

    #[test]
    fn test_state_changes_after() {
        let store = store();
        let first = store.log_state_change(&block_change(1)).unwrap();
        store.log_state_change(&block_change(2)).unwrap();
        store.log_state_change(&block_change(3)).unwrap();

        let replayed = store.state_changes_after(first).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].payload, block_change(2));
        assert_eq!(replayed[1].payload, block_change(3));
    }

    #[test]
    fn test_events_keep_emission_order() {
        let store = store();
        let id = store.log_state_change(&block_change(1)).unwrap();
        let events = vec![invalid_event("first"), invalid_event("second")];
        store.log_events(id, 10, &events).unwrap();

        let logged = store.events_for_state_change(id).unwrap();
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[0].payload, events[0]);
        assert_eq!(logged[1].payload, events[1]);
        assert_eq!(logged[0].block_number, 10);
    }

    #[test]
    fn test_events_in_block_range() {
        let store = store();
        for block in [5u64, 10, 15] {
            let id = store.log_state_change(&block_change(block)).unwrap();
            store
                .log_events(id, block, &[invalid_event(&block.to_string())])
                .unwrap();
        }

        let events = store.events_in_block_range(6, 14).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].block_number, 10);

        assert_eq!(store.events_in_block_range(0, 100).unwrap().len(), 3);
    }

    #[test]
    fn test_snapshot_is_single_row() {
        let store = store();
        assert!(store.load_snapshot().unwrap().is_none());

        store.write_snapshot(5, vec![1, 2, 3]).unwrap();
        store.write_snapshot(9, vec![4, 5]).unwrap();

        let snapshot = store.load_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.state_change_id, 9);
        assert_eq!(snapshot.state, vec![4, 5]);
    }

    #[test]
    fn test_replay_verification() {
        let store = store();
        let id = store.log_state_change(&block_change(1)).unwrap();
        let events = vec![invalid_event("only")];
        store.log_events(id, 1, &events).unwrap();

        assert!(store.verify_replayed_events(id, &events).is_ok());
        assert!(store
            .verify_replayed_events(id, &[invalid_event("different")])
            .is_err());
        assert!(store.verify_replayed_events(id, &[]).is_err());
    }
}
