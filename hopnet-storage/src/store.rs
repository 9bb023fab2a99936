//! The node store: every bucket the protocol persists.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use hopnet_core::serialization::{deserialize, serialize};
use hopnet_core::{Address, BlockNumber, ChannelId, SecretHash, TokenAddress};
use hopnet_state::Channel;

use crate::error::StorageError;
use crate::keys;
use crate::kv::KvBackend;

/// Schema version written to fresh databases.
pub const DB_VERSION: u32 = 1;

/// Delivery status of a reveal-secret message, keyed by echo hash.
///
/// Consulted on restart so a crash between "reveal sent" and "ack
/// received" does not reveal twice or stall forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SentSecretStatus {
    /// The message was handed to the transport.
    Sent,
    /// The peer acknowledged the message.
    Acknowledged,
}

/// An outbound message awaiting its ack, persisted for redelivery
/// across restarts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Echo hash identifying the delivery.
    pub echo_hash: [u8; 32],
    /// The peer the message is for.
    pub recipient: Address,
    /// The framed message bytes.
    pub data: Vec<u8>,
}

/// Handle to the node's persistent state.
///
/// The store is shared between the event loop (the only writer of the
/// write-ahead log) and background tasks (readers); the backend is
/// internally synchronised.
pub struct NodeStore<B: KvBackend> {
    pub(crate) backend: Arc<B>,
    pub(crate) next_state_change_id: AtomicU64,
    /// Whether the previous run ended without a clean shutdown.
    crashed_last_run: bool,
}

impl<B: KvBackend> NodeStore<B> {
    /// Open the store, creating or validating the schema and recording
    /// that the database is now in use (the clean-shutdown flag is
    /// cleared until [`NodeStore::close`]).
    pub fn open(backend: Arc<B>) -> Result<Self, StorageError> {
        let version_key = keys::meta_version();
        match backend.get(&version_key)? {
            None => {
                backend.put(&version_key, &serialize(&DB_VERSION)?)?;
            }
            Some(bytes) => {
                let found: u32 = deserialize(&bytes)?;
                if found != DB_VERSION {
                    return Err(StorageError::VersionMismatch { found, expected: DB_VERSION });
                }
            }
        }

        let crashed_last_run = match backend.get(&keys::meta_clean_shutdown())? {
            None => false, // fresh database
            Some(bytes) => !deserialize::<bool>(&bytes)?,
        };
        backend.put(&keys::meta_clean_shutdown(), &serialize(&false)?)?;

        let next_state_change_id = match backend.get(&keys::meta_next_state_change())? {
            None => 1,
            Some(bytes) => deserialize::<u64>(&bytes)?,
        };

        Ok(NodeStore {
            backend,
            next_state_change_id: AtomicU64::new(next_state_change_id),
            crashed_last_run,
        })
    }

    /// Whether the previous run crashed (no clean shutdown recorded).
    pub fn crashed_last_run(&self) -> bool {
        self.crashed_last_run
    }

    /// Record a clean shutdown and flush.
    pub fn close(&self) -> Result<(), StorageError> {
        self.backend
            .put(&keys::meta_clean_shutdown(), &serialize(&true)?)?;
        self.backend.flush()
    }

    /// Direct access to the backend (shared with replay helpers).
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    // === Channels and tokens ===

    /// Persist a channel row, overwriting any previous serialization.
    pub fn put_channel(&self, channel: &Channel) -> Result<(), StorageError> {
        let key = keys::channel(&channel.channel_id());
        self.backend.put(&key, &serialize(channel)?)?;
        Ok(())
    }

    /// Load a channel row.
    pub fn get_channel(&self, id: &ChannelId) -> Result<Option<Channel>, StorageError> {
        match self.backend.get(&keys::channel(id))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
        }
    }

    /// Load every persisted channel.
    pub fn channels(&self) -> Result<Vec<Channel>, StorageError> {
        let mut out = Vec::new();
        for (_, bytes) in self
            .backend
            .prefix_iterator(&keys::KeyPrefix::Channel.key())?
        {
            out.push(deserialize(&bytes)?);
        }
        Ok(out)
    }

    /// Remove a settled channel's row.
    pub fn remove_channel(&self, id: &ChannelId) -> Result<(), StorageError> {
        self.backend.delete(&keys::channel(id))
    }

    /// Register a token network.
    pub fn register_token(&self, token: &TokenAddress) -> Result<(), StorageError> {
        self.backend.put(&keys::token(token), &[])
    }

    /// All registered token networks.
    pub fn tokens(&self) -> Result<Vec<TokenAddress>, StorageError> {
        let mut out = Vec::new();
        for (key, _) in self.backend.prefix_iterator(&keys::KeyPrefix::Token.key())? {
            if key.len() == 21 {
                let mut token = [0u8; 20];
                token.copy_from_slice(&key[1..]);
                out.push(token);
            }
        }
        Ok(out)
    }

    // === Disposed locks ===

    /// Record that we declared a lock abandoned. Once recorded, no
    /// unlock for this pair may ever be produced.
    pub fn add_disposed_lock(
        &self,
        secret_hash: &SecretHash,
        channel_id: &ChannelId,
    ) -> Result<(), StorageError> {
        self.backend
            .put(&keys::disposed_lock(secret_hash, channel_id), &[])
    }

    /// Whether a lock was declared abandoned.
    pub fn is_lock_disposed(
        &self,
        secret_hash: &SecretHash,
        channel_id: &ChannelId,
    ) -> Result<bool, StorageError> {
        self.backend
            .exists(&keys::disposed_lock(secret_hash, channel_id))
    }

    // === Sent secrets ===

    /// Record the delivery status of a reveal-secret message.
    pub fn set_sent_secret(
        &self,
        echo_hash: &[u8; 32],
        status: SentSecretStatus,
    ) -> Result<(), StorageError> {
        self.backend
            .put(&keys::sent_secret(echo_hash), &serialize(&status)?)
    }

    /// Delivery status of a reveal-secret message, if recorded.
    pub fn sent_secret(
        &self,
        echo_hash: &[u8; 32],
    ) -> Result<Option<SentSecretStatus>, StorageError> {
        match self.backend.get(&keys::sent_secret(echo_hash))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
        }
    }

    // === Outbox ===

    /// Persist an unacknowledged outbound message so a crash between
    /// send and ack redelivers it on restart.
    pub fn put_outbox(&self, entry: &OutboxEntry) -> Result<(), StorageError> {
        self.backend
            .put(&keys::outbox(&entry.echo_hash), &serialize(entry)?)
    }

    /// Drop an outbox row once its ack arrived.
    pub fn remove_outbox(&self, echo_hash: &[u8; 32]) -> Result<(), StorageError> {
        self.backend.delete(&keys::outbox(echo_hash))
    }

    /// Every message still awaiting its ack.
    pub fn outbox(&self) -> Result<Vec<OutboxEntry>, StorageError> {
        let mut out = Vec::new();
        for (_, bytes) in self.backend.prefix_iterator(&keys::KeyPrefix::Outbox.key())? {
            out.push(deserialize(&bytes)?);
        }
        Ok(out)
    }

    // === Singletons ===

    /// Record the latest confirmed block.
    pub fn set_latest_block(&self, block: BlockNumber) -> Result<(), StorageError> {
        self.backend
            .put(&keys::KeyPrefix::LatestBlock.key(), &serialize(&block)?)
    }

    /// The latest confirmed block, if recorded.
    pub fn latest_block(&self) -> Result<Option<BlockNumber>, StorageError> {
        match self.backend.get(&keys::KeyPrefix::LatestBlock.key())? {
            None => Ok(None),
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
        }
    }

    /// Record the escrow registry contract address.
    pub fn set_registry_address(&self, address: &Address) -> Result<(), StorageError> {
        self.backend
            .put(&keys::KeyPrefix::RegistryAddress.key(), &serialize(address)?)
    }

    /// The escrow registry contract address, if recorded.
    pub fn registry_address(&self) -> Result<Option<Address>, StorageError> {
        match self.backend.get(&keys::KeyPrefix::RegistryAddress.key())? {
            None => Ok(None),
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
        }
    }

    /// Record the secret registry contract address.
    pub fn set_secret_registry_address(&self, address: &Address) -> Result<(), StorageError> {
        self.backend.put(
            &keys::KeyPrefix::SecretRegistryAddress.key(),
            &serialize(address)?,
        )
    }

    /// The secret registry contract address, if recorded.
    pub fn secret_registry_address(&self) -> Result<Option<Address>, StorageError> {
        match self
            .backend
            .get(&keys::KeyPrefix::SecretRegistryAddress.key())?
        {
            None => Ok(None),
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
        }
    }
}

impl<B: KvBackend> NodeStore<B> {
    pub(crate) fn bump_state_change_id(&self) -> u64 {
        self.next_state_change_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Id of the most recently appended state change; 0 before any.
    pub fn last_state_change_id(&self) -> u64 {
        self.next_state_change_id.load(Ordering::SeqCst) - 1
    }
}
