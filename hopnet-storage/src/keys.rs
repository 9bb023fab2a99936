//! Key schema for the node store.
//!
//! Every bucket gets a single-byte prefix so one RocksDB column holds
//! all buckets and range scans stay cheap. Numeric suffixes are
//! big-endian so lexicographic key order matches numeric order.

use hopnet_core::{BlockNumber, ChannelId, SecretHash, TokenAddress};

/// Bucket prefixes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyPrefix {
    /// Meta rows: `0x01 || name`.
    Meta = 0x01,
    /// State change: `0x02 || id`.
    StateChange = 0x02,
    /// Internal event: `0x03 || id`.
    Event = 0x03,
    /// Event id by block: `0x04 || block || id`.
    EventByBlock = 0x04,
    /// The single snapshot row: `0x05`.
    Snapshot = 0x05,
    /// Channel row: `0x06 || channel_id`.
    Channel = 0x06,
    /// Registered token: `0x07 || token_address`.
    Token = 0x07,
    /// Disposed lock: `0x08 || secret_hash || channel_id`.
    DisposedLock = 0x08,
    /// Sent secret status: `0x09 || echo_hash`.
    SentSecret = 0x09,
    /// Latest confirmed block: `0x0A`.
    LatestBlock = 0x0A,
    /// Registry contract address: `0x0B`.
    RegistryAddress = 0x0B,
    /// Secret registry contract address: `0x0C`.
    SecretRegistryAddress = 0x0C,
    /// Unacknowledged outbound message: `0x0D || echo_hash`.
    Outbox = 0x0D,
}

impl KeyPrefix {
    /// The prefix as a one-byte key (for singleton rows and scans).
    pub fn key(self) -> Vec<u8> {
        vec![self as u8]
    }
}

/// Meta row: schema version.
pub fn meta_version() -> Vec<u8> {
    meta(b"version")
}

/// Meta row: clean shutdown flag.
pub fn meta_clean_shutdown() -> Vec<u8> {
    meta(b"clean_shutdown")
}

/// Meta row: next state change id to assign.
pub fn meta_next_state_change() -> Vec<u8> {
    meta(b"next_state_change_id")
}

fn meta(name: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(KeyPrefix::Meta as u8);
    key.extend_from_slice(name);
    key
}

/// State change row by id.
pub fn state_change(id: u64) -> Vec<u8> {
    prefixed_u64(KeyPrefix::StateChange, id)
}

/// Event row, keyed by the state change that produced it plus the
/// emission sequence number within that state change.
pub fn event(state_change_id: u64, seq: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(13);
    key.push(KeyPrefix::Event as u8);
    key.extend_from_slice(&state_change_id.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Prefix covering all events of one state change.
pub fn event_prefix(state_change_id: u64) -> Vec<u8> {
    prefixed_u64(KeyPrefix::Event, state_change_id)
}

/// Block index entry pointing at an event row.
pub fn event_by_block(block: BlockNumber, state_change_id: u64, seq: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(KeyPrefix::EventByBlock as u8);
    key.extend_from_slice(&block.to_be_bytes());
    key.extend_from_slice(&state_change_id.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Parse the block number out of a block index key.
pub fn parse_event_block(key: &[u8]) -> Option<BlockNumber> {
    if key.len() != 21 || key[0] != KeyPrefix::EventByBlock as u8 {
        return None;
    }
    Some(BlockNumber::from_be_bytes(key[1..9].try_into().ok()?))
}

/// Channel row by contract identifier.
pub fn channel(id: &ChannelId) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(KeyPrefix::Channel as u8);
    key.extend_from_slice(id);
    key
}

/// Token registration row.
pub fn token(address: &TokenAddress) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(KeyPrefix::Token as u8);
    key.extend_from_slice(address);
    key
}

/// Disposed lock row.
pub fn disposed_lock(secret_hash: &SecretHash, channel_id: &ChannelId) -> Vec<u8> {
    let mut key = Vec::with_capacity(65);
    key.push(KeyPrefix::DisposedLock as u8);
    key.extend_from_slice(secret_hash);
    key.extend_from_slice(channel_id);
    key
}

/// Sent secret row by message echo hash.
pub fn sent_secret(echo_hash: &[u8; 32]) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(KeyPrefix::SentSecret as u8);
    key.extend_from_slice(echo_hash);
    key
}

/// Outbox row by message echo hash.
pub fn outbox(echo_hash: &[u8; 32]) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(KeyPrefix::Outbox as u8);
    key.extend_from_slice(echo_hash);
    key
}

fn prefixed_u64(prefix: KeyPrefix, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(prefix as u8);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Parse the id back out of a state change key.
pub fn parse_id(key: &[u8]) -> Option<u64> {
    if key.len() != 9 {
        return None;
    }
    Some(u64::from_be_bytes(key[1..9].try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_keys_sort_numerically() {
        assert!(state_change(2) < state_change(10));
        assert!(state_change(255) < state_change(256));
    }

    #[test]
    fn test_id_roundtrip() {
        assert_eq!(parse_id(&state_change(42)), Some(42));
        assert_eq!(parse_id(b"short"), None);
    }

    #[test]
    fn test_buckets_disjoint() {
        // A state change key can never collide with an event key.
        assert_ne!(state_change(1)[0], event(1, 0)[0]);
        assert_ne!(channel(&[0u8; 32])[0], token(&[0u8; 20])[0]);
    }

    #[test]
    fn test_event_keys_group_by_state_change() {
        assert!(event(1, 2) < event(2, 0));
        assert!(event(1, 0).starts_with(&event_prefix(1)));
        assert!(!event(2, 0).starts_with(&event_prefix(1)));
    }

    #[test]
    fn test_block_index_orders_by_block() {
        assert!(event_by_block(1, 99, 5) < event_by_block(2, 0, 0));
        assert_eq!(parse_event_block(&event_by_block(7, 1, 0)), Some(7));
    }
}
