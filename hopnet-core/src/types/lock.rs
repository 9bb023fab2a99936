//! Hash-time locks.
//!
//! A lock is a conditional transfer: `amount` becomes the partner's once
//! they present the secret hashing to `secret_hash`, unless block
//! `expiration` is reached first.

use serde::{Deserialize, Serialize};

use super::{BlockNumber, Secret, SecretHash};
use crate::crypto::keccak256;
use crate::u256::TokenAmount;

/// A hash-time-locked conditional transfer inside a channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Amount of tokens the lock is worth.
    pub amount: TokenAmount,
    /// Block number after which the lock can no longer be claimed.
    pub expiration: BlockNumber,
    /// Keccak-256 hash of the payment secret.
    pub secret_hash: SecretHash,
}

impl Lock {
    /// Canonical byte layout: amount (32, big-endian) ‖ expiration (8,
    /// big-endian) ‖ secret hash (32). The escrow contract hashes the
    /// same layout, so `lock_hash` doubles as the merkle leaf.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(72);
        bytes.extend_from_slice(&self.amount.to_be_bytes());
        bytes.extend_from_slice(&self.expiration.to_be_bytes());
        bytes.extend_from_slice(&self.secret_hash);
        bytes
    }

    /// Hash identifying this lock within a channel end.
    pub fn lock_hash(&self) -> [u8; 32] {
        keccak256(&self.as_bytes())
    }

    /// Whether the lock can still be claimed at `block`.
    #[inline]
    pub fn is_claimable(&self, block: BlockNumber) -> bool {
        block < self.expiration
    }
}

/// A lock whose secret is not yet known to this node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingLock {
    /// The lock itself.
    pub lock: Lock,
    /// Cached `lock.lock_hash()`, the merkle leaf.
    pub lock_hash: [u8; 32],
}

impl PendingLock {
    /// Wrap a lock, caching its hash.
    pub fn new(lock: Lock) -> Self {
        let lock_hash = lock.lock_hash();
        PendingLock { lock, lock_hash }
    }
}

/// A lock whose secret is known but whose amount has not yet been folded
/// into the transferred balance by an unlock message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnclaimedLock {
    /// The lock itself.
    pub lock: Lock,
    /// The revealed secret.
    pub secret: Secret,
}
