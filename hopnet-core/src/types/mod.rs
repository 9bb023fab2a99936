//! Protocol data types.
//!
//! Addresses, secrets and hashes are plain byte arrays; the richer
//! structures (locks, balance proofs) live in their own modules.

mod balance_proof;
mod lock;

pub use balance_proof::BalanceProof;
pub use lock::{Lock, PendingLock, UnclaimedLock};

/// A 160-bit node or contract address.
pub type Address = [u8; 20];

/// Address of a token contract.
pub type TokenAddress = [u8; 20];

/// Identifier of a payment channel, assigned by the escrow contract.
pub type ChannelId = [u8; 32];

/// A 32-byte payment secret.
pub type Secret = [u8; 32];

/// Keccak-256 hash of a payment secret; the payment's identity across hops.
pub type SecretHash = [u8; 32];

/// Root of the merkle tree over a channel end's pending lock hashes.
pub type LocksRoot = [u8; 32];

/// Block height on the anchoring chain.
pub type BlockNumber = u64;

/// Balance-proof nonce, strictly increasing per channel end.
pub type Nonce = u64;

/// Locks root of an endpoint with no pending locks.
pub const EMPTY_LOCKS_ROOT: LocksRoot = [0u8; 32];
