//! Error types for channel operations.
//!
//! Only the imperative channel API returns errors. The transfer state
//! machines never fail: invalid input produces an
//! [`crate::transfer::Event::InvalidReceived`] instead.

use hopnet_core::{BlockNumber, Nonce, SecretHash, TokenAmount};

use crate::channel::ChannelStatus;

/// Validation and execution errors for channel operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelError {
    /// Balance proof nonce is not the expected successor.
    InvalidNonce { expected: Nonce, got: Nonce },
    /// Balance proof signature does not verify against the sender.
    InvalidSignature,
    /// Balance proof locks root does not match the recomputed tree.
    InvalidLocksRoot { expected: [u8; 32], got: [u8; 32] },
    /// Transferred amount decreased or the implied transfer exceeds what
    /// the sender can spend.
    InsufficientBalance { available: TokenAmount, required: TokenAmount },
    /// Not enough distributable capacity for a new transfer.
    InsufficientDistributable { available: TokenAmount, required: TokenAmount },
    /// Operation requires the channel to be in a different lifecycle state.
    InvalidState { current: ChannelStatus },
    /// The channel no longer accepts transfers.
    ChannelClosed,
    /// A lock with this hashlock is already pending on the endpoint.
    DuplicateLock { secret_hash: SecretHash },
    /// No lock with this hashlock is known to the endpoint.
    UnknownLock { secret_hash: SecretHash },
    /// The lock expired and can no longer be claimed.
    LockExpired { expiration: BlockNumber, block: BlockNumber },
    /// The lock has not expired yet, so it cannot be removed.
    LockNotExpired { expiration: BlockNumber, block: BlockNumber },
    /// The secret does not hash to the lock's hashlock.
    InvalidSecret { secret_hash: SecretHash },
    /// The balance proof names a different channel.
    ChannelMismatch,
    /// The registry published the preimage before expiration, so the
    /// lock cannot be expired away.
    LockRegisteredOnChain { secret_hash: SecretHash },
    /// A lifecycle transition that the state machine does not allow.
    InvalidTransition { from: ChannelStatus, to: ChannelStatus },
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::InvalidNonce { expected, got } => {
                write!(f, "invalid nonce: expected {}, got {}", expected, got)
            }
            ChannelError::InvalidSignature => write!(f, "invalid balance proof signature"),
            ChannelError::InvalidLocksRoot { expected, got } => {
                write!(
                    f,
                    "locks root mismatch: expected {}, got {}",
                    hex_prefix(expected),
                    hex_prefix(got)
                )
            }
            ChannelError::InsufficientBalance { available, required } => {
                write!(f, "insufficient balance: available {}, required {}", available, required)
            }
            ChannelError::InsufficientDistributable { available, required } => {
                write!(
                    f,
                    "insufficient distributable: available {}, required {}",
                    available, required
                )
            }
            ChannelError::InvalidState { current } => {
                write!(f, "channel in state {:?} does not allow this operation", current)
            }
            ChannelError::ChannelClosed => write!(f, "channel is closed"),
            ChannelError::DuplicateLock { secret_hash } => {
                write!(f, "duplicate lock: {}", hex_prefix(secret_hash))
            }
            ChannelError::UnknownLock { secret_hash } => {
                write!(f, "unknown lock: {}", hex_prefix(secret_hash))
            }
            ChannelError::LockExpired { expiration, block } => {
                write!(f, "lock expired at block {} (now {})", expiration, block)
            }
            ChannelError::LockNotExpired { expiration, block } => {
                write!(f, "lock not expired until block {} (now {})", expiration, block)
            }
            ChannelError::InvalidSecret { secret_hash } => {
                write!(f, "secret does not match hashlock {}", hex_prefix(secret_hash))
            }
            ChannelError::ChannelMismatch => write!(f, "balance proof names a different channel"),
            ChannelError::LockRegisteredOnChain { secret_hash } => {
                write!(
                    f,
                    "lock {} was registered on chain and cannot be expired",
                    hex_prefix(secret_hash)
                )
            }
            ChannelError::InvalidTransition { from, to } => {
                write!(f, "illegal lifecycle transition {:?} -> {:?}", from, to)
            }
        }
    }
}

impl std::error::Error for ChannelError {}

fn hex_prefix(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(10);
    for b in bytes.iter().take(4) {
        s.push_str(&format!("{:02x}", b));
    }
    s.push_str("..");
    s
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use hopnet_core::TokenAmount;

    #[test]
    fn test_error_display() {
        let err = ChannelError::InvalidNonce { expected: 2, got: 5 };
        assert!(err.to_string().contains("expected 2"));

        let err = ChannelError::InsufficientDistributable {
            available: TokenAmount::from_u64(10),
            required: TokenAmount::from_u64(20),
        };
        assert!(err.to_string().contains("insufficient distributable"));
    }

    #[test]
    fn test_hex_prefix_is_short() {
        let err = ChannelError::UnknownLock { secret_hash: [0xAB; 32] };
        assert!(err.to_string().contains("abababab.."));
    }
}
