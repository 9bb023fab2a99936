//! Chain interaction errors.

use thiserror::Error;

/// Errors from chain clients and event projection.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The transaction was mined but reverted.
    #[error("transaction reverted: {0}")]
    Reverted(String),

    /// The RPC endpoint is unreachable.
    #[error("rpc disconnected: {0}")]
    Disconnected(String),

    /// A raw log record could not be projected.
    #[error("unprojectable log record: {0}")]
    BadLogRecord(String),

    /// The requested channel is unknown to the contract.
    #[error("unknown channel")]
    UnknownChannel,

    /// The call is not valid in the channel's on-chain state.
    #[error("invalid call: {0}")]
    InvalidCall(String),
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;
