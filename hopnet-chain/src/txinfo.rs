//! Persistable records for submitted contract calls.
//!
//! After an RPC reconnect the node reconciles its pending transactions
//! against the chain by comparing account nonces; these records carry
//! everything that reconciliation needs.

use serde::{Deserialize, Serialize};

use hopnet_core::BlockNumber;

/// Status of a submitted contract call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    /// Submitted, not yet mined.
    Pending,
    /// Mined and succeeded.
    Success,
    /// Mined and reverted, or dropped from the pool.
    Failed,
}

/// One submitted contract call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCallRecord {
    /// Transaction hash as submitted.
    pub tx_hash: [u8; 32],
    /// Contract method name, for operator-facing logs.
    pub method: String,
    /// Account nonce the call was submitted with.
    pub account_nonce: u64,
    /// Call status.
    pub status: TxStatus,
    /// Block the transaction was packed into, once mined.
    pub packed_block: Option<BlockNumber>,
    /// Unix time the transaction was packed, once mined.
    pub packed_time: Option<u64>,
}

impl ContractCallRecord {
    /// Record a fresh submission.
    pub fn pending(tx_hash: [u8; 32], method: impl Into<String>, account_nonce: u64) -> Self {
        ContractCallRecord {
            tx_hash,
            method: method.into(),
            account_nonce,
            status: TxStatus::Pending,
            packed_block: None,
            packed_time: None,
        }
    }

    /// Mark the call mined.
    pub fn packed(&mut self, success: bool, block: BlockNumber, time: u64) {
        self.status = if success { TxStatus::Success } else { TxStatus::Failed };
        self.packed_block = Some(block);
        self.packed_time = Some(time);
    }

    /// Whether the call still awaits mining.
    pub fn is_pending(&self) -> bool {
        self.status == TxStatus::Pending
    }
}
