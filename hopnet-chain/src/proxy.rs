//! Contract client traits.
//!
//! Implemented by the external RPC layer against the deployed escrow
//! and secret-registry contracts. Submission is fire-and-confirm: a
//! method returns once the transaction is accepted by the node's nonce
//! manager; confirmation arrives later as a contract event.

use async_trait::async_trait;

use hopnet_core::{
    Address, BalanceProof, BlockNumber, ChannelId, Lock, Secret, Signature, TokenAddress,
    TokenAmount,
};

use crate::error::ChainResult;

/// Client for the bilateral escrow contract.
#[async_trait]
pub trait EscrowContract: Send + Sync {
    /// Open a channel with `partner` for `token`.
    async fn open_channel(
        &self,
        token: TokenAddress,
        partner: Address,
        settle_timeout: BlockNumber,
    ) -> ChainResult<ChannelId>;

    /// Deposit into an open channel.
    async fn deposit(&self, channel_id: ChannelId, amount: TokenAmount) -> ChainResult<()>;

    /// Close a channel with the partner's latest balance proof.
    async fn close(&self, channel_id: ChannelId, proof: Option<BalanceProof>) -> ChainResult<()>;

    /// Update the partner proof after the partner closed.
    async fn update_non_closing_balance_proof(
        &self,
        channel_id: ChannelId,
        proof: BalanceProof,
    ) -> ChainResult<()>;

    /// Prove a pending lock on chain with its merkle path and secret.
    async fn unlock(
        &self,
        channel_id: ChannelId,
        lock: Lock,
        merkle_proof: Vec<[u8; 32]>,
        secret: Secret,
    ) -> ChainResult<()>;

    /// Settle a closed channel after the settle timeout.
    async fn settle(&self, channel_id: ChannelId) -> ChainResult<()>;

    /// Settle cooperatively with both signatures.
    async fn cooperative_settle(
        &self,
        channel_id: ChannelId,
        participant1_balance: TokenAmount,
        participant2_balance: TokenAmount,
        signature1: Signature,
        signature2: Signature,
    ) -> ChainResult<()>;

    /// Withdraw with both signatures, leaving the channel open.
    async fn withdraw(
        &self,
        channel_id: ChannelId,
        participant: Address,
        total_withdraw: TokenAmount,
        signature1: Signature,
        signature2: Signature,
    ) -> ChainResult<()>;
}

/// Client for the secret registry contract.
#[async_trait]
pub trait SecretRegistry: Send + Sync {
    /// Publish a preimage; the contract records the block number.
    async fn register_secret(&self, secret: Secret) -> ChainResult<()>;

    /// Block at which a hash's preimage was registered, if it was.
    async fn registration_block(&self, secret_hash: [u8; 32]) -> ChainResult<Option<BlockNumber>>;
}
