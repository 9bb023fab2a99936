//! In-memory chain double for scenario tests.
//!
//! One shared ledger, one `MockChain` handle per node (the handle's
//! account plays the transaction sender). Contract calls append log
//! records that tests and the node's poller drain and project.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use hopnet_core::{
    keccak256, Address, BalanceProof, BlockNumber, ChannelId, Lock, Secret, SecretHash, Signature,
    TokenAddress, TokenAmount,
};

use crate::error::{ChainError, ChainResult};
use crate::events::ContractLogRecord;
use crate::proxy::{EscrowContract, SecretRegistry};

#[derive(Debug)]
struct MockChannel {
    token: TokenAddress,
    participants: [Address; 2],
    deposits: [TokenAmount; 2],
    withdrawn: [TokenAmount; 2],
    settle_timeout: BlockNumber,
    closed_at: Option<BlockNumber>,
    settled: bool,
}

#[derive(Debug, Default)]
struct Ledger {
    block: BlockNumber,
    next_channel: u64,
    channels: HashMap<ChannelId, MockChannel>,
    secrets: HashMap<SecretHash, BlockNumber>,
    records: Vec<ContractLogRecord>,
}

/// A per-account handle onto a shared mock ledger.
#[derive(Clone)]
pub struct MockChain {
    account: Address,
    ledger: Arc<Mutex<Ledger>>,
}

impl MockChain {
    /// Create a fresh ledger with a first account handle.
    pub fn new(account: Address) -> Self {
        MockChain { account, ledger: Arc::new(Mutex::new(Ledger { block: 1, ..Ledger::default() })) }
    }

    /// Another account's handle onto the same ledger.
    pub fn for_account(&self, account: Address) -> Self {
        MockChain { account, ledger: Arc::clone(&self.ledger) }
    }

    /// Current block height.
    pub fn block(&self) -> BlockNumber {
        self.ledger.lock().unwrap().block
    }

    /// Mine `n` blocks.
    pub fn advance_blocks(&self, n: BlockNumber) -> BlockNumber {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.block += n;
        ledger.block
    }

    /// Drain every record logged since the last drain.
    pub fn drain_records(&self) -> Vec<ContractLogRecord> {
        std::mem::take(&mut self.ledger.lock().unwrap().records)
    }

    /// Registration block of a preimage, if published.
    pub fn secret_registered_at(&self, secret_hash: &SecretHash) -> Option<BlockNumber> {
        self.ledger.lock().unwrap().secrets.get(secret_hash).copied()
    }

    fn participant_index(channel: &MockChannel, account: &Address) -> ChainResult<usize> {
        channel
            .participants
            .iter()
            .position(|p| p == account)
            .ok_or_else(|| ChainError::InvalidCall("caller is not a participant".into()))
    }
}

#[async_trait]
impl EscrowContract for MockChain {
    async fn open_channel(
        &self,
        token: TokenAddress,
        partner: Address,
        settle_timeout: BlockNumber,
    ) -> ChainResult<ChannelId> {
        if partner == self.account {
            return Err(ChainError::InvalidCall("cannot open a channel with oneself".into()));
        }
        let mut ledger = self.ledger.lock().unwrap();
        ledger.next_channel += 1;
        let mut channel_id = [0u8; 32];
        channel_id[24..].copy_from_slice(&ledger.next_channel.to_be_bytes());

        let block_number = ledger.block;
        ledger.channels.insert(
            channel_id,
            MockChannel {
                token,
                participants: [self.account, partner],
                deposits: [TokenAmount::zero(), TokenAmount::zero()],
                withdrawn: [TokenAmount::zero(), TokenAmount::zero()],
                settle_timeout,
                closed_at: None,
                settled: false,
            },
        );
        ledger.records.push(ContractLogRecord::ChannelOpened {
            channel_id,
            token_address: token,
            participant1: self.account,
            participant2: partner,
            settle_timeout,
            block_number,
        });
        Ok(channel_id)
    }

    async fn deposit(&self, channel_id: ChannelId, amount: TokenAmount) -> ChainResult<()> {
        let mut ledger = self.ledger.lock().unwrap();
        let block_number = ledger.block;
        let channel = ledger
            .channels
            .get_mut(&channel_id)
            .ok_or(ChainError::UnknownChannel)?;
        let index = Self::participant_index(channel, &self.account)?;
        channel.deposits[index] = channel.deposits[index] + amount;
        let total_deposit = channel.deposits[index];

        ledger.records.push(ContractLogRecord::Deposit {
            channel_id,
            participant: self.account,
            total_deposit,
            block_number,
        });
        Ok(())
    }

    async fn close(&self, channel_id: ChannelId, _proof: Option<BalanceProof>) -> ChainResult<()> {
        let mut ledger = self.ledger.lock().unwrap();
        let block_number = ledger.block;
        let channel = ledger
            .channels
            .get_mut(&channel_id)
            .ok_or(ChainError::UnknownChannel)?;
        Self::participant_index(channel, &self.account)?;
        if channel.closed_at.is_some() {
            return Err(ChainError::InvalidCall("channel already closed".into()));
        }
        channel.closed_at = Some(block_number);

        ledger.records.push(ContractLogRecord::Closed {
            channel_id,
            closing_participant: self.account,
            block_number,
        });
        Ok(())
    }

    async fn update_non_closing_balance_proof(
        &self,
        channel_id: ChannelId,
        _proof: BalanceProof,
    ) -> ChainResult<()> {
        let ledger = self.ledger.lock().unwrap();
        let channel = ledger.channels.get(&channel_id).ok_or(ChainError::UnknownChannel)?;
        if channel.closed_at.is_none() {
            return Err(ChainError::InvalidCall("channel is not closed".into()));
        }
        Ok(())
    }

    async fn unlock(
        &self,
        channel_id: ChannelId,
        lock: Lock,
        _merkle_proof: Vec<[u8; 32]>,
        secret: Secret,
    ) -> ChainResult<()> {
        let ledger = self.ledger.lock().unwrap();
        let channel = ledger.channels.get(&channel_id).ok_or(ChainError::UnknownChannel)?;
        if channel.closed_at.is_none() {
            return Err(ChainError::InvalidCall("channel is not closed".into()));
        }
        if keccak256(&secret) != lock.secret_hash {
            return Err(ChainError::InvalidCall("secret does not open the lock".into()));
        }
        let registered = ledger.secrets.get(&lock.secret_hash).copied();
        match registered {
            Some(block) if block < lock.expiration => Ok(()),
            _ if ledger.block < lock.expiration => Ok(()),
            _ => Err(ChainError::InvalidCall("lock expired without registration".into())),
        }
    }

    async fn settle(&self, channel_id: ChannelId) -> ChainResult<()> {
        let mut ledger = self.ledger.lock().unwrap();
        let block_number = ledger.block;
        let channel = ledger
            .channels
            .get_mut(&channel_id)
            .ok_or(ChainError::UnknownChannel)?;
        let closed_at = channel
            .closed_at
            .ok_or_else(|| ChainError::InvalidCall("channel is not closed".into()))?;
        if block_number < closed_at + channel.settle_timeout {
            return Err(ChainError::InvalidCall("settle timeout still running".into()));
        }
        if channel.settled {
            return Err(ChainError::InvalidCall("channel already settled".into()));
        }
        channel.settled = true;

        ledger
            .records
            .push(ContractLogRecord::Settled { channel_id, block_number });
        Ok(())
    }

    async fn cooperative_settle(
        &self,
        channel_id: ChannelId,
        _participant1_balance: TokenAmount,
        _participant2_balance: TokenAmount,
        _signature1: Signature,
        _signature2: Signature,
    ) -> ChainResult<()> {
        let mut ledger = self.ledger.lock().unwrap();
        let block_number = ledger.block;
        let channel = ledger
            .channels
            .get_mut(&channel_id)
            .ok_or(ChainError::UnknownChannel)?;
        if channel.settled {
            return Err(ChainError::InvalidCall("channel already settled".into()));
        }
        channel.settled = true;

        ledger
            .records
            .push(ContractLogRecord::Settled { channel_id, block_number });
        Ok(())
    }

    async fn withdraw(
        &self,
        channel_id: ChannelId,
        participant: Address,
        total_withdraw: TokenAmount,
        _signature1: Signature,
        _signature2: Signature,
    ) -> ChainResult<()> {
        let mut ledger = self.ledger.lock().unwrap();
        let block_number = ledger.block;
        let channel = ledger
            .channels
            .get_mut(&channel_id)
            .ok_or(ChainError::UnknownChannel)?;
        let index = Self::participant_index(channel, &participant)?;
        if total_withdraw > channel.deposits[index] {
            return Err(ChainError::InvalidCall("withdraw exceeds deposit".into()));
        }
        channel.withdrawn[index] = total_withdraw;

        ledger.records.push(ContractLogRecord::Withdraw {
            channel_id,
            participant,
            total_withdrawn: total_withdraw,
            block_number,
        });
        Ok(())
    }
}

#[async_trait]
impl SecretRegistry for MockChain {
    async fn register_secret(&self, secret: Secret) -> ChainResult<()> {
        let mut ledger = self.ledger.lock().unwrap();
        let block_number = ledger.block;
        let secret_hash = keccak256(&secret);
        // First registration wins; repeats are harmless no-ops.
        if ledger.secrets.contains_key(&secret_hash) {
            return Ok(());
        }
        ledger.secrets.insert(secret_hash, block_number);
        ledger
            .records
            .push(ContractLogRecord::SecretRevealed { secret, block_number });
        Ok(())
    }

    async fn registration_block(&self, secret_hash: [u8; 32]) -> ChainResult<Option<BlockNumber>> {
        Ok(self.ledger.lock().unwrap().secrets.get(&secret_hash).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tag: u8) -> Address {
        [tag; 20]
    }

    #[tokio::test]
    async fn test_open_deposit_close_settle() {
        let chain_a = MockChain::new(addr(1));
        let chain_b = chain_a.for_account(addr(2));

        let channel_id = chain_a.open_channel([0xAA; 20], addr(2), 10).await.unwrap();
        chain_a.deposit(channel_id, TokenAmount::from_u64(100)).await.unwrap();
        chain_b.deposit(channel_id, TokenAmount::from_u64(100)).await.unwrap();

        chain_a.close(channel_id, None).await.unwrap();
        // Settle before the timeout is refused.
        assert!(chain_a.settle(channel_id).await.is_err());

        chain_a.advance_blocks(10);
        chain_a.settle(channel_id).await.unwrap();

        let records = chain_a.drain_records();
        assert_eq!(records.len(), 5);
        assert!(matches!(records[0], ContractLogRecord::ChannelOpened { .. }));
        assert!(matches!(records[4], ContractLogRecord::Settled { .. }));
    }

    #[tokio::test]
    async fn test_secret_registry_first_wins() {
        let chain = MockChain::new(addr(1));
        let secret = [9u8; 32];

        chain.register_secret(secret).await.unwrap();
        let first = chain.secret_registered_at(&keccak256(&secret)).unwrap();

        chain.advance_blocks(5);
        chain.register_secret(secret).await.unwrap();
        assert_eq!(chain.secret_registered_at(&keccak256(&secret)), Some(first));

        // Only one record emitted.
        let reveals = chain
            .drain_records()
            .into_iter()
            .filter(|r| matches!(r, ContractLogRecord::SecretRevealed { .. }))
            .count();
        assert_eq!(reveals, 1);
    }

    #[tokio::test]
    async fn test_unlock_requires_valid_secret() {
        let chain = MockChain::new(addr(1));
        let channel_id = chain.open_channel([0xAA; 20], addr(2), 10).await.unwrap();
        chain.close(channel_id, None).await.unwrap();

        let secret = [9u8; 32];
        let lock = Lock {
            amount: TokenAmount::from_u64(5),
            expiration: 100,
            secret_hash: keccak256(&secret),
        };
        chain.unlock(channel_id, lock.clone(), vec![], secret).await.unwrap();
        assert!(chain.unlock(channel_id, lock, vec![], [0u8; 32]).await.is_err());
    }

    #[tokio::test]
    async fn test_strangers_cannot_touch_channel() {
        let chain_a = MockChain::new(addr(1));
        let chain_c = chain_a.for_account(addr(3));

        let channel_id = chain_a.open_channel([0xAA; 20], addr(2), 10).await.unwrap();
        assert!(chain_c.deposit(channel_id, TokenAmount::from_u64(1)).await.is_err());
        assert!(chain_c.close(channel_id, None).await.is_err());
    }
}
