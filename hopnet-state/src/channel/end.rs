//! Per-participant channel state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use hopnet_core::{
    Address, BalanceProof, BlockNumber, Lock, LocksRoot, Nonce, PendingLock, Secret, SecretHash,
    TokenAmount, UnclaimedLock,
};

use crate::error::{ChannelError, ChannelResult};
use crate::merkle::LockTree;

/// The state a channel tracks for one of its two participants.
///
/// Locks move through two stages: `pending` (announced, secret unknown)
/// and `unclaimed` (secret known, amount not yet folded into the
/// transferred balance). Both stages keep the lock's leaf in the merkle
/// tree; only an unlock or removal proof takes it out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEnd {
    /// The participant's address.
    pub address: Address,
    /// Total deposited into the escrow contract for this participant.
    pub contract_balance: TokenAmount,
    /// Total withdrawn on chain by this participant.
    pub withdrawn: TokenAmount,
    /// Latest balance proof signed by this participant, if any.
    pub balance_proof: Option<BalanceProof>,
    lock_tree: LockTree,
    pending_locks: BTreeMap<SecretHash, PendingLock>,
    unclaimed_locks: BTreeMap<SecretHash, UnclaimedLock>,
    registered_secrets: BTreeMap<SecretHash, BlockNumber>,
}

impl ChannelEnd {
    /// Create the state for a participant with an initial deposit.
    pub fn new(address: Address, contract_balance: TokenAmount) -> Self {
        ChannelEnd {
            address,
            contract_balance,
            withdrawn: TokenAmount::zero(),
            balance_proof: None,
            lock_tree: LockTree::new(),
            pending_locks: BTreeMap::new(),
            unclaimed_locks: BTreeMap::new(),
            registered_secrets: BTreeMap::new(),
        }
    }

    /// Cumulative amount this participant has transferred to the partner.
    pub fn transferred_amount(&self) -> TokenAmount {
        self.balance_proof
            .as_ref()
            .map(|bp| bp.transferred_amount)
            .unwrap_or_else(TokenAmount::zero)
    }

    /// Nonce of the latest balance proof, or 0 before the first transfer.
    pub fn nonce(&self) -> Nonce {
        self.balance_proof.as_ref().map(|bp| bp.nonce).unwrap_or(0)
    }

    /// Current root over all in-tree lock hashes.
    pub fn locks_root(&self) -> LocksRoot {
        self.lock_tree.root()
    }

    /// Total amount tied up in locks still in the tree.
    pub fn amount_locked(&self) -> TokenAmount {
        let pending = self
            .pending_locks
            .values()
            .fold(TokenAmount::zero(), |acc, p| acc + p.lock.amount);
        let unclaimed = self
            .unclaimed_locks
            .values()
            .fold(TokenAmount::zero(), |acc, u| acc + u.lock.amount);
        pending + unclaimed
    }

    /// Spendable balance: deposit minus withdrawals, plus what the
    /// partner transferred to us, minus what we transferred to them.
    pub fn balance(&self, other: &ChannelEnd) -> TokenAmount {
        self.contract_balance - self.withdrawn + other.transferred_amount()
            - self.transferred_amount()
    }

    /// Balance minus what is locked: the ceiling for a new transfer.
    pub fn distributable(&self, other: &ChannelEnd) -> TokenAmount {
        self.balance(other).saturating_sub(self.amount_locked())
    }

    /// Look up a lock (either stage) by its hashlock.
    pub fn lock(&self, secret_hash: &SecretHash) -> Option<&Lock> {
        self.pending_locks
            .get(secret_hash)
            .map(|p| &p.lock)
            .or_else(|| self.unclaimed_locks.get(secret_hash).map(|u| &u.lock))
    }

    /// Whether a lock with this hashlock is known in either stage.
    pub fn has_lock(&self, secret_hash: &SecretHash) -> bool {
        self.pending_locks.contains_key(secret_hash)
            || self.unclaimed_locks.contains_key(secret_hash)
    }

    /// The secret of an unclaimed lock, if revealed.
    pub fn secret_of(&self, secret_hash: &SecretHash) -> Option<Secret> {
        self.unclaimed_locks.get(secret_hash).map(|u| u.secret)
    }

    /// Iterate over the pending (secret-unknown) locks.
    pub fn pending_locks(&self) -> impl Iterator<Item = &PendingLock> {
        self.pending_locks.values()
    }

    /// Iterate over the unclaimed (secret-known) locks.
    pub fn unclaimed_locks(&self) -> impl Iterator<Item = &UnclaimedLock> {
        self.unclaimed_locks.values()
    }

    /// The root the tree would have after adding `lock`.
    pub fn locks_root_with(&self, lock: &Lock) -> LocksRoot {
        self.lock_tree.root_with(lock.lock_hash())
    }

    /// The root the tree would have after dropping the lock for
    /// `secret_hash`.
    pub fn locks_root_without(&self, secret_hash: &SecretHash) -> ChannelResult<LocksRoot> {
        let lock = self
            .lock(secret_hash)
            .ok_or(ChannelError::UnknownLock { secret_hash: *secret_hash })?;
        Ok(self.lock_tree.root_without(&lock.lock_hash()))
    }

    /// Membership proof for an in-tree lock, for on-chain `unlock`.
    pub fn lock_proof(&self, secret_hash: &SecretHash) -> Option<Vec<[u8; 32]>> {
        let lock = self.lock(secret_hash)?;
        self.lock_tree.proof(&lock.lock_hash())
    }

    /// Add a new pending lock to the tree.
    pub fn add_lock(&mut self, lock: Lock) -> ChannelResult<()> {
        let secret_hash = lock.secret_hash;
        if self.has_lock(&secret_hash) {
            return Err(ChannelError::DuplicateLock { secret_hash });
        }
        let pending = PendingLock::new(lock);
        self.lock_tree.insert(pending.lock_hash);
        self.pending_locks.insert(secret_hash, pending);
        Ok(())
    }

    /// Record a revealed secret: the matching pending lock becomes
    /// unclaimed. Returns false when no pending lock matches.
    pub fn register_secret(&mut self, secret: &Secret, secret_hash: &SecretHash) -> bool {
        match self.pending_locks.remove(secret_hash) {
            Some(pending) => {
                self.unclaimed_locks.insert(
                    *secret_hash,
                    UnclaimedLock { lock: pending.lock, secret: *secret },
                );
                true
            }
            None => false,
        }
    }

    /// Record that the on-chain secret registry published the preimage at
    /// `block`. Returns false when no lock matches.
    pub fn register_on_chain_secret(&mut self, secret_hash: &SecretHash, block: BlockNumber) -> bool {
        if !self.has_lock(secret_hash) {
            return false;
        }
        self.registered_secrets.insert(*secret_hash, block);
        true
    }

    /// Block at which the registry published the preimage, if it did.
    pub fn on_chain_registration(&self, secret_hash: &SecretHash) -> Option<BlockNumber> {
        self.registered_secrets.get(secret_hash).copied()
    }

    /// Drop a lock from whichever stage holds it and from the tree.
    pub fn remove_lock(&mut self, secret_hash: &SecretHash) -> ChannelResult<Lock> {
        let lock = self
            .pending_locks
            .remove(secret_hash)
            .map(|p| p.lock)
            .or_else(|| self.unclaimed_locks.remove(secret_hash).map(|u| u.lock))
            .ok_or(ChannelError::UnknownLock { secret_hash: *secret_hash })?;
        self.lock_tree.remove(&lock.lock_hash());
        self.registered_secrets.remove(secret_hash);
        Ok(lock)
    }
}
