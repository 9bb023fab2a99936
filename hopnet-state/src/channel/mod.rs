//! Bilateral payment channels.
//!
//! A [`Channel`] exclusively owns the state of both participants plus the
//! on-chain facade. Every mutation goes through a validating operation;
//! there is no way to commit a balance proof that skips validation.

mod end;
mod external;
mod lifecycle;

pub use end::ChannelEnd;
pub use external::ExternalState;
pub use lifecycle::ChannelStatus;

use serde::{Deserialize, Serialize};

use hopnet_core::{
    keccak256, Address, BalanceProof, BlockNumber, ChannelId, KeyPair, Lock, PublicKey, Secret,
    SecretHash, TokenAddress, TokenAmount,
};

use crate::error::{ChannelError, ChannelResult};

/// Where a revealed secret found matching locks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SecretRegistration {
    /// A lock we sent is now claimable by the partner.
    pub our_lock: bool,
    /// A lock the partner sent is now claimable by us.
    pub partner_lock: bool,
}

impl SecretRegistration {
    /// Whether any lock matched.
    pub fn matched(&self) -> bool {
        self.our_lock || self.partner_lock
    }
}

/// A bilateral payment channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// The token this channel carries.
    pub token_address: TokenAddress,
    /// Our side of the channel.
    pub our_state: ChannelEnd,
    /// The partner's side of the channel.
    pub partner_state: ChannelEnd,
    /// What the contract knows.
    pub external: ExternalState,
    status: ChannelStatus,
}

impl Channel {
    /// Create a channel in the `Opened` state.
    pub fn new(
        token_address: TokenAddress,
        our_address: Address,
        partner_address: Address,
        our_deposit: TokenAmount,
        partner_deposit: TokenAmount,
        external: ExternalState,
    ) -> Self {
        Channel {
            token_address,
            our_state: ChannelEnd::new(our_address, our_deposit),
            partner_state: ChannelEnd::new(partner_address, partner_deposit),
            external,
            status: ChannelStatus::Opened,
        }
    }

    /// The contract-assigned channel identifier.
    pub fn channel_id(&self) -> ChannelId {
        self.external.channel_id
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    /// Our address.
    pub fn our_address(&self) -> Address {
        self.our_state.address
    }

    /// The partner's address.
    pub fn partner_address(&self) -> Address {
        self.partner_state.address
    }

    /// Whether the channel currently admits new transfers and locks.
    pub fn can_transfer(&self) -> bool {
        self.status.accepts_transfers()
    }

    /// Ceiling for a new outgoing transfer.
    pub fn distributable(&self) -> TokenAmount {
        self.our_state.distributable(&self.partner_state)
    }

    /// Minimum blocks a hop needs between the secret and the deadline.
    pub fn reveal_timeout(&self) -> BlockNumber {
        self.external.reveal_timeout
    }

    /// Blocks after close before settlement is admissible.
    pub fn settle_timeout(&self) -> BlockNumber {
        self.external.settle_timeout
    }

    // === Lifecycle ===

    fn transition_to(&mut self, to: ChannelStatus) -> ChannelResult<()> {
        if !self.status.can_transition(to) {
            return Err(ChannelError::InvalidTransition { from: self.status, to });
        }
        self.status = to;
        Ok(())
    }

    /// Start a withdraw negotiation; freezes new locks.
    pub fn request_withdraw(&mut self) -> ChannelResult<()> {
        self.transition_to(ChannelStatus::Withdrawing)
    }

    /// Cancel a withdraw negotiation before the partner signs.
    pub fn cancel_withdraw(&mut self) -> ChannelResult<()> {
        self.transition_to(ChannelStatus::Opened)
    }

    /// Start a cooperative settle negotiation; freezes new locks.
    pub fn request_cooperative_settle(&mut self) -> ChannelResult<()> {
        self.transition_to(ChannelStatus::CooperativeSettling)
    }

    /// Cancel a cooperative settle negotiation before the partner signs.
    pub fn cancel_cooperative_settle(&mut self) -> ChannelResult<()> {
        self.transition_to(ChannelStatus::Opened)
    }

    /// A withdraw completed on chain: the participant's deposit and
    /// withdrawn totals change and the channel reopens for transfers.
    pub fn handle_withdraw(
        &mut self,
        participant: Address,
        total_withdrawn: TokenAmount,
    ) -> ChannelResult<()> {
        let end = self.end_mut(participant)?;
        end.withdrawn = total_withdrawn;
        if self.status == ChannelStatus::Withdrawing {
            self.transition_to(ChannelStatus::Opened)?;
        }
        Ok(())
    }

    /// `close` confirmed on chain.
    pub fn handle_closed(&mut self, block: BlockNumber) -> ChannelResult<()> {
        self.transition_to(ChannelStatus::Closed)?;
        self.external.closed_block = Some(block);
        Ok(())
    }

    /// `settle` (or a signed cooperative settle) confirmed on chain.
    pub fn handle_settled(&mut self, block: BlockNumber) -> ChannelResult<()> {
        self.transition_to(ChannelStatus::Settled)?;
        self.external.settled_block = Some(block);
        Ok(())
    }

    /// The settle window elapsed without a settle transaction.
    pub fn handle_settle_timeout(&mut self) -> ChannelResult<()> {
        self.transition_to(ChannelStatus::SettleTimedOut)
    }

    /// A deposit confirmed on chain; `total` is the new contract total.
    pub fn handle_deposit(&mut self, participant: Address, total: TokenAmount) -> ChannelResult<()> {
        let end = self.end_mut(participant)?;
        end.contract_balance = total;
        Ok(())
    }

    fn end_mut(&mut self, participant: Address) -> ChannelResult<&mut ChannelEnd> {
        if participant == self.our_state.address {
            Ok(&mut self.our_state)
        } else if participant == self.partner_state.address {
            Ok(&mut self.partner_state)
        } else {
            Err(ChannelError::ChannelMismatch)
        }
    }

    // === Receiving balance proofs from the partner ===

    fn require_open(&self) -> ChannelResult<()> {
        match self.status {
            ChannelStatus::Opened => Ok(()),
            ChannelStatus::Closed | ChannelStatus::Settled | ChannelStatus::SettleTimedOut => {
                Err(ChannelError::ChannelClosed)
            }
            current => Err(ChannelError::InvalidState { current }),
        }
    }

    fn require_not_closed(&self) -> ChannelResult<()> {
        match self.status {
            ChannelStatus::Closed | ChannelStatus::Settled | ChannelStatus::SettleTimedOut => {
                Err(ChannelError::ChannelClosed)
            }
            _ => Ok(()),
        }
    }

    fn validate_partner_proof(
        &self,
        proof: &BalanceProof,
        partner_key: &PublicKey,
    ) -> ChannelResult<()> {
        if proof.channel_id != self.external.channel_id {
            return Err(ChannelError::ChannelMismatch);
        }
        proof
            .verify_signature(partner_key)
            .map_err(|_| ChannelError::InvalidSignature)?;

        let expected = self.partner_state.nonce() + 1;
        if proof.nonce != expected {
            return Err(ChannelError::InvalidNonce { expected, got: proof.nonce });
        }
        if proof.transferred_amount < self.partner_state.transferred_amount() {
            return Err(ChannelError::InsufficientBalance {
                available: self.partner_state.transferred_amount(),
                required: proof.transferred_amount,
            });
        }
        Ok(())
    }

    /// Register a direct transfer from the partner: transferred amount
    /// grows, locks untouched.
    pub fn register_direct_transfer(
        &mut self,
        proof: BalanceProof,
        partner_key: &PublicKey,
    ) -> ChannelResult<TokenAmount> {
        self.require_open()?;
        self.validate_partner_proof(&proof, partner_key)?;

        let expected_root = self.partner_state.locks_root();
        if proof.locks_root != expected_root {
            return Err(ChannelError::InvalidLocksRoot {
                expected: expected_root,
                got: proof.locks_root,
            });
        }

        let delta = proof.transferred_amount - self.partner_state.transferred_amount();
        let available = self.partner_state.distributable(&self.our_state);
        if delta.is_zero() || delta > available {
            return Err(ChannelError::InsufficientBalance { available, required: delta });
        }

        self.partner_state.balance_proof = Some(proof);
        Ok(delta)
    }

    /// Register a locked (mediated) transfer from the partner: a new
    /// pending lock enters their tree, transferred amount unchanged.
    pub fn register_locked_transfer(
        &mut self,
        proof: BalanceProof,
        lock: Lock,
        partner_key: &PublicKey,
        block: BlockNumber,
    ) -> ChannelResult<()> {
        self.require_open()?;
        self.validate_partner_proof(&proof, partner_key)?;

        if !lock.is_claimable(block) {
            return Err(ChannelError::LockExpired { expiration: lock.expiration, block });
        }
        if self.partner_state.has_lock(&lock.secret_hash) {
            return Err(ChannelError::DuplicateLock { secret_hash: lock.secret_hash });
        }
        if proof.transferred_amount != self.partner_state.transferred_amount() {
            return Err(ChannelError::InsufficientBalance {
                available: self.partner_state.transferred_amount(),
                required: proof.transferred_amount,
            });
        }

        let expected_root = self.partner_state.locks_root_with(&lock);
        if proof.locks_root != expected_root {
            return Err(ChannelError::InvalidLocksRoot {
                expected: expected_root,
                got: proof.locks_root,
            });
        }

        let available = self.partner_state.distributable(&self.our_state);
        if lock.amount > available {
            return Err(ChannelError::InsufficientDistributable {
                available,
                required: lock.amount,
            });
        }

        self.partner_state.add_lock(lock)?;
        self.partner_state.balance_proof = Some(proof);
        Ok(())
    }

    /// Register an unlock from the partner: their lock leaves the tree
    /// and its amount folds into their transferred total.
    pub fn register_unlock(
        &mut self,
        proof: BalanceProof,
        secret: Secret,
        partner_key: &PublicKey,
    ) -> ChannelResult<Lock> {
        self.require_not_closed()?;
        self.validate_partner_proof(&proof, partner_key)?;

        let secret_hash = keccak256(&secret);
        let lock = self
            .partner_state
            .lock(&secret_hash)
            .cloned()
            .ok_or(ChannelError::UnknownLock { secret_hash })?;

        let expected_root = self.partner_state.locks_root_without(&secret_hash)?;
        if proof.locks_root != expected_root {
            return Err(ChannelError::InvalidLocksRoot {
                expected: expected_root,
                got: proof.locks_root,
            });
        }

        let expected_transferred = self.partner_state.transferred_amount() + lock.amount;
        if proof.transferred_amount != expected_transferred {
            return Err(ChannelError::InsufficientBalance {
                available: expected_transferred,
                required: proof.transferred_amount,
            });
        }

        self.partner_state.remove_lock(&secret_hash)?;
        self.partner_state.balance_proof = Some(proof);
        Ok(lock)
    }

    /// Register a lock removal from the partner, either an expired-lock
    /// cleanup (`require_expired`) or a response to our disposal
    /// announcement.
    pub fn register_removed_lock(
        &mut self,
        proof: BalanceProof,
        secret_hash: SecretHash,
        partner_key: &PublicKey,
        block: BlockNumber,
        require_expired: bool,
    ) -> ChannelResult<Lock> {
        self.require_not_closed()?;
        self.validate_partner_proof(&proof, partner_key)?;

        let lock = self
            .partner_state
            .lock(&secret_hash)
            .cloned()
            .ok_or(ChannelError::UnknownLock { secret_hash })?;

        if require_expired {
            if lock.is_claimable(block) {
                return Err(ChannelError::LockNotExpired { expiration: lock.expiration, block });
            }
            if let Some(registered) = self.partner_state.on_chain_registration(&secret_hash) {
                if registered < lock.expiration {
                    return Err(ChannelError::LockRegisteredOnChain { secret_hash });
                }
            }
        }

        let expected_root = self.partner_state.locks_root_without(&secret_hash)?;
        if proof.locks_root != expected_root {
            return Err(ChannelError::InvalidLocksRoot {
                expected: expected_root,
                got: proof.locks_root,
            });
        }
        if proof.transferred_amount != self.partner_state.transferred_amount() {
            return Err(ChannelError::InsufficientBalance {
                available: self.partner_state.transferred_amount(),
                required: proof.transferred_amount,
            });
        }

        self.partner_state.remove_lock(&secret_hash)?;
        self.partner_state.balance_proof = Some(proof);
        Ok(lock)
    }

    // === Producing balance proofs for the partner ===

    fn next_proof(
        &self,
        transferred_amount: TokenAmount,
        locks_root: [u8; 32],
        additional_hash: [u8; 32],
        keypair: &KeyPair,
    ) -> BalanceProof {
        BalanceProof::new_signed(
            self.our_state.nonce() + 1,
            transferred_amount,
            locks_root,
            self.external.channel_id,
            additional_hash,
            keypair,
        )
    }

    /// Build the balance proof for a direct transfer of `amount`.
    pub fn create_direct_transfer(
        &mut self,
        amount: TokenAmount,
        additional_hash: [u8; 32],
        keypair: &KeyPair,
    ) -> ChannelResult<BalanceProof> {
        self.require_open()?;
        let available = self.distributable();
        if amount.is_zero() || amount > available {
            return Err(ChannelError::InsufficientDistributable { available, required: amount });
        }

        let proof = self.next_proof(
            self.our_state.transferred_amount() + amount,
            self.our_state.locks_root(),
            additional_hash,
            keypair,
        );
        self.our_state.balance_proof = Some(proof.clone());
        Ok(proof)
    }

    /// Build the balance proof and lock for an outgoing locked transfer.
    pub fn create_locked_transfer(
        &mut self,
        amount: TokenAmount,
        expiration: BlockNumber,
        secret_hash: SecretHash,
        additional_hash: [u8; 32],
        keypair: &KeyPair,
    ) -> ChannelResult<(BalanceProof, Lock)> {
        self.require_open()?;
        let available = self.distributable();
        if amount.is_zero() || amount > available {
            return Err(ChannelError::InsufficientDistributable { available, required: amount });
        }
        if self.our_state.has_lock(&secret_hash) {
            return Err(ChannelError::DuplicateLock { secret_hash });
        }

        let lock = Lock { amount, expiration, secret_hash };
        let proof = self.next_proof(
            self.our_state.transferred_amount(),
            self.our_state.locks_root_with(&lock),
            additional_hash,
            keypair,
        );
        self.our_state.add_lock(lock.clone())?;
        self.our_state.balance_proof = Some(proof.clone());
        Ok((proof, lock))
    }

    /// Build the unlock proof for a lock whose secret we know: the lock
    /// leaves our tree and its amount folds into our transferred total.
    pub fn create_unlock(
        &mut self,
        secret_hash: SecretHash,
        additional_hash: [u8; 32],
        keypair: &KeyPair,
    ) -> ChannelResult<(BalanceProof, Lock, Secret)> {
        self.require_not_closed()?;
        let secret = self
            .our_state
            .secret_of(&secret_hash)
            .ok_or(ChannelError::UnknownLock { secret_hash })?;
        let lock = self
            .our_state
            .lock(&secret_hash)
            .cloned()
            .ok_or(ChannelError::UnknownLock { secret_hash })?;

        let proof = self.next_proof(
            self.our_state.transferred_amount() + lock.amount,
            self.our_state.locks_root_without(&secret_hash)?,
            additional_hash,
            keypair,
        );
        self.our_state.remove_lock(&secret_hash)?;
        self.our_state.balance_proof = Some(proof.clone());
        Ok((proof, lock, secret))
    }

    /// Build the proof removing an expired lock of ours from the tree.
    pub fn create_lock_expired(
        &mut self,
        secret_hash: SecretHash,
        block: BlockNumber,
        additional_hash: [u8; 32],
        keypair: &KeyPair,
    ) -> ChannelResult<(BalanceProof, Lock)> {
        self.require_not_closed()?;
        let lock = self
            .our_state
            .lock(&secret_hash)
            .cloned()
            .ok_or(ChannelError::UnknownLock { secret_hash })?;
        if lock.is_claimable(block) {
            return Err(ChannelError::LockNotExpired { expiration: lock.expiration, block });
        }

        let proof = self.next_proof(
            self.our_state.transferred_amount(),
            self.our_state.locks_root_without(&secret_hash)?,
            additional_hash,
            keypair,
        );
        self.our_state.remove_lock(&secret_hash)?;
        self.our_state.balance_proof = Some(proof.clone());
        Ok((proof, lock))
    }

    /// Build the proof removing a lock of ours that the partner announced
    /// disposed. No expiry requirement; the partner gave the lock up.
    pub fn create_disposed_response(
        &mut self,
        secret_hash: SecretHash,
        additional_hash: [u8; 32],
        keypair: &KeyPair,
    ) -> ChannelResult<(BalanceProof, Lock)> {
        self.require_not_closed()?;
        let lock = self
            .our_state
            .lock(&secret_hash)
            .cloned()
            .ok_or(ChannelError::UnknownLock { secret_hash })?;

        let proof = self.next_proof(
            self.our_state.transferred_amount(),
            self.our_state.locks_root_without(&secret_hash)?,
            additional_hash,
            keypair,
        );
        self.our_state.remove_lock(&secret_hash)?;
        self.our_state.balance_proof = Some(proof.clone());
        Ok((proof, lock))
    }

    // === Secrets ===

    /// Record a revealed secret on both ends that hold the matching lock.
    pub fn register_secret(&mut self, secret: &Secret) -> SecretRegistration {
        let secret_hash = keccak256(secret);
        SecretRegistration {
            our_lock: self.our_state.register_secret(secret, &secret_hash),
            partner_lock: self.partner_state.register_secret(secret, &secret_hash),
        }
    }

    /// Record that the on-chain registry published the preimage at
    /// `block`. The lock becomes settleable on chain even without an
    /// off-chain unlock.
    pub fn register_on_chain_secret(
        &mut self,
        secret_hash: &SecretHash,
        block: BlockNumber,
    ) -> SecretRegistration {
        SecretRegistration {
            our_lock: self.our_state.register_on_chain_secret(secret_hash, block),
            partner_lock: self.partner_state.register_on_chain_secret(secret_hash, block),
        }
    }
}

#[cfg(test)]
mod tests;
