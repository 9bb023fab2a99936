//! Token swaps: two interlocked mediated transfers sharing a hashlock.
//!
//! The maker starts an X-transfer with a secret only it knows; the
//! taker answers with a Y-transfer reusing the hashlock and a shorter
//! expiration. The maker reveals on the Y leg first (claiming Y), which
//! hands the taker the secret it needs to claim X. Either both legs
//! settle or neither does.
//!
//! The callback lists of older designs are replaced by an explicit
//! subscription table keyed by hashlock; entries leave the table when
//! both legs' machines finish.

use std::collections::HashMap;

use hopnet_core::{Address, Secret, SecretHash, TokenAddress, TokenAmount};

/// Which side of a swap this node plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapRole {
    /// Chooses the secret, sends first, reveals first.
    Maker,
    /// Locks against the maker's hashlock with a shorter expiration.
    Taker,
}

/// One swap as seen by one of its two parties.
#[derive(Clone, Debug)]
pub struct TokenSwap {
    /// Identifier agreed between the parties.
    pub payment_id: u64,
    /// The counter-party.
    pub partner: Address,
    /// Token this node sends.
    pub sending_token: TokenAddress,
    /// Amount this node sends.
    pub sending_amount: TokenAmount,
    /// Token this node receives.
    pub receiving_token: TokenAddress,
    /// Amount this node receives.
    pub receiving_amount: TokenAmount,
    /// This node's role.
    pub role: SwapRole,
}

/// A swap subscription bound to its hashlock.
#[derive(Clone, Debug)]
pub struct SwapSubscription {
    /// The swap.
    pub swap: TokenSwap,
    /// The swap secret; only the maker holds it.
    pub secret: Option<Secret>,
    /// Whether the counter-party's leg has arrived.
    pub counter_leg_seen: bool,
}

/// Subscription table for in-flight swaps.
///
/// Taker subscriptions start keyed by `(payment_id, partner)` because
/// the hashlock is the maker's choice and unknown until the maker's
/// transfer arrives; they move to the hashlock table at that point.
#[derive(Debug, Default)]
pub struct SwapTable {
    by_hashlock: HashMap<SecretHash, SwapSubscription>,
    expected: HashMap<(u64, Address), TokenSwap>,
}

impl SwapTable {
    /// Create an empty table.
    pub fn new() -> Self {
        SwapTable::default()
    }

    /// Register a maker swap under its chosen hashlock.
    pub fn register_maker(&mut self, swap: TokenSwap, secret: Secret, secret_hash: SecretHash) {
        self.by_hashlock.insert(
            secret_hash,
            SwapSubscription { swap, secret: Some(secret), counter_leg_seen: false },
        );
    }

    /// Register a taker swap awaiting the maker's transfer.
    pub fn register_taker(&mut self, swap: TokenSwap) {
        self.expected.insert((swap.payment_id, swap.partner), swap);
    }

    /// An incoming transfer matched a waiting taker subscription: bind
    /// it to the now-known hashlock.
    pub fn bind_taker(
        &mut self,
        payment_id: u64,
        partner: Address,
        secret_hash: SecretHash,
    ) -> Option<&SwapSubscription> {
        let swap = self.expected.remove(&(payment_id, partner))?;
        self.by_hashlock.insert(
            secret_hash,
            SwapSubscription { swap, secret: None, counter_leg_seen: true },
        );
        self.by_hashlock.get(&secret_hash)
    }

    /// The subscription for a hashlock, if any.
    pub fn get(&self, secret_hash: &SecretHash) -> Option<&SwapSubscription> {
        self.by_hashlock.get(secret_hash)
    }

    /// Mutable access to a subscription.
    pub fn get_mut(&mut self, secret_hash: &SecretHash) -> Option<&mut SwapSubscription> {
        self.by_hashlock.get_mut(secret_hash)
    }

    /// Whether a taker subscription is waiting for this transfer.
    pub fn expects(&self, payment_id: u64, partner: &Address) -> bool {
        self.expected.contains_key(&(payment_id, *partner))
    }

    /// Drop a finished subscription.
    pub fn remove(&mut self, secret_hash: &SecretHash) -> Option<SwapSubscription> {
        self.by_hashlock.remove(secret_hash)
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.by_hashlock.len() + self.expected.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.by_hashlock.is_empty() && self.expected.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopnet_core::keccak256;

    fn swap(role: SwapRole) -> TokenSwap {
        TokenSwap {
            payment_id: 77,
            partner: [2u8; 20],
            sending_token: [0xAA; 20],
            sending_amount: TokenAmount::from_u64(50),
            receiving_token: [0xBB; 20],
            receiving_amount: TokenAmount::from_u64(30),
            role,
        }
    }

    #[test]
    fn test_maker_registration() {
        let mut table = SwapTable::new();
        let secret = [9u8; 32];
        let hash = keccak256(&secret);
        table.register_maker(swap(SwapRole::Maker), secret, hash);

        let sub = table.get(&hash).unwrap();
        assert_eq!(sub.secret, Some(secret));
        assert!(!sub.counter_leg_seen);
    }

    #[test]
    fn test_taker_binds_on_arrival() {
        let mut table = SwapTable::new();
        table.register_taker(swap(SwapRole::Taker));
        assert!(table.expects(77, &[2u8; 20]));
        assert!(!table.expects(78, &[2u8; 20]));

        let hash = keccak256(&[9u8; 32]);
        let sub = table.bind_taker(77, [2u8; 20], hash).unwrap();
        assert!(sub.secret.is_none());
        assert!(sub.counter_leg_seen);

        // The expectation is consumed.
        assert!(!table.expects(77, &[2u8; 20]));
        assert!(table.get(&hash).is_some());
    }

    #[test]
    fn test_removal() {
        let mut table = SwapTable::new();
        let secret = [9u8; 32];
        let hash = keccak256(&secret);
        table.register_maker(swap(SwapRole::Maker), secret, hash);

        assert!(table.remove(&hash).is_some());
        assert!(table.is_empty());
    }
}
