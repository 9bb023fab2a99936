use hopnet_core::{keccak256, KeyPair, TokenAmount};

use super::*;

/// Two views of the same channel: what node A sees and what node B sees.
struct ChannelPair {
    a_keys: KeyPair,
    b_keys: KeyPair,
    a_view: Channel,
    b_view: Channel,
}

fn pair(deposit_a: u64, deposit_b: u64) -> ChannelPair {
    let a_keys = KeyPair::generate();
    let b_keys = KeyPair::generate();
    let a_addr = hopnet_core::derive_address(&a_keys.public_key());
    let b_addr = hopnet_core::derive_address(&b_keys.public_key());
    let external = ExternalState::new([0xCC; 32], 1, 500, 30);

    let a_view = Channel::new(
        [0xAA; 20],
        a_addr,
        b_addr,
        TokenAmount::from_u64(deposit_a),
        TokenAmount::from_u64(deposit_b),
        external.clone(),
    );
    let b_view = Channel::new(
        [0xAA; 20],
        b_addr,
        a_addr,
        TokenAmount::from_u64(deposit_b),
        TokenAmount::from_u64(deposit_a),
        external,
    );
    ChannelPair { a_keys, b_keys, a_view, b_view }
}

#[test]
fn test_direct_transfer_roundtrip() {
    let mut p = pair(100, 100);

    let proof = p
        .a_view
        .create_direct_transfer(TokenAmount::from_u64(30), [0u8; 32], &p.a_keys)
        .unwrap();
    let delta = p
        .b_view
        .register_direct_transfer(proof, &p.a_keys.public_key())
        .unwrap();

    assert_eq!(delta, TokenAmount::from_u64(30));
    assert_eq!(p.a_view.distributable(), TokenAmount::from_u64(70));
    assert_eq!(p.b_view.distributable(), TokenAmount::from_u64(130));
}

#[test]
fn test_direct_transfer_exceeding_distributable() {
    let mut p = pair(100, 100);
    let err = p
        .a_view
        .create_direct_transfer(TokenAmount::from_u64(101), [0u8; 32], &p.a_keys)
        .unwrap_err();
    assert!(matches!(err, ChannelError::InsufficientDistributable { .. }));
}

#[test]
fn test_stale_nonce_rejected() {
    let mut p = pair(100, 100);

    let proof = p
        .a_view
        .create_direct_transfer(TokenAmount::from_u64(10), [0u8; 32], &p.a_keys)
        .unwrap();
    p.b_view
        .register_direct_transfer(proof.clone(), &p.a_keys.public_key())
        .unwrap();

    // Replaying the same proof must fail the nonce check.
    let err = p
        .b_view
        .register_direct_transfer(proof, &p.a_keys.public_key())
        .unwrap_err();
    assert!(matches!(err, ChannelError::InvalidNonce { expected: 2, got: 1 }));
}

#[test]
fn test_wrong_signer_rejected() {
    let mut p = pair(100, 100);
    let proof = p
        .a_view
        .create_direct_transfer(TokenAmount::from_u64(10), [0u8; 32], &p.a_keys)
        .unwrap();
    let err = p
        .b_view
        .register_direct_transfer(proof, &p.b_keys.public_key())
        .unwrap_err();
    assert!(matches!(err, ChannelError::InvalidSignature));
}

#[test]
fn test_locked_transfer_and_unlock_roundtrip() {
    let mut p = pair(100, 100);
    let secret = [9u8; 32];
    let secret_hash = keccak256(&secret);

    let (proof, lock) = p
        .a_view
        .create_locked_transfer(
            TokenAmount::from_u64(20),
            90,
            secret_hash,
            [0u8; 32],
            &p.a_keys,
        )
        .unwrap();
    p.b_view
        .register_locked_transfer(proof, lock, &p.a_keys.public_key(), 10)
        .unwrap();

    // Locked amounts count against A's distributable on both views.
    assert_eq!(p.a_view.distributable(), TokenAmount::from_u64(80));
    assert_eq!(p.b_view.partner_state.amount_locked(), TokenAmount::from_u64(20));

    // Reveal the secret on both sides, then A unlocks.
    assert!(p.a_view.register_secret(&secret).our_lock);
    assert!(p.b_view.register_secret(&secret).partner_lock);

    let (unlock_proof, unlock_lock, unlock_secret) = p
        .a_view
        .create_unlock(secret_hash, [0u8; 32], &p.a_keys)
        .unwrap();
    assert_eq!(unlock_secret, secret);
    assert_eq!(unlock_lock.amount, TokenAmount::from_u64(20));

    p.b_view
        .register_unlock(unlock_proof, secret, &p.a_keys.public_key())
        .unwrap();

    assert_eq!(p.a_view.distributable(), TokenAmount::from_u64(80));
    assert_eq!(p.b_view.distributable(), TokenAmount::from_u64(120));
    assert_eq!(p.b_view.partner_state.amount_locked(), TokenAmount::zero());
    assert_eq!(p.b_view.partner_state.locks_root(), hopnet_core::EMPTY_LOCKS_ROOT);
}

#[test]
fn test_locked_transfer_with_wrong_root_rejected() {
    let mut p = pair(100, 100);
    let secret_hash = keccak256(&[1u8]);

    let (mut proof, lock) = p
        .a_view
        .create_locked_transfer(
            TokenAmount::from_u64(20),
            90,
            secret_hash,
            [0u8; 32],
            &p.a_keys,
        )
        .unwrap();
    proof.locks_root = [0xEE; 32];
    // Re-sign so only the root check can fail.
    proof = BalanceProof::new_signed(
        proof.nonce,
        proof.transferred_amount,
        proof.locks_root,
        proof.channel_id,
        proof.additional_hash,
        &p.a_keys,
    );

    let err = p
        .b_view
        .register_locked_transfer(proof, lock, &p.a_keys.public_key(), 10)
        .unwrap_err();
    assert!(matches!(err, ChannelError::InvalidLocksRoot { .. }));
}

#[test]
fn test_expired_lock_rejected_on_receive() {
    let mut p = pair(100, 100);
    let (proof, lock) = p
        .a_view
        .create_locked_transfer(
            TokenAmount::from_u64(20),
            90,
            keccak256(&[1u8]),
            [0u8; 32],
            &p.a_keys,
        )
        .unwrap();
    let err = p
        .b_view
        .register_locked_transfer(proof, lock, &p.a_keys.public_key(), 90)
        .unwrap_err();
    assert!(matches!(err, ChannelError::LockExpired { .. }));
}

#[test]
fn test_lock_expiry_removal_roundtrip() {
    let mut p = pair(100, 100);
    let secret_hash = keccak256(&[1u8]);

    let (proof, lock) = p
        .a_view
        .create_locked_transfer(
            TokenAmount::from_u64(20),
            90,
            secret_hash,
            [0u8; 32],
            &p.a_keys,
        )
        .unwrap();
    p.b_view
        .register_locked_transfer(proof, lock, &p.a_keys.public_key(), 10)
        .unwrap();

    // Too early to expire.
    let err = p
        .a_view
        .create_lock_expired(secret_hash, 89, [0u8; 32], &p.a_keys)
        .unwrap_err();
    assert!(matches!(err, ChannelError::LockNotExpired { .. }));

    let (expire_proof, _) = p
        .a_view
        .create_lock_expired(secret_hash, 95, [0u8; 32], &p.a_keys)
        .unwrap();
    p.b_view
        .register_removed_lock(expire_proof, secret_hash, &p.a_keys.public_key(), 95, true)
        .unwrap();

    assert_eq!(p.a_view.distributable(), TokenAmount::from_u64(100));
    assert_eq!(p.b_view.partner_state.amount_locked(), TokenAmount::zero());
}

#[test]
fn test_on_chain_registration_blocks_expiry() {
    let mut p = pair(100, 100);
    let secret_hash = keccak256(&[1u8]);

    let (proof, lock) = p
        .a_view
        .create_locked_transfer(
            TokenAmount::from_u64(20),
            90,
            secret_hash,
            [0u8; 32],
            &p.a_keys,
        )
        .unwrap();
    p.b_view
        .register_locked_transfer(proof, lock, &p.a_keys.public_key(), 10)
        .unwrap();

    // Registry published the preimage before expiration.
    assert!(p.b_view.register_on_chain_secret(&secret_hash, 80).partner_lock);

    let (expire_proof, _) = p
        .a_view
        .create_lock_expired(secret_hash, 95, [0u8; 32], &p.a_keys)
        .unwrap();
    let err = p
        .b_view
        .register_removed_lock(expire_proof, secret_hash, &p.a_keys.public_key(), 95, true)
        .unwrap_err();
    assert!(matches!(err, ChannelError::LockRegisteredOnChain { .. }));
}

#[test]
fn test_disposed_response_removes_without_expiry() {
    let mut p = pair(100, 100);
    let secret_hash = keccak256(&[1u8]);

    let (proof, lock) = p
        .a_view
        .create_locked_transfer(
            TokenAmount::from_u64(20),
            90,
            secret_hash,
            [0u8; 32],
            &p.a_keys,
        )
        .unwrap();
    p.b_view
        .register_locked_transfer(proof, lock, &p.a_keys.public_key(), 10)
        .unwrap();

    // B announced disposal; A removes the lock well before expiry.
    let (response_proof, _) = p
        .a_view
        .create_disposed_response(secret_hash, [0u8; 32], &p.a_keys)
        .unwrap();
    p.b_view
        .register_removed_lock(response_proof, secret_hash, &p.a_keys.public_key(), 20, false)
        .unwrap();

    assert_eq!(p.a_view.distributable(), TokenAmount::from_u64(100));
    assert_eq!(p.b_view.partner_state.amount_locked(), TokenAmount::zero());
}

#[test]
fn test_lifecycle_freezes_new_locks() {
    let mut p = pair(100, 100);
    p.a_view.request_withdraw().unwrap();

    let err = p
        .a_view
        .create_locked_transfer(
            TokenAmount::from_u64(20),
            90,
            keccak256(&[1u8]),
            [0u8; 32],
            &p.a_keys,
        )
        .unwrap_err();
    assert!(matches!(err, ChannelError::InvalidState { .. }));

    // Cancel returns to Opened and transfers flow again.
    p.a_view.cancel_withdraw().unwrap();
    assert!(p.a_view.can_transfer());
}

#[test]
fn test_close_settle_lifecycle() {
    let mut p = pair(100, 100);
    p.a_view.handle_closed(200).unwrap();
    assert_eq!(p.a_view.status(), ChannelStatus::Closed);
    assert_eq!(p.a_view.external.settle_ready_block(), Some(700));

    let err = p
        .a_view
        .create_direct_transfer(TokenAmount::from_u64(1), [0u8; 32], &p.a_keys)
        .unwrap_err();
    assert!(matches!(err, ChannelError::ChannelClosed));

    p.a_view.handle_settled(701).unwrap();
    assert!(p.a_view.status().is_settled());
}

#[test]
fn test_conservation_invariant() {
    // deposit_A + deposit_B = balance_A + balance_B + locked amounts.
    let mut p = pair(100, 100);
    let secret = [9u8; 32];

    p.b_view
        .register_direct_transfer(
            p.a_view
                .create_direct_transfer(TokenAmount::from_u64(25), [0u8; 32], &p.a_keys)
                .unwrap(),
            &p.a_keys.public_key(),
        )
        .unwrap();
    let (proof, lock) = p
        .a_view
        .create_locked_transfer(
            TokenAmount::from_u64(15),
            90,
            keccak256(&secret),
            [0u8; 32],
            &p.a_keys,
        )
        .unwrap();
    p.b_view
        .register_locked_transfer(proof, lock, &p.a_keys.public_key(), 10)
        .unwrap();

    // Spendable balances plus everything tied up in locks add back up
    // to the deposits.
    let view = &p.b_view;
    let total = view.our_state.distributable(&view.partner_state)
        + view.partner_state.distributable(&view.our_state)
        + view.our_state.amount_locked()
        + view.partner_state.amount_locked();
    assert_eq!(total, TokenAmount::from_u64(200));
}

#[test]
fn test_deposit_update() {
    let mut p = pair(100, 100);
    let a_addr = p.a_view.our_address();
    p.a_view
        .handle_deposit(a_addr, TokenAmount::from_u64(150))
        .unwrap();
    assert_eq!(p.a_view.distributable(), TokenAmount::from_u64(150));
}
