//! End-to-end transfer scenarios over an in-process network.

mod common;

use common::*;

use hopnet_core::TokenAmount;
use hopnet_node::{SwapRole, TokenSwap};

const TOKEN: [u8; 20] = [0xAA; 20];
const TOKEN_Y: [u8; 20] = [0xBB; 20];

/// Direct transfer between channel partners: A sends 30 of a (100,100)
/// channel; distributable ends at 70 / 130.
#[tokio::test]
async fn direct_transfer() {
    let mut net = TestNet::start(&[0, 0]).await;
    let channel_id = net.open_funded_channel(TOKEN, 0, 1, 100, 100).await;

    let b = net.address(1);
    net.node(0)
        .api
        .direct_transfer(TOKEN, b, TokenAmount::from_u64(30))
        .await
        .expect("direct transfer");

    let store_a = net.node(0).store.clone();
    let store_b = net.node(1).store.clone();
    eventually(move || {
        transferred(&store_b, &channel_id) == (0, 30)
    })
    .await;

    assert_eq!(transferred(&store_a, &channel_id), (30, 0));
    let channel_a = store_a.get_channel(&channel_id).unwrap().unwrap();
    assert_eq!(channel_a.distributable(), TokenAmount::from_u64(70));
    let channel_b = net.node(1).store.get_channel(&channel_id).unwrap().unwrap();
    assert_eq!(channel_b.distributable(), TokenAmount::from_u64(130));
}

/// Three-hop mediated transfer A-B-C-D of 20 with a fee budget of 1
/// consumed by C. Locks clear from every tree and the final balances
/// land at 79/121, 79/121, 80/120.
#[tokio::test]
async fn three_hop_mediated_transfer() {
    let mut net = TestNet::start(&[0, 0, 1, 0]).await;
    let ab = net.open_funded_channel(TOKEN, 0, 1, 100, 100).await;
    let bc = net.open_funded_channel(TOKEN, 1, 2, 100, 100).await;
    let cd = net.open_funded_channel(TOKEN, 2, 3, 100, 100).await;

    let target = net.address(3);
    let outcome = net
        .node(0)
        .api
        .transfer(TOKEN, target, TokenAmount::from_u64(20), TokenAmount::from_u64(1))
        .await
        .expect("transfer");
    assert!(outcome.success, "payment failed: {:?}", outcome.reason);

    // Unlocks propagate after the success resolves; wait for the last
    // hop's balance to land.
    let store_d = net.node(3).store.clone();
    eventually(move || transferred(&store_d, &cd) == (0, 20)).await;

    assert_eq!(transferred(&net.node(0).store, &ab), (21, 0));
    assert_eq!(transferred(&net.node(1).store, &ab), (0, 21));
    assert_eq!(transferred(&net.node(1).store, &bc), (21, 0));
    assert_eq!(transferred(&net.node(2).store, &bc), (0, 21));
    assert_eq!(transferred(&net.node(2).store, &cd), (20, 0));

    // Every lock left every tree.
    for (node, channel) in [(0, ab), (1, ab), (1, bc), (2, bc), (2, cd), (3, cd)] {
        let row = net.node(node).store.get_channel(&channel).unwrap().unwrap();
        assert_eq!(row.our_state.amount_locked(), TokenAmount::zero());
        assert_eq!(row.partner_state.amount_locked(), TokenAmount::zero());
        assert_eq!(row.our_state.locks_root(), hopnet_core::EMPTY_LOCKS_ROOT);
    }
}

/// Refund: the short path's mediator cannot reach the target, refuses
/// the transfer, and the payment reroutes over the long path. The
/// refused lock is disposed and the first channel returns to its
/// original balances.
#[tokio::test]
async fn refund_reroutes_payment() {
    // Topology: A(0)-B(1)-C(2) short, A(0)-D(3)-E(4)-C(2) long.
    let mut net = TestNet::start(&[0, 0, 0, 0, 0]).await;
    let ab = net.open_funded_channel(TOKEN, 0, 1, 100, 100).await;
    let _bc = net.open_funded_channel(TOKEN, 1, 2, 100, 100).await;
    let _ad = net.open_funded_channel(TOKEN, 0, 3, 100, 100).await;
    let _de = net.open_funded_channel(TOKEN, 3, 4, 100, 100).await;
    let _ec = net.open_funded_channel(TOKEN, 4, 2, 100, 100).await;

    // Cut B off from C; after a few missed pings B considers C gone.
    let b = net.address(1);
    let c = net.address(2);
    net.router.block_link(b, c);
    net.router.block_link(c, b);
    net.advance_blocks(5).await;

    let outcome = net
        .node(0)
        .api
        .transfer(TOKEN, c, TokenAmount::from_u64(20), TokenAmount::zero())
        .await
        .expect("transfer");
    assert!(outcome.success, "payment failed: {:?}", outcome.reason);

    // The A-B channel is back where it started, nothing locked.
    let store_a = net.node(0).store.clone();
    eventually(move || {
        let row = store_a.get_channel(&ab).unwrap().unwrap();
        row.our_state.amount_locked() == TokenAmount::zero()
            && row.our_state.transferred_amount() == TokenAmount::zero()
    })
    .await;

    // B recorded its disposal promise for the refused lock.
    let store_b = net.node(1).store.clone();
    let row = store_b.get_channel(&ab).unwrap().unwrap();
    assert_eq!(row.partner_state.amount_locked(), TokenAmount::zero());

    // The payment went the long way.
    let store_c = net.node(2).store.clone();
    eventually(move || {
        store_c
            .channels()
            .unwrap()
            .iter()
            .any(|ch| ch.partner_state.transferred_amount() == TokenAmount::from_u64(20))
    })
    .await;
}

/// On-chain secret registration: the mediator knows the secret but the
/// payer's unlock never arrives. One reveal-timeout before the incoming
/// lock expires the mediator publishes the secret and closes the
/// incoming channel.
#[tokio::test]
async fn mediator_registers_secret_on_chain() {
    let mut net = TestNet::start(&[0, 0, 0]).await;
    let ab = net.open_funded_channel(TOKEN, 0, 1, 100, 100).await;
    let _bc = net.open_funded_channel(TOKEN, 1, 2, 100, 100).await;

    let c = net.address(2);
    let a = net.address(0);
    let b = net.address(1);

    // Sever B -> A up front: the locks still travel A -> B -> C and the
    // secret still flows C -> B, but B's reveal toward A is lost, so
    // A's unlock never comes and B is left holding a claimable lock.
    net.router.block_link(b, a);

    let api = net.node(0).api.clone();
    let transfer = tokio::spawn(async move {
        api.transfer(TOKEN, c, TokenAmount::from_u64(20), TokenAmount::zero()).await
    });

    // Let the locks and the secret propagate.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    // March toward the incoming lock's deadline. The lock expires
    // around open_block + settle_timeout (~100); the registration
    // margin is one reveal timeout (10) earlier. Chain records are
    // pumped between blocks so B's close and registration land.
    let mut closed_and_registered = false;
    for _ in 0..130 {
        net.advance_blocks(1).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let row = net.node(1).store.get_channel(&ab).unwrap().unwrap();
        let closed = row.external.closed_block.is_some();
        let registered = row
            .partner_state
            .unclaimed_locks()
            .any(|lock| net.chain.secret_registered_at(&lock.lock.secret_hash).is_some());
        if closed && registered {
            closed_and_registered = true;
            break;
        }
    }
    assert!(closed_and_registered, "mediator never claimed on chain");

    transfer.abort();
}

/// Token swap: maker A trades 50 X for taker B's 30 Y. One hashlock
/// binds both legs; both settle.
#[tokio::test]
async fn token_swap_settles_both_legs() {
    let mut net = TestNet::start(&[0, 0]).await;
    let x_channel = net.open_funded_channel(TOKEN, 0, 1, 100, 100).await;
    let y_channel = net.open_funded_channel(TOKEN_Y, 1, 0, 100, 100).await;

    let a = net.address(0);
    let b = net.address(1);

    let taker_api = net.node(1).api.clone();
    let taker = tokio::spawn(async move {
        taker_api
            .token_swap(TokenSwap {
                payment_id: 77,
                partner: a,
                sending_token: TOKEN_Y,
                sending_amount: TokenAmount::from_u64(30),
                receiving_token: TOKEN,
                receiving_amount: TokenAmount::from_u64(50),
                role: SwapRole::Taker,
            })
            .await
    });
    // The taker must be subscribed before the maker's transfer lands.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let maker_outcome = net
        .node(0)
        .api
        .token_swap(TokenSwap {
            payment_id: 77,
            partner: b,
            sending_token: TOKEN,
            sending_amount: TokenAmount::from_u64(50),
            receiving_token: TOKEN_Y,
            receiving_amount: TokenAmount::from_u64(30),
            role: SwapRole::Maker,
        })
        .await
        .expect("maker swap");
    assert!(maker_outcome.success);

    let taker_outcome = taker.await.unwrap().expect("taker swap");
    assert!(taker_outcome.success);

    // X moved from A to B, Y moved from B to A.
    let store_a = net.node(0).store.clone();
    let store_b = net.node(1).store.clone();
    eventually(move || {
        transferred(&store_a, &x_channel) == (50, 0)
            && transferred(&store_a, &y_channel) == (0, 30)
    })
    .await;
    assert_eq!(transferred(&store_b, &x_channel), (0, 50));
    assert_eq!(transferred(&store_b, &y_channel), (30, 0));
}
