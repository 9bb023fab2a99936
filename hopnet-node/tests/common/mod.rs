//! In-process test network: real node loops, an in-memory chain and an
//! address-routed loopback transport with per-link blocking.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;

use hopnet_chain::MockChain;
use hopnet_core::{derive_address, Address, KeyPair, TokenAmount};
use hopnet_node::config::NodeConfig;
use hopnet_node::node::{NodeHandles, NodeService};
use hopnet_node::NodeApi;
use hopnet_proto::{MessageCodec, ProtoError, ProtoResult, SignedMessage, Transport};
use hopnet_storage::{MemoryBackend, NodeStore};

#[derive(Default)]
struct RouterInner {
    routes: HashMap<Address, mpsc::Sender<SignedMessage>>,
    blocked_links: HashSet<(Address, Address)>,
}

/// Loopback transport delivering frames into peers' message channels.
#[derive(Clone, Default)]
pub struct TestRouter {
    inner: Arc<Mutex<RouterInner>>,
}

impl TestRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: Address, tx: mpsc::Sender<SignedMessage>) {
        self.inner.lock().unwrap().routes.insert(address, tx);
    }

    /// Drop every frame from `from` to `to` until unblocked.
    pub fn block_link(&self, from: Address, to: Address) {
        self.inner.lock().unwrap().blocked_links.insert((from, to));
    }

    pub fn unblock_link(&self, from: Address, to: Address) {
        self.inner.lock().unwrap().blocked_links.remove(&(from, to));
    }
}

/// One sender handle bound to its node's address, so the router can
/// enforce per-link blocks.
pub struct RoutedTransport {
    router: TestRouter,
    from: Address,
}

#[async_trait]
impl Transport for RoutedTransport {
    async fn send(&self, recipient: Address, data: Vec<u8>) -> ProtoResult<()> {
        let tx = {
            let inner = self.router.inner.lock().unwrap();
            if inner.blocked_links.contains(&(self.from, recipient)) {
                return Err(ProtoError::Transport("link blocked".into()));
            }
            inner
                .routes
                .get(&recipient)
                .cloned()
                .ok_or_else(|| ProtoError::Transport("unknown peer".into()))?
        };

        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&data[..]);
        let message = codec
            .decode(&mut buf)?
            .ok_or_else(|| ProtoError::Transport("short frame".into()))?;
        tx.send(message)
            .await
            .map_err(|_| ProtoError::Transport("peer loop gone".into()))
    }
}

pub struct TestNode {
    pub keypair: KeyPair,
    pub address: Address,
    pub handles: NodeHandles,
    pub api: NodeApi,
    pub store: Arc<NodeStore<MemoryBackend>>,
    pub backend: Arc<MemoryBackend>,
    pub join: JoinHandle<anyhow::Result<()>>,
}

pub struct TestNet {
    pub chain: MockChain,
    pub router: TestRouter,
    pub nodes: Vec<TestNode>,
}

pub fn test_config(mediation_fee: u64) -> NodeConfig {
    NodeConfig {
        settle_timeout: 100,
        reveal_timeout: 10,
        mediation_fee: TokenAmount::from_u64(mediation_fee),
        snapshot_interval: 10_000,
        // Ping on every block tick so offline peers are noticed fast.
        ping_interval: 0,
        ..NodeConfig::default()
    }
}

impl TestNet {
    /// Spin up `fees.len()` nodes; node `i` charges `fees[i]` for
    /// mediation.
    pub async fn start(fees: &[u64]) -> Self {
        Self::start_with_configs(fees.iter().map(|fee| test_config(*fee)).collect()).await
    }

    /// Spin up one node per configuration.
    pub async fn start_with_configs(configs: Vec<NodeConfig>) -> Self {
        let router = TestRouter::new();
        let mut nodes = Vec::new();
        let mut chain: Option<MockChain> = None;

        for config in configs {
            let keypair = KeyPair::generate();
            let address = derive_address(&keypair.public_key());
            let node_chain = match &chain {
                None => {
                    let fresh = MockChain::new(address);
                    chain = Some(fresh.clone());
                    fresh
                }
                Some(base) => base.for_account(address),
            };
            nodes.push(spawn_node(keypair, node_chain, router.clone(), config).await);
        }

        TestNet { chain: chain.unwrap(), router, nodes }
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    pub fn address(&self, index: usize) -> Address {
        self.nodes[index].address
    }

    /// Open and fund a channel between two nodes, waiting until both
    /// nodes have the funded channel row.
    pub async fn open_funded_channel(
        &mut self,
        token: [u8; 20],
        a: usize,
        b: usize,
        deposit_a: u64,
        deposit_b: u64,
    ) -> hopnet_core::ChannelId {
        let partner = self.address(b);
        let channel_id = self
            .nodes[a]
            .api
            .open_channel(token, partner, 100)
            .await
            .expect("open channel");
        self.nodes[a].api.deposit(channel_id, TokenAmount::from_u64(deposit_a)).await.unwrap();
        self.nodes[b].api.deposit(channel_id, TokenAmount::from_u64(deposit_b)).await.unwrap();
        self.pump_chain().await;

        let store_a = Arc::clone(&self.nodes[a].store);
        let store_b = Arc::clone(&self.nodes[b].store);
        let want_a = TokenAmount::from_u64(deposit_a);
        eventually(move || {
            let on_a = store_a
                .get_channel(&channel_id)
                .unwrap()
                .map(|c| c.our_state.contract_balance == want_a)
                .unwrap_or(false);
            let on_b = store_b.get_channel(&channel_id).unwrap().is_some();
            on_a && on_b
        })
        .await;
        channel_id
    }

    /// Fan the chain's pending log records out to every node.
    pub async fn pump_chain(&self) {
        for record in self.chain.drain_records() {
            for node in &self.nodes {
                node.handles.chain_tx.send(record.clone()).await.unwrap();
            }
        }
    }

    /// Mine blocks and tick every node.
    pub async fn advance_blocks(&self, n: u64) {
        for _ in 0..n {
            let block = self.chain.advance_blocks(1);
            for node in &self.nodes {
                node.handles.blocks_tx.send(block).await.unwrap();
            }
        }
        self.pump_chain().await;
    }

    /// Restart a node against its existing backend, simulating a crash
    /// (no clean shutdown) when `crash` is set.
    pub async fn restart_node(&mut self, index: usize, crash: bool) {
        let keypair = self.nodes[index].keypair.clone();
        let address = self.nodes[index].address;
        let backend = Arc::clone(&self.nodes[index].backend);

        if crash {
            self.nodes[index].join.abort();
        } else {
            let _ = self.nodes[index].handles.quit_tx.send(()).await;
            // Give the loop a moment to flush its shutdown path.
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.nodes[index].join.abort();
        }

        let chain = self.chain.for_account(address);
        let node = spawn_node_with_backend(
            keypair,
            chain,
            self.router.clone(),
            test_config(0),
            backend,
        )
        .await;
        self.nodes[index] = node;
    }
}

async fn spawn_node(
    keypair: KeyPair,
    chain: MockChain,
    router: TestRouter,
    config: NodeConfig,
) -> TestNode {
    spawn_node_with_backend(keypair, chain, router, config, Arc::new(MemoryBackend::new())).await
}

async fn spawn_node_with_backend(
    keypair: KeyPair,
    chain: MockChain,
    router: TestRouter,
    config: NodeConfig,
    backend: Arc<MemoryBackend>,
) -> TestNode {
    let address = derive_address(&keypair.public_key());
    let store = Arc::new(NodeStore::open(Arc::clone(&backend)).expect("open store"));

    let transport = Arc::new(RoutedTransport { router: router.clone(), from: address });
    let (mut service, handles) = NodeService::new(
        config,
        keypair.clone(),
        Arc::clone(&store),
        Arc::new(chain.clone()),
        Arc::new(chain),
        transport,
    );
    service.restore().expect("restore");

    router.register(address, handles.messages_tx.clone());
    let api = NodeApi::new(handles.requests_tx.clone());
    let join = tokio::spawn(service.run());

    TestNode { keypair, address, handles, api, store, backend, join }
}

/// Poll a condition until it holds or five seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within five seconds");
}

/// Channel balances as (our_transferred, partner_transferred).
pub fn transferred(
    store: &NodeStore<MemoryBackend>,
    channel_id: &hopnet_core::ChannelId,
) -> (u64, u64) {
    let channel = store.get_channel(channel_id).unwrap().expect("channel row");
    (
        channel.our_state.transferred_amount().to_u64().unwrap(),
        channel.partner_state.transferred_amount().to_u64().unwrap(),
    )
}
