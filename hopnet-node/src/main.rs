//! Hopnet node binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

use hopnet_chain::MockChain;
use hopnet_core::{Address, KeyPair};
use hopnet_node::cli::Cli;
use hopnet_node::config::NodeConfig;
use hopnet_node::node::NodeService;
use hopnet_node::shutdown::wait_for_shutdown_signal;
use hopnet_proto::{ProtoResult, Transport};
use hopnet_storage::{DirectoryLock, NodeStore, RocksBackend};

/// Transport used in devnet mode: there are no peers, sends vanish.
struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn send(&self, recipient: Address, _data: Vec<u8>) -> ProtoResult<()> {
        tracing::debug!(recipient = %hex::encode(recipient), "devnet transport dropped a message");
        Ok(())
    }
}

fn load_keypair(cli: &Cli) -> anyhow::Result<KeyPair> {
    match &cli.keyfile {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading keyfile {:?}", path))?;
            let bytes = hex::decode(contents.trim()).context("keyfile is not hex")?;
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("keyfile must hold exactly 32 bytes"))?;
            Ok(KeyPair::from_bytes(&bytes)?)
        }
        None => {
            tracing::warn!("no --keyfile given, using an ephemeral identity");
            Ok(KeyPair::generate())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let config = NodeConfig::from_cli(&cli);
    let keypair = load_keypair(&cli)?;

    if !cli.devnet {
        bail!(
            "no chain endpoint configured; run with --devnet for a local \
             mock-chain node, or wire an RPC client and transport"
        );
    }

    let _lock = DirectoryLock::acquire(&config.data_dir).context("locking data directory")?;
    let backend = Arc::new(
        RocksBackend::open(config.data_dir.join("db")).context("opening database")?,
    );
    let store = Arc::new(NodeStore::open(backend).context("opening node store")?);

    let our_address = hopnet_core::derive_address(&keypair.public_key());
    let chain = MockChain::new(our_address);
    let escrow = Arc::new(chain.clone());
    let registry = Arc::new(chain.clone());
    let transport = Arc::new(NullTransport);

    let (mut service, handles) = NodeService::new(
        config,
        keypair,
        store,
        escrow,
        registry,
        transport,
    );
    service.restore().context("restoring node state")?;

    tracing::info!(address = %hex::encode(our_address), "hopnet node starting (devnet)");

    // Devnet block production: tick the mock chain and feed its events
    // back into the loop.
    {
        let chain = chain.clone();
        let blocks_tx = handles.blocks_tx.clone();
        let chain_tx = handles.chain_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let block = chain.advance_blocks(1);
                if blocks_tx.send(block).await.is_err() {
                    break;
                }
                for record in chain.drain_records() {
                    if chain_tx.send(record).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    let quit_tx = handles.quit_tx.clone();
    let loop_handle = tokio::spawn(service.run());

    wait_for_shutdown_signal().await;
    let _ = quit_tx.send(()).await;

    match loop_handle.await {
        Ok(Ok(())) => {
            tracing::info!("node exited cleanly");
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "node loop failed");
            Err(e)
        }
        Err(e) => bail!("node loop panicked: {}", e),
    }
}
