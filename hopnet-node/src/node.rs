//! The event loop.
//!
//! All protocol state lives in one single-threaded task: the channel
//! graphs, the transfer state machines, the swap subscriptions and the
//! delivery queues. Messages, contract events, block ticks and user
//! requests enter through bounded channels; I/O (sends, contract
//! submissions) leaves as detached tasks that report back through the
//! same channels. The loop never blocks on anything but its select.
//!
//! Every state change follows the write-ahead protocol: persist the
//! change, run the pure transition, persist the emitted events, only
//! then perform side effects. A peer message is acknowledged only after
//! its state change hits the log, so redelivery after a crash is safe
//! on both sides.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use hopnet_chain::{ContractLogRecord, EscrowContract, EventProjector, SecretRegistry};
use hopnet_core::{
    keccak256, Address, BlockNumber, ChannelId, KeyPair, Secret, SecretHash, TokenAddress,
    TokenAmount,
};
use hopnet_proto::messages::{
    direct_transfer_binding, disposed_response_binding, mediated_transfer_binding,
    remove_expired_binding, unlock_binding, AnnounceDisposed, AnnounceDisposedResponse,
    CooperativeSettleRequest, CooperativeSettleResponse, DirectTransfer, MediatedTransfer, Ping,
    Pong, RemoveExpiredLock, RevealSecret, SecretRequest, Unlock, WithdrawRequest,
    WithdrawResponse,
};
use hopnet_proto::{
    EchoFilter, HealthMonitor, Message, MessageCodec, RetryQueue, SignedMessage, Transport,
};
use hopnet_state::transfer::{InitInitiator, InitMediator, InitTarget, TransferDescription};
use hopnet_state::{
    Channel, ChannelGraph, Event, ExternalState, StateChange, StateManager, TransferRole,
};
use hopnet_storage::{KvBackend, NodeStore, OutboxEntry, SentSecretStatus};

use crate::api::{ApiError, ApiRequest, PaymentOutcome};
use crate::config::NodeConfig;
use crate::swap::{SwapRole, SwapTable, TokenSwap};

/// Serialized with the snapshot: everything not reconstructible from
/// the channel rows.
#[derive(Debug, Serialize, Deserialize)]
struct GlobalState {
    block_number: BlockNumber,
    managers: BTreeMap<SecretHash, Vec<StateManager>>,
}

/// Senders feeding the event loop.
#[derive(Clone)]
pub struct NodeHandles {
    /// Decoded peer messages.
    pub messages_tx: mpsc::Sender<SignedMessage>,
    /// Decoded contract log records.
    pub chain_tx: mpsc::Sender<ContractLogRecord>,
    /// Monotonic block ticks.
    pub blocks_tx: mpsc::Sender<BlockNumber>,
    /// User requests.
    pub requests_tx: mpsc::Sender<ApiRequest>,
    /// RPC connectivity transitions.
    pub connection_tx: mpsc::Sender<bool>,
    /// Shutdown trigger.
    pub quit_tx: mpsc::Sender<()>,
}

struct NodeReceivers {
    messages_rx: mpsc::Receiver<SignedMessage>,
    chain_rx: mpsc::Receiver<ContractLogRecord>,
    blocks_rx: mpsc::Receiver<BlockNumber>,
    requests_rx: mpsc::Receiver<ApiRequest>,
    connection_rx: mpsc::Receiver<bool>,
    quit_rx: mpsc::Receiver<()>,
}

/// The node service: owns every mutable map and runs the loop.
pub struct NodeService<B: KvBackend + 'static> {
    config: NodeConfig,
    keypair: KeyPair,
    our_address: Address,

    store: Arc<NodeStore<B>>,
    escrow: Arc<dyn EscrowContract>,
    registry: Arc<dyn SecretRegistry>,
    transport: Arc<dyn Transport>,
    projector: EventProjector,

    graphs: HashMap<TokenAddress, ChannelGraph>,
    managers: BTreeMap<SecretHash, Vec<StateManager>>,
    swaps: SwapTable,
    pending_payments: HashMap<u64, oneshot::Sender<Result<PaymentOutcome, ApiError>>>,

    retry_queue: RetryQueue,
    echo_filter: EchoFilter,
    health: HealthMonitor,

    block_number: BlockNumber,
    changes_since_snapshot: u64,
    next_payment_id: u64,
    replaying: bool,
    rpc_connected: bool,
    condition_quit: Vec<String>,

    rx: NodeReceivers,
}

impl<B: KvBackend + 'static> NodeService<B> {
    /// Create a service plus the sender handles feeding it.
    pub fn new(
        config: NodeConfig,
        keypair: KeyPair,
        store: Arc<NodeStore<B>>,
        escrow: Arc<dyn EscrowContract>,
        registry: Arc<dyn SecretRegistry>,
        transport: Arc<dyn Transport>,
    ) -> (Self, NodeHandles) {
        let (messages_tx, messages_rx) = mpsc::channel(256);
        let (chain_tx, chain_rx) = mpsc::channel(256);
        let (blocks_tx, blocks_rx) = mpsc::channel(64);
        let (requests_tx, requests_rx) = mpsc::channel(64);
        let (connection_tx, connection_rx) = mpsc::channel(8);
        let (quit_tx, quit_rx) = mpsc::channel(1);

        let our_address = hopnet_core::derive_address(&keypair.public_key());
        let retry_queue = RetryQueue::new(config.retry);
        let health = HealthMonitor::new(config.ping_interval, hopnet_proto::health::DEFAULT_MAX_MISSES);

        let service = NodeService {
            config,
            keypair,
            our_address,
            store,
            escrow,
            registry,
            transport,
            projector: EventProjector,
            graphs: HashMap::new(),
            managers: BTreeMap::new(),
            swaps: SwapTable::new(),
            pending_payments: HashMap::new(),
            retry_queue,
            echo_filter: EchoFilter::default(),
            health,
            block_number: 0,
            changes_since_snapshot: 0,
            next_payment_id: 1,
            replaying: false,
            rpc_connected: true,
            condition_quit: Vec::new(),
            rx: NodeReceivers {
                messages_rx,
                chain_rx,
                blocks_rx,
                requests_rx,
                connection_rx,
                quit_rx,
            },
        };
        let handles = NodeHandles {
            messages_tx,
            chain_tx,
            blocks_tx,
            requests_tx,
            connection_tx,
            quit_tx,
        };
        (service, handles)
    }

    /// The node's address.
    pub fn our_address(&self) -> Address {
        self.our_address
    }

    /// Restore state from disk: channel rows, snapshot, log replay and
    /// the outbox. Must run before [`NodeService::run`].
    pub fn restore(&mut self) -> anyhow::Result<()> {
        if self.store.crashed_last_run() {
            tracing::warn!("previous run did not shut down cleanly, recovering from the log");
        }

        // Channels and graphs come from their own rows.
        for token in self.store.tokens().context("loading token registry")? {
            self.graphs
                .entry(token)
                .or_insert_with(|| ChannelGraph::new(token, self.our_address));
        }
        for channel in self.store.channels().context("loading channel rows")? {
            let partner = channel.partner_address();
            let settled = channel.status().is_settled();
            let graph = self
                .graphs
                .entry(channel.token_address)
                .or_insert_with(|| ChannelGraph::new(channel.token_address, self.our_address));
            graph.add_channel(channel);
            if !settled {
                self.health.watch(partner, now());
            }
        }

        // Managers come from the snapshot plus the log tail.
        let mut replay_from = 0;
        if let Some(snapshot) = self.store.load_snapshot().context("loading snapshot")? {
            let global: GlobalState = hopnet_core::serialization::deserialize(&snapshot.state)
                .context("decoding snapshot")?;
            self.managers = global.managers;
            self.block_number = global.block_number;
            replay_from = snapshot.state_change_id;
        }
        if let Some(latest) = self.store.latest_block()? {
            self.block_number = self.block_number.max(latest);
        }

        self.replaying = true;
        let tail = self.store.state_changes_after(replay_from)?;
        let replayed = tail.len();
        for record in tail {
            let events = self.apply(&record.payload);
            self.store
                .verify_replayed_events(record.id, &events)
                .context("replay diverged from the event log")?;
        }
        self.replaying = false;
        if replayed > 0 {
            tracing::info!(count = replayed, "replayed state changes from the log");
        }
        self.prune_finished();

        // Unacknowledged messages go back on the wire.
        for entry in self.store.outbox()? {
            self.retry_queue
                .enqueue(entry.recipient, entry.echo_hash, entry.data.clone(), now());
            self.spawn_send(entry.recipient, entry.data);
        }

        Ok(())
    }

    /// Run the loop until quit. Consumes the service.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(address = %hex::encode(self.our_address), "node loop running");
        let mut sweep_timer = tokio::time::interval(Duration::from_secs(1));
        sweep_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(message) = self.rx.messages_rx.recv() => {
                    if let Err(e) = self.handle_message(message) {
                        bail!("fatal error handling message: {:#}", e);
                    }
                }
                Some(record) = self.rx.chain_rx.recv() => {
                    if let Err(e) = self.handle_chain_record(record) {
                        bail!("fatal error handling chain record: {:#}", e);
                    }
                }
                Some(block) = self.rx.blocks_rx.recv() => {
                    if let Err(e) = self.handle_block(block) {
                        bail!("fatal error handling block: {:#}", e);
                    }
                }
                Some(request) = self.rx.requests_rx.recv() => {
                    if let Err(e) = self.handle_request(request) {
                        bail!("fatal error handling request: {:#}", e);
                    }
                }
                Some(connected) = self.rx.connection_rx.recv() => {
                    self.handle_connection(connected);
                }
                _ = sweep_timer.tick() => {
                    self.sweep_deliveries();
                }
                _ = self.rx.quit_rx.recv() => {
                    break;
                }
            }
        }

        self.shutdown()
    }

    fn shutdown(mut self) -> anyhow::Result<()> {
        tracing::info!("draining and shutting down");
        for (_, respond) in self.pending_payments.drain() {
            let _ = respond.send(Err(ApiError::ShuttingDown));
        }
        self.write_snapshot()?;
        self.store.close().context("closing store")?;
        tracing::info!("shutdown complete");
        Ok(())
    }

    // === Input: peer messages ===

    fn handle_message(&mut self, signed: SignedMessage) -> anyhow::Result<()> {
        if signed.verify_signature().is_err() {
            tracing::warn!("dropping message with a bad envelope signature");
            return Ok(());
        }
        let sender = signed.sender_address();
        if sender == self.our_address {
            tracing::warn!("dropping self-addressed message");
            return Ok(());
        }
        self.health.on_activity(&sender, now());

        match &signed.message {
            Message::Ack(ack) => {
                self.handle_send_complete(ack.echo_hash)?;
                return Ok(());
            }
            Message::Ping(ping) => {
                let pong = Message::Pong(Pong { nonce: ping.nonce });
                self.send_fire_and_forget(sender, pong)?;
                return Ok(());
            }
            Message::Pong(pong) => {
                self.health.on_pong(&sender, pong.nonce, now());
                return Ok(());
            }
            _ => {}
        }

        let echo_hash = signed.echo_hash(&self.our_address)?;
        if !self.echo_filter.record(echo_hash) {
            // Already processed: the peer lost our ack. Ack again, do
            // nothing else.
            self.send_ack(&signed)?;
            return Ok(());
        }

        match self.handle_protocol_message(&signed) {
            Ok(()) => {}
            Err(e) => {
                // Validation failures are logged and dropped; the state
                // change (if any) was not committed and the message is
                // still acked so the peer stops redelivering garbage.
                tracing::warn!(error = %e, "received message violates protocol, dropping");
                self.log_and_dispatch_invalid(format!("{}", e))?;
            }
        }
        self.send_ack(&signed)?;
        self.prune_finished();
        Ok(())
    }

    fn handle_protocol_message(&mut self, signed: &SignedMessage) -> anyhow::Result<()> {
        let sender = signed.sender_address();
        let block = self.block_number;

        match signed.message.clone() {
            Message::DirectTransfer(dt) => {
                if dt.balance_proof.additional_hash != dt.additional_hash() {
                    bail!("direct transfer proof is not bound to its message");
                }
                let channel = self
                    .find_channel_mut(&dt.balance_proof.channel_id)
                    .ok_or_else(|| anyhow::anyhow!("direct transfer on unknown channel"))?;
                channel
                    .register_direct_transfer(dt.balance_proof, &signed.sender)
                    .map_err(|e| anyhow::anyhow!("direct transfer rejected: {}", e))?;
                let row = channel.clone();
                self.store.put_channel(&row)?;
            }
            Message::MediatedTransfer(mt) => {
                self.handle_mediated_transfer(signed, mt, sender, block)?;
            }
            Message::SecretRequest(sr) => {
                self.log_and_dispatch(StateChange::SecretRequestReceived {
                    payment_id: sr.payment_id,
                    amount: sr.amount,
                    secret_hash: sr.secret_hash,
                    sender,
                })?;
            }
            Message::RevealSecret(rs) => {
                self.register_secret_everywhere(&rs.secret)?;
                self.log_and_dispatch(StateChange::SecretRevealReceived {
                    secret: rs.secret,
                    sender,
                })?;
            }
            Message::Unlock(u) => {
                if u.balance_proof.additional_hash != u.additional_hash() {
                    bail!("unlock proof is not bound to its message");
                }
                let secret_hash = keccak256(&u.secret);
                let channel_id = u.balance_proof.channel_id;
                let channel = self
                    .find_channel_mut(&channel_id)
                    .ok_or_else(|| anyhow::anyhow!("unlock on unknown channel"))?;
                channel
                    .register_unlock(u.balance_proof, u.secret, &signed.sender)
                    .map_err(|e| anyhow::anyhow!("unlock rejected: {}", e))?;
                let row = channel.clone();
                self.store.put_channel(&row)?;
                self.log_and_dispatch(StateChange::UnlockReceived {
                    secret_hash,
                    channel_id,
                    sender,
                })?;
            }
            Message::AnnounceDisposed(ad) => {
                // The payee refuses a lock we sent: the refund signal.
                let channel = self
                    .find_channel_mut(&ad.channel_id)
                    .ok_or_else(|| anyhow::anyhow!("announce-disposed on unknown channel"))?;
                if !channel.our_state.has_lock(&ad.lock.secret_hash) {
                    bail!("announce-disposed for a lock we do not hold");
                }
                self.log_and_dispatch(StateChange::RefundReceived {
                    secret_hash: ad.lock.secret_hash,
                    channel_id: ad.channel_id,
                    sender,
                })?;
            }
            Message::AnnounceDisposedResponse(adr) => {
                if adr.balance_proof.additional_hash != adr.additional_hash() {
                    bail!("disposed-response proof is not bound to its message");
                }
                let channel = self
                    .find_channel_mut(&adr.channel_id)
                    .ok_or_else(|| anyhow::anyhow!("disposed-response on unknown channel"))?;
                channel
                    .register_removed_lock(
                        adr.balance_proof,
                        adr.secret_hash,
                        &signed.sender,
                        block,
                        false,
                    )
                    .map_err(|e| anyhow::anyhow!("disposed-response rejected: {}", e))?;
                let row = channel.clone();
                self.store.put_channel(&row)?;
            }
            Message::RemoveExpiredLock(rel) => {
                if rel.balance_proof.additional_hash != rel.additional_hash() {
                    bail!("remove-expired-lock proof is not bound to its message");
                }
                let channel = self
                    .find_channel_mut(&rel.channel_id)
                    .ok_or_else(|| anyhow::anyhow!("remove-expired-lock on unknown channel"))?;
                channel
                    .register_removed_lock(
                        rel.balance_proof,
                        rel.secret_hash,
                        &signed.sender,
                        block,
                        true,
                    )
                    .map_err(|e| anyhow::anyhow!("remove-expired-lock rejected: {}", e))?;
                let row = channel.clone();
                self.store.put_channel(&row)?;
            }
            Message::WithdrawRequest(wr) => {
                self.handle_withdraw_request(wr, sender)?;
            }
            Message::WithdrawResponse(wresp) => {
                self.handle_withdraw_response(wresp)?;
            }
            Message::CooperativeSettleRequest(csr) => {
                self.handle_cooperative_settle_request(csr, sender)?;
            }
            Message::CooperativeSettleResponse(cresp) => {
                self.handle_cooperative_settle_response(cresp)?;
            }
            Message::Ack(_) | Message::Ping(_) | Message::Pong(_) => unreachable!("handled above"),
        }
        Ok(())
    }

    fn handle_mediated_transfer(
        &mut self,
        signed: &SignedMessage,
        mt: MediatedTransfer,
        sender: Address,
        block: BlockNumber,
    ) -> anyhow::Result<()> {
        if mt.balance_proof.additional_hash != mt.additional_hash() {
            bail!("mediated transfer proof is not bound to its message");
        }
        let channel_id = mt.balance_proof.channel_id;
        let channel = self
            .find_channel_mut(&channel_id)
            .ok_or_else(|| anyhow::anyhow!("mediated transfer on unknown channel"))?;
        if channel.partner_address() != sender {
            bail!("mediated transfer signed by a non-partner");
        }
        channel
            .register_locked_transfer(mt.balance_proof.clone(), mt.lock.clone(), &signed.sender, block)
            .map_err(|e| anyhow::anyhow!("mediated transfer rejected: {}", e))?;
        let reveal_timeout = channel.reveal_timeout();
        let row = channel.clone();
        self.store.put_channel(&row)?;

        let from_transfer = hopnet_state::transfer::LockedTransferState {
            payment_id: mt.payment_id,
            token_address: mt.token_address,
            amount: mt.lock.amount,
            fee: mt.fee,
            initiator: mt.initiator,
            target: mt.target,
            expiration: mt.lock.expiration,
            secret_hash: mt.lock.secret_hash,
            channel_id,
            sender,
            recipient: self.our_address,
        };

        if mt.target == self.our_address {
            // A waiting swap taker binds here and answers with its own
            // leg instead of a secret request.
            if self.swaps.expects(mt.payment_id, &mt.initiator) {
                self.swaps.bind_taker(mt.payment_id, mt.initiator, mt.lock.secret_hash);
                let counter = self
                    .swaps
                    .get(&mt.lock.secret_hash)
                    .map(|s| s.swap.clone());
                self.log_and_dispatch(StateChange::InitTarget(InitTarget {
                    from_transfer: from_transfer.clone(),
                    reveal_timeout,
                    block_number: block,
                }))?;
                if let Some(swap) = counter {
                    self.start_taker_leg(&swap, mt.lock.secret_hash, mt.lock.expiration)?;
                }
                return Ok(());
            }

            let maker_secret = self
                .swaps
                .get(&mt.lock.secret_hash)
                .and_then(|s| s.secret);
            self.log_and_dispatch(StateChange::InitTarget(InitTarget {
                from_transfer,
                reveal_timeout,
                block_number: block,
            }))?;
            if let Some(secret) = maker_secret {
                // Maker of a swap: the counter-leg arrived. Inject the
                // secret so the target machine reveals toward the taker;
                // a self-sent reveal only ever drives target machines.
                if let Some(sub) = self.swaps.get_mut(&mt.lock.secret_hash) {
                    sub.counter_leg_seen = true;
                }
                self.register_secret_everywhere(&secret)?;
                self.log_and_dispatch(StateChange::SecretRevealReceived {
                    secret,
                    sender: self.our_address,
                })?;
            }
        } else {
            // Mediate toward the target, never back through the payer
            // or the initiator.
            let mut excluded = std::collections::HashSet::new();
            excluded.insert(sender);
            excluded.insert(mt.initiator);
            let routes = self.routes_for(
                mt.token_address,
                mt.target,
                mt.lock.amount.saturating_sub(self.config.mediation_fee),
                &excluded,
            );
            self.log_and_dispatch(StateChange::InitMediator(InitMediator {
                from_transfer,
                payer_reveal_timeout: reveal_timeout,
                routes: hopnet_state::RoutesState::new(routes),
                our_fee: self.config.mediation_fee,
                block_number: block,
            }))?;
        }
        Ok(())
    }

    // === Input: contract events ===

    fn handle_chain_record(&mut self, record: ContractLogRecord) -> anyhow::Result<()> {
        let change = match self.projector.project(record) {
            Ok(change) => change,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unprojectable log record");
                return Ok(());
            }
        };

        match &change {
            StateChange::ContractChannelOpened {
                channel_id,
                token_address,
                participant1,
                participant2,
                settle_timeout,
                block_number,
            } => {
                let involves_us = *participant1 == self.our_address || *participant2 == self.our_address;
                let graph = self
                    .graphs
                    .entry(*token_address)
                    .or_insert_with(|| ChannelGraph::new(*token_address, self.our_address));
                if involves_us {
                    let partner = if *participant1 == self.our_address {
                        *participant2
                    } else {
                        *participant1
                    };
                    let channel = Channel::new(
                        *token_address,
                        self.our_address,
                        partner,
                        TokenAmount::zero(),
                        TokenAmount::zero(),
                        ExternalState::new(
                            *channel_id,
                            *block_number,
                            *settle_timeout,
                            self.config.reveal_timeout,
                        ),
                    );
                    graph.add_channel(channel.clone());
                    self.store.register_token(token_address)?;
                    self.store.put_channel(&channel)?;
                    self.health.watch(partner, now());
                    tracing::info!(
                        channel = %hex::encode(channel_id),
                        partner = %hex::encode(partner),
                        "channel opened"
                    );
                } else {
                    graph.add_edge(*participant1, *participant2);
                }
            }
            StateChange::ContractDeposit { channel_id, participant, total_deposit, .. } => {
                if let Some(channel) = self.find_channel_mut(channel_id) {
                    channel
                        .handle_deposit(*participant, *total_deposit)
                        .map_err(|e| anyhow::anyhow!("deposit event rejected: {}", e))?;
                    let row = channel.clone();
                    self.store.put_channel(&row)?;
                }
            }
            StateChange::ContractChannelClosed { channel_id, block_number, closing_participant } => {
                let closed_by_partner = *closing_participant != self.our_address;
                if let Some(channel) = self.find_channel_mut(channel_id) {
                    channel
                        .handle_closed(*block_number)
                        .map_err(|e| anyhow::anyhow!("close event rejected: {}", e))?;
                    let row = channel.clone();
                    self.store.put_channel(&row)?;

                    if closed_by_partner {
                        // Defend the channel: publish our view of the
                        // partner's proof.
                        if let Some(proof) = row.partner_state.balance_proof.clone() {
                            let escrow = Arc::clone(&self.escrow);
                            let id = *channel_id;
                            tokio::spawn(async move {
                                if let Err(e) =
                                    escrow.update_non_closing_balance_proof(id, proof).await
                                {
                                    tracing::error!(error = %e, "balance proof update failed");
                                }
                            });
                        }
                    }
                    // Whoever closed, claim every known-secret lock the
                    // partner still owes us before the window ends.
                    self.unlock_on_chain(&row)?;
                }
            }
            StateChange::ContractChannelSettled { channel_id, block_number } => {
                let mut settled_partner = None;
                if let Some(channel) = self.find_channel_mut(channel_id) {
                    channel
                        .handle_settled(*block_number)
                        .map_err(|e| anyhow::anyhow!("settle event rejected: {}", e))?;
                    settled_partner = Some(channel.partner_address());
                    let row = channel.clone();
                    self.store.put_channel(&row)?;
                }
                if let Some(partner) = settled_partner {
                    for graph in self.graphs.values_mut() {
                        graph.remove_edge(self.our_address, partner);
                    }
                    self.health.unwatch(&partner);
                }
            }
            StateChange::ContractWithdraw { channel_id, participant, total_withdrawn, .. } => {
                if let Some(channel) = self.find_channel_mut(channel_id) {
                    channel
                        .handle_withdraw(*participant, *total_withdrawn)
                        .map_err(|e| anyhow::anyhow!("withdraw event rejected: {}", e))?;
                    let row = channel.clone();
                    self.store.put_channel(&row)?;
                }
            }
            StateChange::RegistrySecretRevealed { secret, secret_hash, block_number } => {
                self.register_on_chain_secret_everywhere(secret, secret_hash, *block_number)?;
            }
            _ => {}
        }

        self.log_and_dispatch(change)?;
        Ok(())
    }

    // === Input: block ticks ===

    fn handle_block(&mut self, block: BlockNumber) -> anyhow::Result<()> {
        if block <= self.block_number {
            return Ok(());
        }
        self.block_number = block;
        self.store.set_latest_block(block)?;

        self.log_and_dispatch(StateChange::Block { number: block })?;
        self.prune_finished();
        self.maybe_snapshot()?;

        for (address, nonce) in self.health.due_pings(now()) {
            self.send_fire_and_forget(address, Message::Ping(Ping { nonce }))?;
        }
        Ok(())
    }

    // === Input: user requests ===

    fn handle_request(&mut self, request: ApiRequest) -> anyhow::Result<()> {
        match request {
            ApiRequest::Transfer { token, target, amount, fee, payment_id, respond } => {
                let payment_id = payment_id.unwrap_or_else(|| self.fresh_payment_id());
                // Registered before the dispatch so an init that fails
                // synchronously still resolves the caller.
                self.pending_payments.insert(payment_id, respond);
                let secret = fresh_secret();
                if let Err(e) =
                    self.start_payment(token, target, amount, fee, payment_id, Some(secret))
                {
                    if let Some(respond) = self.pending_payments.remove(&payment_id) {
                        let _ = respond.send(Err(e));
                    }
                }
            }
            ApiRequest::DirectTransfer { token, partner, amount, respond } => {
                let result = self.start_direct_transfer(token, partner, amount);
                let _ = respond.send(result);
            }
            ApiRequest::CancelPayment { payment_id } => {
                self.log_and_dispatch(StateChange::CancelPayment { payment_id })?;
            }
            ApiRequest::OpenChannel { token, partner, settle_timeout, respond } => {
                let escrow = Arc::clone(&self.escrow);
                tokio::spawn(async move {
                    let result = escrow
                        .open_channel(token, partner, settle_timeout)
                        .await
                        .map_err(|e| ApiError::Chain(e.to_string()));
                    let _ = respond.send(result);
                });
            }
            ApiRequest::Deposit { channel_id, amount, respond } => {
                let escrow = Arc::clone(&self.escrow);
                tokio::spawn(async move {
                    let result = escrow
                        .deposit(channel_id, amount)
                        .await
                        .map_err(|e| ApiError::Chain(e.to_string()));
                    let _ = respond.send(result);
                });
            }
            ApiRequest::CloseChannel { channel_id, respond } => {
                let proof = match self.find_channel_mut(&channel_id) {
                    Some(channel) => channel.partner_state.balance_proof.clone(),
                    None => {
                        let _ = respond.send(Err(ApiError::UnknownChannel));
                        return Ok(());
                    }
                };
                let escrow = Arc::clone(&self.escrow);
                tokio::spawn(async move {
                    let result = escrow
                        .close(channel_id, proof)
                        .await
                        .map_err(|e| ApiError::Chain(e.to_string()));
                    let _ = respond.send(result);
                });
            }
            ApiRequest::SettleChannel { channel_id, respond } => {
                let escrow = Arc::clone(&self.escrow);
                tokio::spawn(async move {
                    let result = escrow
                        .settle(channel_id)
                        .await
                        .map_err(|e| ApiError::Chain(e.to_string()));
                    let _ = respond.send(result);
                });
            }
            ApiRequest::Withdraw { channel_id, total_withdraw, respond } => {
                let result = self.start_withdraw(channel_id, total_withdraw);
                let _ = respond.send(result);
            }
            ApiRequest::CancelWithdraw { channel_id, respond } => {
                let result = self.cancel_withdraw(channel_id);
                let _ = respond.send(result);
            }
            ApiRequest::CooperativeSettle { channel_id, respond } => {
                let result = self.start_cooperative_settle(channel_id);
                let _ = respond.send(result);
            }
            ApiRequest::CancelCooperativeSettle { channel_id, respond } => {
                let result = self.cancel_cooperative_settle(channel_id);
                let _ = respond.send(result);
            }
            ApiRequest::TokenSwap { swap, respond } => {
                let payment_id = swap.payment_id;
                self.pending_payments.insert(payment_id, respond);
                if let Err(e) = self.start_swap(swap) {
                    if let Some(respond) = self.pending_payments.remove(&payment_id) {
                        let _ = respond.send(Err(e));
                    }
                }
            }
            ApiRequest::ConditionQuit { event_name } => {
                tracing::warn!(event = %event_name, "condition-quit armed");
                self.condition_quit.push(event_name);
            }
        }
        Ok(())
    }

    fn handle_connection(&mut self, connected: bool) {
        if connected && !self.rpc_connected {
            tracing::info!("chain rpc reconnected, reconciling pending transactions");
        } else if !connected && self.rpc_connected {
            tracing::warn!("chain rpc disconnected");
        }
        self.rpc_connected = connected;
    }

    // === Payments ===

    fn start_payment(
        &mut self,
        token: TokenAddress,
        target: Address,
        amount: TokenAmount,
        fee: TokenAmount,
        payment_id: u64,
        secret: Option<Secret>,
    ) -> Result<(), ApiError> {
        let secret = secret.ok_or_else(|| ApiError::Channel("missing payment secret".into()))?;
        let secret_hash = keccak256(&secret);
        self.start_payment_with_hashlock(
            token,
            target,
            amount,
            fee,
            payment_id,
            Some(secret),
            secret_hash,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn start_payment_with_hashlock(
        &mut self,
        token: TokenAddress,
        target: Address,
        amount: TokenAmount,
        fee: TokenAmount,
        payment_id: u64,
        secret: Option<Secret>,
        secret_hash: SecretHash,
        expiration_cap: Option<BlockNumber>,
    ) -> Result<(), ApiError> {
        let excluded = std::collections::HashSet::new();
        let mut routes = self.routes_for(token, target, amount + fee, &excluded);
        if routes.is_empty() {
            return Err(ApiError::NoRoute);
        }
        // A swap taker's lock must expire before the maker's.
        if let Some(cap) = expiration_cap {
            for route in &mut routes {
                let headroom = cap.saturating_sub(self.block_number + route.reveal_timeout);
                route.settle_timeout = route.settle_timeout.min(headroom);
            }
        }

        let init = InitInitiator {
            transfer: TransferDescription {
                payment_id,
                token_address: token,
                amount,
                fee,
                initiator: self.our_address,
                target,
                secret,
                secret_hash,
            },
            routes: hopnet_state::RoutesState::new(routes),
            block_number: self.block_number,
        };
        self.log_and_dispatch(StateChange::InitInitiator(init))
            .map_err(|e| ApiError::Channel(e.to_string()))?;
        Ok(())
    }

    fn start_direct_transfer(
        &mut self,
        token: TokenAddress,
        partner: Address,
        amount: TokenAmount,
    ) -> Result<u64, ApiError> {
        let payment_id = self.fresh_payment_id();
        let keypair = self.keypair.clone();
        let graph = self.graphs.get_mut(&token).ok_or(ApiError::UnknownChannel)?;
        let channel = graph.channel_with_mut(&partner).ok_or(ApiError::UnknownChannel)?;

        let additional_hash = direct_transfer_binding(payment_id, &token, &partner);
        let proof = channel
            .create_direct_transfer(amount, additional_hash, &keypair)
            .map_err(|e| ApiError::Channel(e.to_string()))?;
        let row = channel.clone();
        self.store
            .put_channel(&row)
            .map_err(|e| ApiError::Channel(e.to_string()))?;

        let message = Message::DirectTransfer(DirectTransfer {
            payment_id,
            token_address: token,
            recipient: partner,
            balance_proof: proof,
        });
        self.send_with_retry(partner, message)
            .map_err(|e| ApiError::Channel(e.to_string()))?;
        Ok(payment_id)
    }

    fn start_swap(&mut self, swap: TokenSwap) -> Result<u64, ApiError> {
        let payment_id = swap.payment_id;
        match swap.role {
            SwapRole::Maker => {
                let secret = fresh_secret();
                let secret_hash = keccak256(&secret);
                self.swaps.register_maker(swap.clone(), secret, secret_hash);
                self.start_payment_with_hashlock(
                    swap.sending_token,
                    swap.partner,
                    swap.sending_amount,
                    TokenAmount::zero(),
                    payment_id,
                    Some(secret),
                    secret_hash,
                    None,
                )?;
            }
            SwapRole::Taker => {
                // Wait for the maker's transfer; the leg starts when it
                // arrives and the hashlock is known.
                self.swaps.register_taker(swap);
            }
        }
        Ok(payment_id)
    }

    fn start_taker_leg(
        &mut self,
        swap: &TokenSwap,
        secret_hash: SecretHash,
        maker_expiration: BlockNumber,
    ) -> anyhow::Result<()> {
        self.start_payment_with_hashlock(
            swap.sending_token,
            swap.partner,
            swap.sending_amount,
            TokenAmount::zero(),
            swap.payment_id,
            None,
            secret_hash,
            Some(maker_expiration),
        )
        .map_err(|e| anyhow::anyhow!("taker leg failed to start: {}", e))
    }

    // === Withdraw and cooperative settle ===

    fn start_withdraw(
        &mut self,
        channel_id: ChannelId,
        total_withdraw: TokenAmount,
    ) -> Result<(), ApiError> {
        let our_address = self.our_address;
        let channel = self
            .find_channel_mut(&channel_id)
            .ok_or(ApiError::UnknownChannel)?;
        channel
            .request_withdraw()
            .map_err(|e| ApiError::Channel(e.to_string()))?;
        let partner = channel.partner_address();
        let row = channel.clone();
        self.store
            .put_channel(&row)
            .map_err(|e| ApiError::Channel(e.to_string()))?;

        let message = Message::WithdrawRequest(WithdrawRequest {
            channel_id,
            participant: our_address,
            total_withdraw,
        });
        self.send_with_retry(partner, message)
            .map_err(|e| ApiError::Channel(e.to_string()))?;
        Ok(())
    }

    fn cancel_withdraw(&mut self, channel_id: ChannelId) -> Result<(), ApiError> {
        let channel = self
            .find_channel_mut(&channel_id)
            .ok_or(ApiError::UnknownChannel)?;
        channel
            .cancel_withdraw()
            .map_err(|e| ApiError::Channel(e.to_string()))?;
        let partner = channel.partner_address();
        let row = channel.clone();
        self.store
            .put_channel(&row)
            .map_err(|e| ApiError::Channel(e.to_string()))?;

        // The refusal shape doubles as the cancellation notice.
        let message = Message::WithdrawResponse(WithdrawResponse {
            channel_id,
            participant: self.our_address,
            total_withdraw: TokenAmount::zero(),
            partner_signature: None,
        });
        self.send_with_retry(partner, message)
            .map_err(|e| ApiError::Channel(e.to_string()))?;
        Ok(())
    }

    fn handle_withdraw_request(
        &mut self,
        wr: WithdrawRequest,
        sender: Address,
    ) -> anyhow::Result<()> {
        let keypair = self.keypair.clone();
        let channel = self
            .find_channel_mut(&wr.channel_id)
            .ok_or_else(|| anyhow::anyhow!("withdraw request on unknown channel"))?;
        if channel.partner_address() != sender {
            bail!("withdraw request from a non-partner");
        }
        channel
            .request_withdraw()
            .map_err(|e| anyhow::anyhow!("withdraw request rejected: {}", e))?;
        let row = channel.clone();
        self.store.put_channel(&row)?;

        let signature = hopnet_core::sign(
            keypair.signing_key(),
            &withdraw_signing_data(&wr.channel_id, &wr.participant, &wr.total_withdraw),
        );
        let message = Message::WithdrawResponse(WithdrawResponse {
            channel_id: wr.channel_id,
            participant: wr.participant,
            total_withdraw: wr.total_withdraw,
            partner_signature: Some(signature),
        });
        self.send_with_retry(sender, message)?;
        Ok(())
    }

    fn handle_withdraw_response(&mut self, wresp: WithdrawResponse) -> anyhow::Result<()> {
        let our_address = self.our_address;
        let keypair = self.keypair.clone();
        let channel = self
            .find_channel_mut(&wresp.channel_id)
            .ok_or_else(|| anyhow::anyhow!("withdraw response on unknown channel"))?;

        match wresp.partner_signature {
            None => {
                // Refusal or cancellation: back to open.
                channel
                    .cancel_withdraw()
                    .map_err(|e| anyhow::anyhow!("withdraw cancel rejected: {}", e))?;
                let row = channel.clone();
                self.store.put_channel(&row)?;
            }
            Some(partner_signature) => {
                let our_signature = hopnet_core::sign(
                    keypair.signing_key(),
                    &withdraw_signing_data(
                        &wresp.channel_id,
                        &wresp.participant,
                        &wresp.total_withdraw,
                    ),
                );
                let escrow = Arc::clone(&self.escrow);
                let channel_id = wresp.channel_id;
                let total = wresp.total_withdraw;
                tokio::spawn(async move {
                    if let Err(e) = escrow
                        .withdraw(channel_id, our_address, total, our_signature, partner_signature)
                        .await
                    {
                        tracing::error!(error = %e, "withdraw submission failed");
                    }
                });
            }
        }
        Ok(())
    }

    fn start_cooperative_settle(&mut self, channel_id: ChannelId) -> Result<(), ApiError> {
        let channel = self
            .find_channel_mut(&channel_id)
            .ok_or(ApiError::UnknownChannel)?;
        channel
            .request_cooperative_settle()
            .map_err(|e| ApiError::Channel(e.to_string()))?;
        let partner = channel.partner_address();
        let our_balance = channel.our_state.balance(&channel.partner_state);
        let partner_balance = channel.partner_state.balance(&channel.our_state);
        let row = channel.clone();
        self.store
            .put_channel(&row)
            .map_err(|e| ApiError::Channel(e.to_string()))?;

        let message = Message::CooperativeSettleRequest(CooperativeSettleRequest {
            channel_id,
            participant1_balance: our_balance,
            participant2_balance: partner_balance,
        });
        self.send_with_retry(partner, message)
            .map_err(|e| ApiError::Channel(e.to_string()))?;
        Ok(())
    }

    fn cancel_cooperative_settle(&mut self, channel_id: ChannelId) -> Result<(), ApiError> {
        let channel = self
            .find_channel_mut(&channel_id)
            .ok_or(ApiError::UnknownChannel)?;
        channel
            .cancel_cooperative_settle()
            .map_err(|e| ApiError::Channel(e.to_string()))?;
        let partner = channel.partner_address();
        let row = channel.clone();
        self.store
            .put_channel(&row)
            .map_err(|e| ApiError::Channel(e.to_string()))?;

        let message = Message::CooperativeSettleResponse(CooperativeSettleResponse {
            channel_id,
            participant1_balance: TokenAmount::zero(),
            participant2_balance: TokenAmount::zero(),
            partner_signature: None,
        });
        self.send_with_retry(partner, message)
            .map_err(|e| ApiError::Channel(e.to_string()))?;
        Ok(())
    }

    fn handle_cooperative_settle_request(
        &mut self,
        csr: CooperativeSettleRequest,
        sender: Address,
    ) -> anyhow::Result<()> {
        let keypair = self.keypair.clone();
        let channel = self
            .find_channel_mut(&csr.channel_id)
            .ok_or_else(|| anyhow::anyhow!("cooperative settle on unknown channel"))?;
        if channel.partner_address() != sender {
            bail!("cooperative settle request from a non-partner");
        }
        // Locked amounts block a cooperative close.
        if channel.our_state.amount_locked() > TokenAmount::zero()
            || channel.partner_state.amount_locked() > TokenAmount::zero()
        {
            bail!("cooperative settle with pending locks");
        }
        // The requester's view must match ours, with the participant
        // order flipped.
        let our_balance = channel.our_state.balance(&channel.partner_state);
        let partner_balance = channel.partner_state.balance(&channel.our_state);
        if csr.participant1_balance != partner_balance || csr.participant2_balance != our_balance {
            bail!("cooperative settle balances disagree");
        }
        channel
            .request_cooperative_settle()
            .map_err(|e| anyhow::anyhow!("cooperative settle rejected: {}", e))?;
        let row = channel.clone();
        self.store.put_channel(&row)?;

        let signature = hopnet_core::sign(
            keypair.signing_key(),
            &settle_signing_data(&csr.channel_id, &csr.participant1_balance, &csr.participant2_balance),
        );
        let message = Message::CooperativeSettleResponse(CooperativeSettleResponse {
            channel_id: csr.channel_id,
            participant1_balance: csr.participant1_balance,
            participant2_balance: csr.participant2_balance,
            partner_signature: Some(signature),
        });
        self.send_with_retry(sender, message)?;
        Ok(())
    }

    fn handle_cooperative_settle_response(
        &mut self,
        cresp: CooperativeSettleResponse,
    ) -> anyhow::Result<()> {
        let keypair = self.keypair.clone();
        let channel = self
            .find_channel_mut(&cresp.channel_id)
            .ok_or_else(|| anyhow::anyhow!("cooperative settle response on unknown channel"))?;

        match cresp.partner_signature {
            None => {
                channel
                    .cancel_cooperative_settle()
                    .map_err(|e| anyhow::anyhow!("cooperative settle cancel rejected: {}", e))?;
                let row = channel.clone();
                self.store.put_channel(&row)?;
            }
            Some(partner_signature) => {
                let our_signature = hopnet_core::sign(
                    keypair.signing_key(),
                    &settle_signing_data(
                        &cresp.channel_id,
                        &cresp.participant1_balance,
                        &cresp.participant2_balance,
                    ),
                );
                let escrow = Arc::clone(&self.escrow);
                tokio::spawn(async move {
                    if let Err(e) = escrow
                        .cooperative_settle(
                            cresp.channel_id,
                            cresp.participant1_balance,
                            cresp.participant2_balance,
                            our_signature,
                            partner_signature,
                        )
                        .await
                    {
                        tracing::error!(error = %e, "cooperative settle submission failed");
                    }
                });
            }
        }
        Ok(())
    }

    // === The write-ahead dispatch ===

    fn log_and_dispatch(&mut self, change: StateChange) -> anyhow::Result<Vec<Event>> {
        let id = self
            .store
            .log_state_change(&change)
            .context("write-ahead log append failed")?;
        let events = self.apply(&change);
        self.store
            .log_events(id, self.block_number, &events)
            .context("event log append failed")?;
        self.changes_since_snapshot += 1;

        if !self.replaying {
            for event in events.clone() {
                self.act(event)?;
            }
        }
        Ok(events)
    }

    fn log_and_dispatch_invalid(&mut self, reason: String) -> anyhow::Result<()> {
        // Dropped messages leave a trace for operator review; the
        // channel is deliberately NOT closed.
        self.log_and_dispatch(StateChange::InvalidMessageReceived { reason })?;
        Ok(())
    }

    /// Run the pure transitions for one state change. Creates machines
    /// for Init variants; routes by hashlock where one exists, to every
    /// machine for block ticks.
    fn apply(&mut self, change: &StateChange) -> Vec<Event> {
        match change {
            StateChange::InitInitiator(init) => {
                let hash = init.transfer.secret_hash;
                let token = init.transfer.token_address;
                self.ensure_manager(hash, token, TransferRole::Initiator);
                self.dispatch_to_hashlock(&hash, change)
            }
            StateChange::InitMediator(init) => {
                let hash = init.from_transfer.secret_hash;
                let token = init.from_transfer.token_address;
                self.ensure_manager(hash, token, TransferRole::Mediator);
                self.dispatch_to_hashlock(&hash, change)
            }
            StateChange::InitTarget(init) => {
                let hash = init.from_transfer.secret_hash;
                let token = init.from_transfer.token_address;
                self.ensure_manager(hash, token, TransferRole::Target);
                self.dispatch_to_hashlock(&hash, change)
            }
            StateChange::Block { .. } => {
                let mut events = Vec::new();
                let hashes: Vec<SecretHash> = self.managers.keys().copied().collect();
                for hash in hashes {
                    events.extend(self.dispatch_to_hashlock(&hash, change));
                }
                events
            }
            StateChange::InvalidMessageReceived { reason } => {
                vec![Event::InvalidReceived { reason: reason.clone() }]
            }
            StateChange::SecretRevealReceived { sender, .. } if *sender == self.our_address => {
                // A self-injected reveal (swap maker) drives only the
                // target machines; the initiator leg waits for the real
                // reveal from its next hop.
                match change.secret_hash() {
                    Some(hash) => self.dispatch_to_role(&hash, TransferRole::Target, change),
                    None => Vec::new(),
                }
            }
            _ => match change.secret_hash() {
                Some(hash) => self.dispatch_to_hashlock(&hash, change),
                None => Vec::new(),
            },
        }
    }

    fn ensure_manager(&mut self, hash: SecretHash, token: TokenAddress, role: TransferRole) {
        let list = self.managers.entry(hash).or_default();
        // Finished managers are pruned lazily; replay keeps them in the
        // map, so only a live machine of the same role blocks creation.
        if !list.iter().any(|m| m.role == role && !m.is_finished()) {
            list.push(StateManager::new(role, hash, token));
        }
    }

    fn dispatch_to_hashlock(&mut self, hash: &SecretHash, change: &StateChange) -> Vec<Event> {
        let mut events = Vec::new();
        if let Some(list) = self.managers.get_mut(hash) {
            for manager in list.iter_mut() {
                events.extend(manager.dispatch(change));
            }
        }
        events
    }

    fn dispatch_to_role(
        &mut self,
        hash: &SecretHash,
        role: TransferRole,
        change: &StateChange,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        if let Some(list) = self.managers.get_mut(hash) {
            for manager in list.iter_mut().filter(|m| m.role == role) {
                events.extend(manager.dispatch(change));
            }
        }
        events
    }

    fn prune_finished(&mut self) {
        let mut finished_hashes = Vec::new();
        self.managers.retain(|hash, list| {
            list.retain(|m| !m.is_finished());
            if list.is_empty() {
                finished_hashes.push(*hash);
                false
            } else {
                true
            }
        });
        for hash in finished_hashes {
            // Swap subscriptions end with their machines.
            self.swaps.remove(&hash);
        }
    }

    // === Side effects ===

    fn act(&mut self, event: Event) -> anyhow::Result<()> {
        self.check_condition_quit(&event);
        match event {
            Event::SendLockedTransfer { recipient, transfer } => {
                let keypair = self.keypair.clone();
                // The proof commits to the carrying message; the lock
                // the channel will build has exactly these fields.
                let lock = hopnet_core::Lock {
                    amount: transfer.amount,
                    expiration: transfer.expiration,
                    secret_hash: transfer.secret_hash,
                };
                let additional_hash = mediated_transfer_binding(
                    transfer.payment_id,
                    &transfer.token_address,
                    &recipient,
                    &transfer.target,
                    &transfer.initiator,
                    &lock,
                    &transfer.fee,
                );
                let channel = self
                    .find_channel_mut(&transfer.channel_id)
                    .ok_or_else(|| anyhow::anyhow!("locked transfer on unknown channel"))?;
                let (proof, lock) = match channel.create_locked_transfer(
                    transfer.amount,
                    transfer.expiration,
                    transfer.secret_hash,
                    additional_hash,
                    &keypair,
                ) {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!(error = %e, "locked transfer no longer possible");
                        return Ok(());
                    }
                };
                let row = channel.clone();
                self.store.put_channel(&row)?;

                let message = Message::MediatedTransfer(MediatedTransfer {
                    payment_id: transfer.payment_id,
                    token_address: transfer.token_address,
                    recipient,
                    target: transfer.target,
                    initiator: transfer.initiator,
                    lock,
                    fee: transfer.fee,
                    balance_proof: proof,
                });
                self.send_with_retry(recipient, message)?;
            }
            Event::SendSecretRequest { recipient, payment_id, amount, secret_hash } => {
                if self.swaps.get(&secret_hash).is_some() {
                    // Swap legs never ask for the secret: the maker has
                    // it and the taker cannot use it early.
                    return Ok(());
                }
                let message = Message::SecretRequest(SecretRequest { payment_id, secret_hash, amount });
                self.send_with_retry(recipient, message)?;
            }
            Event::SendRevealSecret { recipient, secret, .. } => {
                let message = Message::RevealSecret(RevealSecret { secret });
                let echo = self.send_with_retry(recipient, message)?;
                self.store.set_sent_secret(&echo, SentSecretStatus::Sent)?;
            }
            Event::SendUnlock { recipient, channel_id, secret_hash, payment_id } => {
                if self.store.is_lock_disposed(&secret_hash, &channel_id)? {
                    tracing::warn!(
                        secret_hash = %hex::encode(secret_hash),
                        "refusing to unlock a disposed lock"
                    );
                    return Ok(());
                }
                let keypair = self.keypair.clone();
                let channel = self
                    .find_channel_mut(&channel_id)
                    .ok_or_else(|| anyhow::anyhow!("unlock on unknown channel"))?;
                let token = channel.token_address;
                let secret = match channel.our_state.secret_of(&secret_hash) {
                    Some(secret) => secret,
                    None => {
                        tracing::warn!("unlock requested for a lock with no known secret");
                        return Ok(());
                    }
                };
                let additional_hash = unlock_binding(payment_id, &token, &secret);
                let (proof, _lock, secret) =
                    match channel.create_unlock(secret_hash, additional_hash, &keypair) {
                        Ok(result) => result,
                        Err(e) => {
                            tracing::warn!(error = %e, "unlock no longer possible");
                            return Ok(());
                        }
                    };
                let row = channel.clone();
                self.store.put_channel(&row)?;

                let message = Message::Unlock(Unlock {
                    payment_id,
                    token_address: token,
                    secret,
                    balance_proof: proof,
                });
                self.send_with_retry(recipient, message)?;
            }
            Event::SendAnnounceDisposed { recipient, channel_id, secret_hash } => {
                // The disposal promise survives a crash; persist it
                // before the message can possibly leave.
                self.store.add_disposed_lock(&secret_hash, &channel_id)?;
                let channel = self
                    .find_channel_mut(&channel_id)
                    .ok_or_else(|| anyhow::anyhow!("announce-disposed on unknown channel"))?;
                let lock = match channel.partner_state.lock(&secret_hash) {
                    Some(lock) => lock.clone(),
                    None => {
                        tracing::warn!("disposed lock vanished before announcement");
                        return Ok(());
                    }
                };
                let message = Message::AnnounceDisposed(AnnounceDisposed { channel_id, lock });
                self.send_with_retry(recipient, message)?;
            }
            Event::SendAnnounceDisposedResponse { recipient, channel_id, secret_hash } => {
                let keypair = self.keypair.clone();
                let additional_hash = disposed_response_binding(&channel_id, &secret_hash);
                let channel = self
                    .find_channel_mut(&channel_id)
                    .ok_or_else(|| anyhow::anyhow!("disposed-response on unknown channel"))?;
                let (proof, _lock) =
                    match channel.create_disposed_response(secret_hash, additional_hash, &keypair) {
                        Ok(result) => result,
                        Err(e) => {
                            tracing::warn!(error = %e, "disposed-response no longer possible");
                            return Ok(());
                        }
                    };
                let row = channel.clone();
                self.store.put_channel(&row)?;

                let message = Message::AnnounceDisposedResponse(AnnounceDisposedResponse {
                    channel_id,
                    secret_hash,
                    balance_proof: proof,
                });
                self.send_with_retry(recipient, message)?;
            }
            Event::SendRemoveExpiredLock { recipient, channel_id, secret_hash } => {
                let keypair = self.keypair.clone();
                let block = self.block_number;
                let additional_hash = remove_expired_binding(&channel_id, &secret_hash);
                let channel = self
                    .find_channel_mut(&channel_id)
                    .ok_or_else(|| anyhow::anyhow!("remove-expired-lock on unknown channel"))?;
                let (proof, _lock) =
                    match channel.create_lock_expired(secret_hash, block, additional_hash, &keypair)
                    {
                        Ok(result) => result,
                        Err(e) => {
                            tracing::warn!(error = %e, "expired-lock removal not possible");
                            return Ok(());
                        }
                    };
                let row = channel.clone();
                self.store.put_channel(&row)?;

                let message = Message::RemoveExpiredLock(RemoveExpiredLock {
                    channel_id,
                    secret_hash,
                    balance_proof: proof,
                });
                self.send_with_retry(recipient, message)?;
            }
            Event::ContractRegisterSecret { secret } => {
                let registry = Arc::clone(&self.registry);
                tokio::spawn(async move {
                    if let Err(e) = registry.register_secret(secret).await {
                        tracing::error!(error = %e, "secret registration failed");
                    }
                });
            }
            Event::ContractCloseChannel { channel_id } => {
                let proof = self
                    .find_channel_mut(&channel_id)
                    .and_then(|c| c.partner_state.balance_proof.clone());
                let escrow = Arc::clone(&self.escrow);
                tokio::spawn(async move {
                    if let Err(e) = escrow.close(channel_id, proof).await {
                        tracing::error!(error = %e, "channel close submission failed");
                    }
                });
            }
            Event::TransferSentSuccess { payment_id, .. } => {
                self.resolve_payment(payment_id, true, None);
            }
            Event::TransferSentFailed { payment_id, reason } => {
                self.resolve_payment(payment_id, false, Some(reason));
            }
            Event::TransferReceivedSuccess { payment_id, initiator, amount } => {
                tracing::info!(
                    payment = payment_id,
                    from = %hex::encode(initiator),
                    amount = %amount,
                    "payment received"
                );
                // A swap taker's incoming leg resolves its request.
                self.resolve_payment(payment_id, true, None);
            }
            Event::TransferReceivedFailed { payment_id, reason } => {
                tracing::warn!(payment = payment_id, reason = %reason, "incoming payment failed");
                self.resolve_payment(payment_id, false, Some(reason));
            }
            Event::InvalidReceived { reason } => {
                tracing::warn!(reason = %reason, "protocol anomaly recorded");
            }
        }
        Ok(())
    }

    fn resolve_payment(&mut self, payment_id: u64, success: bool, reason: Option<String>) {
        if let Some(respond) = self.pending_payments.remove(&payment_id) {
            let _ = respond.send(Ok(PaymentOutcome {
                payment_id,
                secret_hash: [0u8; 32],
                success,
                reason,
            }));
        }
    }

    fn check_condition_quit(&mut self, event: &Event) {
        if self.condition_quit.is_empty() {
            return;
        }
        let name = event_name(event);
        if self.condition_quit.iter().any(|n| n == name) {
            tracing::warn!(event = name, "condition-quit triggered");
            let _ = self.store.backend().flush();
            std::process::exit(111);
        }
    }

    // === Secrets across channels ===

    fn register_secret_everywhere(&mut self, secret: &Secret) -> anyhow::Result<()> {
        let mut dirty = Vec::new();
        for graph in self.graphs.values_mut() {
            for channel in graph.channels_mut() {
                if channel.register_secret(secret).matched() {
                    dirty.push(channel.clone());
                }
            }
        }
        for row in dirty {
            self.store.put_channel(&row)?;
        }
        Ok(())
    }

    fn register_on_chain_secret_everywhere(
        &mut self,
        secret: &Secret,
        secret_hash: &SecretHash,
        block: BlockNumber,
    ) -> anyhow::Result<()> {
        let mut dirty = Vec::new();
        for graph in self.graphs.values_mut() {
            for channel in graph.channels_mut() {
                let registered = channel.register_on_chain_secret(secret_hash, block);
                let known = channel.register_secret(secret);
                if registered.matched() || known.matched() {
                    dirty.push(channel.clone());
                }
            }
        }
        for row in dirty {
            self.store.put_channel(&row)?;
        }
        Ok(())
    }

    /// Claim every claimable partner lock of a closed channel on chain.
    fn unlock_on_chain(&mut self, channel: &Channel) -> anyhow::Result<()> {
        for unclaimed in channel.partner_state.unclaimed_locks() {
            let secret_hash = unclaimed.lock.secret_hash;
            if self.store.is_lock_disposed(&secret_hash, &channel.channel_id())? {
                continue;
            }
            let proof = match channel.partner_state.lock_proof(&secret_hash) {
                Some(proof) => proof,
                None => continue,
            };
            let escrow = Arc::clone(&self.escrow);
            let channel_id = channel.channel_id();
            let lock = unclaimed.lock.clone();
            let secret = unclaimed.secret;
            tokio::spawn(async move {
                if let Err(e) = escrow.unlock(channel_id, lock, proof, secret).await {
                    tracing::error!(error = %e, "on-chain unlock failed");
                }
            });
        }
        Ok(())
    }

    // === Outbound delivery ===

    fn send_with_retry(&mut self, recipient: Address, message: Message) -> anyhow::Result<[u8; 32]> {
        let signed = SignedMessage::new(message, &self.keypair)?;
        let echo_hash = signed.echo_hash(&recipient)?;
        let data = MessageCodec::frame(&signed)?;

        self.store.put_outbox(&OutboxEntry {
            echo_hash,
            recipient,
            data: data.clone(),
        })?;
        self.retry_queue.enqueue(recipient, echo_hash, data.clone(), now());
        self.spawn_send(recipient, data);
        Ok(echo_hash)
    }

    fn send_fire_and_forget(&mut self, recipient: Address, message: Message) -> anyhow::Result<()> {
        let signed = SignedMessage::new(message, &self.keypair)?;
        let data = MessageCodec::frame(&signed)?;
        self.spawn_send(recipient, data);
        Ok(())
    }

    fn send_ack(&mut self, received: &SignedMessage) -> anyhow::Result<()> {
        let ack = received.ack(&self.keypair)?;
        let recipient = received.sender_address();
        let data = MessageCodec::frame(&ack)?;
        self.spawn_send(recipient, data);
        Ok(())
    }

    fn spawn_send(&self, recipient: Address, data: Vec<u8>) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            if let Err(e) = transport.send(recipient, data).await {
                tracing::debug!(error = %e, "transport send failed, redelivery will retry");
            }
        });
    }

    fn handle_send_complete(&mut self, echo_hash: [u8; 32]) -> anyhow::Result<()> {
        if self.retry_queue.acknowledge(&echo_hash).is_some() {
            self.store.remove_outbox(&echo_hash)?;
            if self.store.sent_secret(&echo_hash)?.is_some() {
                self.store
                    .set_sent_secret(&echo_hash, SentSecretStatus::Acknowledged)?;
            }
        }
        Ok(())
    }

    fn sweep_deliveries(&mut self) {
        let sweep = self.retry_queue.sweep(now());
        for delivery in sweep.send_now {
            self.spawn_send(delivery.recipient, delivery.data);
        }
        for delivery in sweep.gave_up {
            tracing::warn!(
                recipient = %hex::encode(delivery.recipient),
                attempts = delivery.attempts,
                "peer unreachable, giving up on delivery"
            );
            // Route search skips the peer from here on; the application
            // deadline (lock expiration) decides the transfer's fate.
            self.health.mark_unreachable(&delivery.recipient);
        }
    }

    // === Routing ===

    fn routes_for(
        &self,
        token: TokenAddress,
        target: Address,
        amount: TokenAmount,
        excluded: &std::collections::HashSet<Address>,
    ) -> Vec<hopnet_state::Route> {
        let graph = match self.graphs.get(&token) {
            Some(graph) => graph,
            None => return Vec::new(),
        };
        let reachability = self.health.reachability();
        let fee = self.config.mediation_fee;
        graph.available_routes(target, amount, excluded, &reachability, |_| fee)
    }

    // === Snapshots ===

    fn maybe_snapshot(&mut self) -> anyhow::Result<()> {
        if self.changes_since_snapshot < self.config.snapshot_interval {
            return Ok(());
        }
        self.write_snapshot()
    }

    fn write_snapshot(&mut self) -> anyhow::Result<()> {
        let state = GlobalState {
            block_number: self.block_number,
            managers: self.managers.clone(),
        };
        let bytes = hopnet_core::serialization::serialize(&state)?;
        let last_id = self.store.last_state_change_id();
        self.store.write_snapshot(last_id, bytes)?;
        self.changes_since_snapshot = 0;
        tracing::debug!(state_change_id = last_id, "snapshot written");
        Ok(())
    }

    // === Small helpers ===

    fn find_channel_mut(&mut self, channel_id: &ChannelId) -> Option<&mut Channel> {
        self.graphs
            .values_mut()
            .find_map(|graph| graph.channel_mut(channel_id))
    }

    fn fresh_payment_id(&mut self) -> u64 {
        let id = self.next_payment_id;
        self.next_payment_id += 1;
        id
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn fresh_secret() -> Secret {
    use rand::RngCore;
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    secret
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::SendLockedTransfer { .. } => "SendLockedTransfer",
        Event::SendSecretRequest { .. } => "SendSecretRequest",
        Event::SendRevealSecret { .. } => "SendRevealSecret",
        Event::SendUnlock { .. } => "SendUnlock",
        Event::SendAnnounceDisposed { .. } => "SendAnnounceDisposed",
        Event::SendAnnounceDisposedResponse { .. } => "SendAnnounceDisposedResponse",
        Event::SendRemoveExpiredLock { .. } => "SendRemoveExpiredLock",
        Event::ContractRegisterSecret { .. } => "ContractRegisterSecret",
        Event::ContractCloseChannel { .. } => "ContractCloseChannel",
        Event::TransferSentSuccess { .. } => "TransferSentSuccess",
        Event::TransferSentFailed { .. } => "TransferSentFailed",
        Event::TransferReceivedSuccess { .. } => "TransferReceivedSuccess",
        Event::TransferReceivedFailed { .. } => "TransferReceivedFailed",
        Event::InvalidReceived { .. } => "InvalidReceived",
    }
}

fn withdraw_signing_data(
    channel_id: &ChannelId,
    participant: &Address,
    total_withdraw: &TokenAmount,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(32 + 20 + 32);
    data.extend_from_slice(channel_id);
    data.extend_from_slice(participant);
    data.extend_from_slice(&total_withdraw.to_be_bytes());
    data
}

fn settle_signing_data(
    channel_id: &ChannelId,
    participant1_balance: &TokenAmount,
    participant2_balance: &TokenAmount,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(32 + 32 + 32);
    data.extend_from_slice(channel_id);
    data.extend_from_slice(&participant1_balance.to_be_bytes());
    data.extend_from_slice(&participant2_balance.to_be_bytes());
    data
}
