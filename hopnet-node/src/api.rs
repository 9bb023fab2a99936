//! The user request API.
//!
//! Requests enter the event loop through a channel and complete through
//! per-request oneshot handles; the loop never blocks on a caller and a
//! caller never touches protocol state directly.

use tokio::sync::{mpsc, oneshot};

use hopnet_core::{Address, BlockNumber, ChannelId, SecretHash, TokenAddress, TokenAmount};

use crate::swap::TokenSwap;

/// Errors surfaced to API callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiError {
    /// No channel with the requested partner or id.
    UnknownChannel,
    /// No route can carry the payment.
    NoRoute,
    /// A channel operation was rejected.
    Channel(String),
    /// A chain submission failed.
    Chain(String),
    /// The node is shutting down.
    ShuttingDown,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::UnknownChannel => write!(f, "unknown channel"),
            ApiError::NoRoute => write!(f, "no route to target"),
            ApiError::Channel(reason) => write!(f, "channel error: {}", reason),
            ApiError::Chain(reason) => write!(f, "chain error: {}", reason),
            ApiError::ShuttingDown => write!(f, "node is shutting down"),
        }
    }
}

impl std::error::Error for ApiError {}

/// Final outcome of a payment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentOutcome {
    /// The payment identifier.
    pub payment_id: u64,
    /// The payment's hashlock (zero for direct transfers).
    pub secret_hash: SecretHash,
    /// Whether the payment completed.
    pub success: bool,
    /// Failure reason, when it did not.
    pub reason: Option<String>,
}

/// Requests the event loop accepts.
#[derive(Debug)]
pub enum ApiRequest {
    /// Start a mediated transfer; resolves on success or failure.
    Transfer {
        /// Token to transfer.
        token: TokenAddress,
        /// Final recipient.
        target: Address,
        /// Amount the target should receive.
        amount: TokenAmount,
        /// Fee budget for mediators.
        fee: TokenAmount,
        /// Optional caller-chosen payment identifier.
        payment_id: Option<u64>,
        /// Completion handle.
        respond: oneshot::Sender<Result<PaymentOutcome, ApiError>>,
    },
    /// Send a direct transfer to a channel partner.
    DirectTransfer {
        /// Token to transfer.
        token: TokenAddress,
        /// The channel partner.
        partner: Address,
        /// Amount to transfer.
        amount: TokenAmount,
        /// Completion handle; resolves when the message is queued.
        respond: oneshot::Sender<Result<u64, ApiError>>,
    },
    /// Cancel a pending outgoing payment.
    CancelPayment {
        /// The payment to cancel.
        payment_id: u64,
    },
    /// Open a channel on chain.
    OpenChannel {
        /// Token network.
        token: TokenAddress,
        /// Partner to open with.
        partner: Address,
        /// Settle timeout for the new channel.
        settle_timeout: BlockNumber,
        /// Completion handle with the new channel id.
        respond: oneshot::Sender<Result<ChannelId, ApiError>>,
    },
    /// Deposit into an open channel.
    Deposit {
        /// Channel to deposit into.
        channel_id: ChannelId,
        /// Amount to add.
        amount: TokenAmount,
        /// Completion handle.
        respond: oneshot::Sender<Result<(), ApiError>>,
    },
    /// Close a channel unilaterally with the partner's latest proof.
    CloseChannel {
        /// Channel to close.
        channel_id: ChannelId,
        /// Completion handle.
        respond: oneshot::Sender<Result<(), ApiError>>,
    },
    /// Settle a closed channel once the settle window passed.
    SettleChannel {
        /// Channel to settle.
        channel_id: ChannelId,
        /// Completion handle.
        respond: oneshot::Sender<Result<(), ApiError>>,
    },
    /// Negotiate an on-chain withdraw with the partner.
    Withdraw {
        /// Channel to withdraw from.
        channel_id: ChannelId,
        /// New total withdrawn amount.
        total_withdraw: TokenAmount,
        /// Completion handle; resolves when the request is sent.
        respond: oneshot::Sender<Result<(), ApiError>>,
    },
    /// Cancel a withdraw negotiation before the partner signs.
    CancelWithdraw {
        /// Channel the negotiation is on.
        channel_id: ChannelId,
        /// Completion handle.
        respond: oneshot::Sender<Result<(), ApiError>>,
    },
    /// Negotiate a cooperative settle with the partner.
    CooperativeSettle {
        /// Channel to settle.
        channel_id: ChannelId,
        /// Completion handle; resolves when the request is sent.
        respond: oneshot::Sender<Result<(), ApiError>>,
    },
    /// Cancel a cooperative settle before the partner signs.
    CancelCooperativeSettle {
        /// Channel the negotiation is on.
        channel_id: ChannelId,
        /// Completion handle.
        respond: oneshot::Sender<Result<(), ApiError>>,
    },
    /// Start a token swap leg.
    TokenSwap {
        /// The swap description.
        swap: TokenSwap,
        /// Completion handle; resolves when both legs settle.
        respond: oneshot::Sender<Result<PaymentOutcome, ApiError>>,
    },
    /// Arm the condition-quit test hook: the process exits with code
    /// 111 when the named event is next produced.
    ConditionQuit {
        /// Event name, e.g. `SendRevealSecret`.
        event_name: String,
    },
}

/// Cloneable client handle for submitting requests to the loop.
#[derive(Clone)]
pub struct NodeApi {
    tx: mpsc::Sender<ApiRequest>,
}

impl NodeApi {
    /// Wrap the loop's request channel.
    pub fn new(tx: mpsc::Sender<ApiRequest>) -> Self {
        NodeApi { tx }
    }

    /// Start a mediated transfer and wait for its outcome.
    pub async fn transfer(
        &self,
        token: TokenAddress,
        target: Address,
        amount: TokenAmount,
        fee: TokenAmount,
    ) -> Result<PaymentOutcome, ApiError> {
        let (respond, rx) = oneshot::channel();
        self.send(ApiRequest::Transfer { token, target, amount, fee, payment_id: None, respond })
            .await?;
        rx.await.map_err(|_| ApiError::ShuttingDown)?
    }

    /// Send a direct transfer.
    pub async fn direct_transfer(
        &self,
        token: TokenAddress,
        partner: Address,
        amount: TokenAmount,
    ) -> Result<u64, ApiError> {
        let (respond, rx) = oneshot::channel();
        self.send(ApiRequest::DirectTransfer { token, partner, amount, respond })
            .await?;
        rx.await.map_err(|_| ApiError::ShuttingDown)?
    }

    /// Open a channel and wait for the contract-assigned id.
    pub async fn open_channel(
        &self,
        token: TokenAddress,
        partner: Address,
        settle_timeout: BlockNumber,
    ) -> Result<ChannelId, ApiError> {
        let (respond, rx) = oneshot::channel();
        self.send(ApiRequest::OpenChannel { token, partner, settle_timeout, respond })
            .await?;
        rx.await.map_err(|_| ApiError::ShuttingDown)?
    }

    /// Deposit into a channel.
    pub async fn deposit(&self, channel_id: ChannelId, amount: TokenAmount) -> Result<(), ApiError> {
        let (respond, rx) = oneshot::channel();
        self.send(ApiRequest::Deposit { channel_id, amount, respond }).await?;
        rx.await.map_err(|_| ApiError::ShuttingDown)?
    }

    /// Close a channel.
    pub async fn close_channel(&self, channel_id: ChannelId) -> Result<(), ApiError> {
        let (respond, rx) = oneshot::channel();
        self.send(ApiRequest::CloseChannel { channel_id, respond }).await?;
        rx.await.map_err(|_| ApiError::ShuttingDown)?
    }

    /// Run a token swap leg to completion.
    pub async fn token_swap(&self, swap: TokenSwap) -> Result<PaymentOutcome, ApiError> {
        let (respond, rx) = oneshot::channel();
        self.send(ApiRequest::TokenSwap { swap, respond }).await?;
        rx.await.map_err(|_| ApiError::ShuttingDown)?
    }

    /// Submit a raw request.
    pub async fn send(&self, request: ApiRequest) -> Result<(), ApiError> {
        self.tx.send(request).await.map_err(|_| ApiError::ShuttingDown)
    }
}
