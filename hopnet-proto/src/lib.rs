//! # Hopnet Proto
//!
//! The wire protocol of a hopnet node: signed messages, length-prefixed
//! framing, echo-hash deduplication, ack-driven at-least-once delivery
//! and the neighbour health check.
//!
//! The socket transport itself is an external collaborator; this crate
//! defines the [`Transport`] trait it implements and everything layered
//! on top of it.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod dedup;
pub mod error;
pub mod framing;
pub mod health;
pub mod messages;
pub mod retry;

pub use dedup::EchoFilter;
pub use error::{ProtoError, ProtoResult};
pub use framing::MessageCodec;
pub use health::HealthMonitor;
pub use messages::{Message, SignedMessage};
pub use retry::{RetryQueue, RetrySchedule};

use async_trait::async_trait;
use hopnet_core::Address;

/// The peer-to-peer transport, implemented outside this workspace.
///
/// `send` resolves the recipient's address to a network endpoint and
/// delivers the framed bytes once; delivery guarantees are layered on
/// top via [`RetryQueue`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand one framed message to the network.
    async fn send(&self, recipient: Address, data: Vec<u8>) -> ProtoResult<()>;
}
