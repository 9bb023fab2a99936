//! Ack-driven redelivery.
//!
//! Every ack-requiring message stays queued until its echo hash is
//! acknowledged. Redelivery backs off exponentially from one second to
//! a 64-second cap; after 32 attempts the peer is declared unreachable
//! and the queue hands the message back to the caller.
//!
//! The queue is pure bookkeeping over caller-supplied timestamps, so
//! the whole schedule is unit-testable without a clock.

use std::collections::HashMap;
use std::time::Duration;

use hopnet_core::Address;

/// Exponential backoff schedule for redelivery.
#[derive(Clone, Copy, Debug)]
pub struct RetrySchedule {
    /// Delay before the first redelivery.
    pub initial: Duration,
    /// Ceiling for the delay between attempts.
    pub max_delay: Duration,
    /// Total delivery attempts before the peer is declared unreachable.
    pub max_attempts: u32,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        RetrySchedule {
            initial: Duration::from_secs(1),
            max_delay: Duration::from_secs(64),
            max_attempts: 32,
        }
    }
}

impl RetrySchedule {
    /// Delay after `attempt` deliveries (1-based), or None once the
    /// attempts are exhausted.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let doubled = self
            .initial
            .checked_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay);
        Some(doubled.min(self.max_delay))
    }
}

/// One message awaiting its ack.
#[derive(Clone, Debug)]
pub struct PendingDelivery {
    /// The peer the message is for.
    pub recipient: Address,
    /// Echo hash identifying the delivery.
    pub echo_hash: [u8; 32],
    /// Framed bytes handed to the transport on every attempt.
    pub data: Vec<u8>,
    /// Deliveries made so far.
    pub attempts: u32,
    /// Timestamp at which the next redelivery is due.
    pub next_attempt_at: u64,
}

/// Outcome of a redelivery sweep.
#[derive(Debug, Default)]
pub struct Sweep {
    /// Messages to put on the wire now.
    pub send_now: Vec<PendingDelivery>,
    /// Messages whose peers are now considered unreachable.
    pub gave_up: Vec<PendingDelivery>,
}

/// The outbound queue of unacknowledged messages.
#[derive(Debug, Default)]
pub struct RetryQueue {
    pending: HashMap<[u8; 32], PendingDelivery>,
    schedule: RetrySchedule,
}

impl RetryQueue {
    /// Create a queue with the given schedule.
    pub fn new(schedule: RetrySchedule) -> Self {
        RetryQueue { pending: HashMap::new(), schedule }
    }

    /// Queue a first delivery. The message goes on the wire immediately
    /// (attempt 1); the queue tracks the redeliveries.
    pub fn enqueue(&mut self, recipient: Address, echo_hash: [u8; 32], data: Vec<u8>, now: u64) {
        let delay = self.schedule.delay_after(1).unwrap_or(self.schedule.max_delay);
        self.pending.insert(
            echo_hash,
            PendingDelivery {
                recipient,
                echo_hash,
                data,
                attempts: 1,
                next_attempt_at: now + delay.as_secs(),
            },
        );
    }

    /// An ack arrived: the delivery is settled.
    pub fn acknowledge(&mut self, echo_hash: &[u8; 32]) -> Option<PendingDelivery> {
        self.pending.remove(echo_hash)
    }

    /// Whether a delivery is still outstanding.
    pub fn is_pending(&self, echo_hash: &[u8; 32]) -> bool {
        self.pending.contains_key(echo_hash)
    }

    /// Number of outstanding deliveries.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Outstanding deliveries for one peer.
    pub fn pending_for(&self, recipient: &Address) -> Vec<&PendingDelivery> {
        self.pending
            .values()
            .filter(|p| p.recipient == *recipient)
            .collect()
    }

    /// Collect everything due at `now`: messages to redeliver and
    /// messages whose attempts ran out.
    pub fn sweep(&mut self, now: u64) -> Sweep {
        let mut result = Sweep::default();
        let due: Vec<[u8; 32]> = self
            .pending
            .values()
            .filter(|p| p.next_attempt_at <= now)
            .map(|p| p.echo_hash)
            .collect();

        for echo_hash in due {
            let entry = self.pending.get_mut(&echo_hash).unwrap();
            entry.attempts += 1;
            match self.schedule.delay_after(entry.attempts) {
                Some(delay) => {
                    entry.next_attempt_at = now + delay.as_secs();
                    result.send_now.push(entry.clone());
                }
                None => {
                    result.gave_up.push(self.pending.remove(&echo_hash).unwrap());
                }
            }
        }
        result
    }

    /// Earliest due timestamp, for scheduling the next sweep.
    pub fn next_due(&self) -> Option<u64> {
        self.pending.values().map(|p| p.next_attempt_at).min()
    }
}
