//! Neighbour health checking.
//!
//! Each channel partner is pinged on a bounded interval. Failures flip
//! the reachability flag consulted by route search; they never produce
//! state changes of their own.

use std::collections::HashMap;

use hopnet_core::Address;

/// Default seconds between pings to one neighbour.
pub const DEFAULT_PING_INTERVAL: u64 = 30;

/// Consecutive unanswered pings before a neighbour counts as offline.
pub const DEFAULT_MAX_MISSES: u32 = 3;

#[derive(Clone, Debug, Default)]
struct PeerHealth {
    reachable: bool,
    last_seen: u64,
    last_ping_at: u64,
    outstanding_nonce: Option<u64>,
    misses: u32,
}

/// Tracks reachability of every monitored neighbour.
#[derive(Debug)]
pub struct HealthMonitor {
    peers: HashMap<Address, PeerHealth>,
    ping_interval: u64,
    max_misses: u32,
    next_nonce: u64,
}

impl HealthMonitor {
    /// Create a monitor with the given ping interval (seconds) and miss
    /// tolerance.
    pub fn new(ping_interval: u64, max_misses: u32) -> Self {
        HealthMonitor {
            peers: HashMap::new(),
            ping_interval,
            max_misses,
            next_nonce: 1,
        }
    }

    /// Start monitoring a neighbour. New neighbours count as reachable
    /// until pings say otherwise.
    pub fn watch(&mut self, address: Address, now: u64) {
        self.peers.entry(address).or_insert(PeerHealth {
            reachable: true,
            last_seen: now,
            ..PeerHealth::default()
        });
    }

    /// Stop monitoring a neighbour (channel settled).
    pub fn unwatch(&mut self, address: &Address) {
        self.peers.remove(address);
    }

    /// Whether a neighbour is currently considered reachable.
    pub fn is_reachable(&self, address: &Address) -> bool {
        self.peers.get(address).map(|p| p.reachable).unwrap_or(false)
    }

    /// Timestamp of the last activity seen from a neighbour.
    pub fn last_seen(&self, address: &Address) -> u64 {
        self.peers.get(address).map(|p| p.last_seen).unwrap_or(0)
    }

    /// Pings due at `now`: returns `(address, nonce)` pairs to send.
    /// An unanswered previous ping counts as a miss first.
    pub fn due_pings(&mut self, now: u64) -> Vec<(Address, u64)> {
        let mut out = Vec::new();
        for (address, peer) in self.peers.iter_mut() {
            if now < peer.last_ping_at + self.ping_interval {
                continue;
            }
            if peer.outstanding_nonce.take().is_some() {
                peer.misses += 1;
                if peer.misses >= self.max_misses && peer.reachable {
                    peer.reachable = false;
                    tracing::info!(address = %hex_prefix(address), "neighbour unreachable");
                }
            }
            let nonce = self.next_nonce;
            self.next_nonce += 1;
            peer.outstanding_nonce = Some(nonce);
            peer.last_ping_at = now;
            out.push((*address, nonce));
        }
        out
    }

    /// A pong arrived.
    pub fn on_pong(&mut self, address: &Address, nonce: u64, now: u64) {
        if let Some(peer) = self.peers.get_mut(address) {
            if peer.outstanding_nonce == Some(nonce) {
                peer.outstanding_nonce = None;
            }
            peer.misses = 0;
            if !peer.reachable {
                tracing::info!(address = %hex_prefix(address), "neighbour reachable again");
            }
            peer.reachable = true;
            peer.last_seen = now;
        }
    }

    /// Any inbound traffic from a neighbour proves liveness.
    pub fn on_activity(&mut self, address: &Address, now: u64) {
        if let Some(peer) = self.peers.get_mut(address) {
            peer.misses = 0;
            peer.reachable = true;
            peer.last_seen = now;
        }
    }

    /// Force a neighbour offline: delivery attempts were exhausted.
    /// The flag stays down until the peer shows life again (a pong or
    /// any inbound message).
    pub fn mark_unreachable(&mut self, address: &Address) {
        if let Some(peer) = self.peers.get_mut(address) {
            if peer.reachable {
                tracing::info!(address = %hex_prefix(address), "neighbour unreachable");
            }
            peer.reachable = false;
            peer.outstanding_nonce = None;
            peer.misses = self.max_misses;
        }
    }

    /// Snapshot of the reachability map, for route search.
    pub fn reachability(&self) -> HashMap<Address, bool> {
        self.peers
            .iter()
            .map(|(address, peer)| (*address, peer.reachable))
            .collect()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_PING_INTERVAL, DEFAULT_MAX_MISSES)
    }
}

fn hex_prefix(address: &Address) -> String {
    address[..4].iter().map(|b| format!("{:02x}", b)).collect()
}
