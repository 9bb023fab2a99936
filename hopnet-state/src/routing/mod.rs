//! Per-token channel graph and route search.

mod graph;

pub use graph::{ChannelGraph, Presence};

use serde::{Deserialize, Serialize};

use hopnet_core::{Address, BlockNumber, ChannelId, TokenAmount};

/// One candidate path for an outgoing transfer, summarised from the
/// first hop's channel and the graph distance to the target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// The neighbour the transfer is handed to.
    pub next_hop: Address,
    /// Our channel with that neighbour.
    pub channel_id: ChannelId,
    /// Distributable capacity on that channel when the route was built.
    pub available_balance: TokenAmount,
    /// Settle timeout of the first-hop channel.
    pub settle_timeout: BlockNumber,
    /// Reveal timeout of the first-hop channel.
    pub reveal_timeout: BlockNumber,
    /// Total mediation fee along the path.
    pub fee: TokenAmount,
    /// Number of hops to the target, first hop included.
    pub hops: u32,
    /// Transport-reported last activity of the neighbour, for tie-breaks.
    pub last_seen: u64,
}

/// The ordered set of candidate routes for one transfer, with the ones
/// already tried (refunded or cancelled) kept aside.
///
/// Routes are tried in the order the search produced: cheapest fee
/// first, then fewest hops, then most recently seen neighbour.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutesState {
    /// Untried routes, best first.
    pub available: Vec<Route>,
    /// Routes already tried and given up on.
    pub tried: Vec<Route>,
}

impl RoutesState {
    /// Wrap an ordered route list.
    pub fn new(available: Vec<Route>) -> Self {
        RoutesState { available, tried: Vec::new() }
    }

    /// Take the next route satisfying `filter`, marking skipped and
    /// taken routes as tried.
    pub fn take_next<F>(&mut self, mut filter: F) -> Option<Route>
    where
        F: FnMut(&Route) -> bool,
    {
        while !self.available.is_empty() {
            let route = self.available.remove(0);
            if filter(&route) {
                self.tried.push(route.clone());
                return Some(route);
            }
            self.tried.push(route);
        }
        None
    }

    /// Whether any untried route remains.
    pub fn has_available(&self) -> bool {
        !self.available.is_empty()
    }
}

/// Order routes by (fee, hops, most recently seen).
pub fn sort_routes(routes: &mut [Route]) {
    routes.sort_by(|a, b| {
        a.fee
            .cmp(&b.fee)
            .then(a.hops.cmp(&b.hops))
            .then(b.last_seen.cmp(&a.last_seen))
    });
}
