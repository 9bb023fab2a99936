//! Per-token channel graph.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use hopnet_core::{Address, ChannelId, TokenAddress, TokenAmount};

use crate::channel::Channel;
use crate::routing::{sort_routes, Route};

/// Answers reachability questions about neighbours.
///
/// Implemented by the transport layer; route search skips neighbours the
/// transport reports offline.
pub trait Presence {
    /// Whether the node is currently reachable.
    fn is_reachable(&self, address: &Address) -> bool;

    /// Monotonic timestamp of the last activity seen from the node.
    fn last_seen(&self, address: &Address) -> u64 {
        let _ = address;
        0
    }
}

/// Everybody-online presence, for tests and single-hop setups.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllReachable;

impl Presence for AllReachable {
    fn is_reachable(&self, _address: &Address) -> bool {
        true
    }
}

impl Presence for HashMap<Address, bool> {
    fn is_reachable(&self, address: &Address) -> bool {
        self.get(address).copied().unwrap_or(false)
    }
}

/// The channel graph for one token: our own channels plus the network
/// topology learned from on-chain channel-opened events.
///
/// The graph is the exclusive owner of this token's [`Channel`] objects;
/// everything else refers to them through it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelGraph {
    /// The token this graph covers.
    pub token_address: TokenAddress,
    /// Our own address, the root of every route search.
    pub our_address: Address,
    channels: BTreeMap<ChannelId, Channel>,
    partner_index: BTreeMap<Address, ChannelId>,
    edges: BTreeMap<Address, BTreeSet<Address>>,
}

impl ChannelGraph {
    /// Create an empty graph.
    pub fn new(token_address: TokenAddress, our_address: Address) -> Self {
        ChannelGraph {
            token_address,
            our_address,
            channels: BTreeMap::new(),
            partner_index: BTreeMap::new(),
            edges: BTreeMap::new(),
        }
    }

    /// Register one of our own channels. Also records the topology edge.
    pub fn add_channel(&mut self, channel: Channel) {
        let id = channel.channel_id();
        let partner = channel.partner_address();
        self.partner_index.insert(partner, id);
        self.add_edge(self.our_address, partner);
        self.channels.insert(id, channel);
    }

    /// Record a channel between two foreign nodes.
    pub fn add_edge(&mut self, a: Address, b: Address) {
        self.edges.entry(a).or_default().insert(b);
        self.edges.entry(b).or_default().insert(a);
    }

    /// Drop a topology edge (channel settled).
    pub fn remove_edge(&mut self, a: Address, b: Address) {
        if let Some(set) = self.edges.get_mut(&a) {
            set.remove(&b);
        }
        if let Some(set) = self.edges.get_mut(&b) {
            set.remove(&a);
        }
    }

    /// Our channel with `partner`, if any.
    pub fn channel_with(&self, partner: &Address) -> Option<&Channel> {
        self.partner_index
            .get(partner)
            .and_then(|id| self.channels.get(id))
    }

    /// Mutable access to our channel with `partner`.
    pub fn channel_with_mut(&mut self, partner: &Address) -> Option<&mut Channel> {
        let id = *self.partner_index.get(partner)?;
        self.channels.get_mut(&id)
    }

    /// Our channel by contract identifier.
    pub fn channel(&self, id: &ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }

    /// Mutable access to our channel by contract identifier.
    pub fn channel_mut(&mut self, id: &ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(id)
    }

    /// Iterate over all of our channels.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Mutable iteration over all of our channels.
    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.values_mut()
    }

    /// Addresses of all our channel partners.
    pub fn partners(&self) -> impl Iterator<Item = &Address> {
        self.partner_index.keys()
    }

    /// Breadth-first distance from `from` to `to`, ignoring `excluded`
    /// nodes. None when unreachable.
    fn distance(&self, from: &Address, to: &Address, excluded: &HashSet<Address>) -> Option<u32> {
        if from == to {
            return Some(0);
        }
        let mut visited: HashSet<Address> = excluded.clone();
        visited.insert(*from);
        let mut queue: VecDeque<(Address, u32)> = VecDeque::new();
        queue.push_back((*from, 0));

        while let Some((node, dist)) = queue.pop_front() {
            if let Some(neighbours) = self.edges.get(&node) {
                for next in neighbours {
                    if *next == *to {
                        return Some(dist + 1);
                    }
                    if visited.insert(*next) {
                        queue.push_back((*next, dist + 1));
                    }
                }
            }
        }
        None
    }

    /// Candidate routes from us to `target` able to carry `amount`.
    ///
    /// Each viable first hop yields one route: the channel must be open
    /// with enough distributable capacity, the neighbour must be
    /// reachable and not excluded, and the target must be reachable from
    /// the neighbour without passing through an excluded node. Results
    /// are ordered by (fee, hops, last seen). `fee_for` prices one
    /// mediating node.
    pub fn available_routes<P, F>(
        &self,
        target: Address,
        amount: TokenAmount,
        excluded: &HashSet<Address>,
        presence: &P,
        fee_for: F,
    ) -> Vec<Route>
    where
        P: Presence + ?Sized,
        F: Fn(&Address) -> TokenAmount,
    {
        let mut search_excluded = excluded.clone();
        search_excluded.insert(self.our_address);

        let mut routes = Vec::new();
        for (partner, channel_id) in &self.partner_index {
            if excluded.contains(partner) {
                continue;
            }
            let channel = match self.channels.get(channel_id) {
                Some(c) => c,
                None => continue,
            };
            if !channel.can_transfer() {
                continue;
            }
            let available = channel.distributable();
            if available < amount {
                continue;
            }
            if !presence.is_reachable(partner) {
                continue;
            }

            let mut hop_excluded = search_excluded.clone();
            hop_excluded.remove(partner);
            let distance = match self.distance(partner, &target, &hop_excluded) {
                Some(d) => d,
                None => continue,
            };

            // Mediating nodes between us and the target each charge a
            // fee. Deeper mediators are priced like the first hop because
            // route search cannot see their policies.
            let fee = if *partner == target {
                TokenAmount::zero()
            } else {
                fee_for(partner) * TokenAmount::from_u64(u64::from(distance))
            };

            routes.push(Route {
                next_hop: *partner,
                channel_id: *channel_id,
                available_balance: available,
                settle_timeout: channel.settle_timeout(),
                reveal_timeout: channel.reveal_timeout(),
                fee,
                hops: distance + 1,
                last_seen: presence.last_seen(partner),
            });
        }

        sort_routes(&mut routes);
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ExternalState;

    fn addr(tag: u8) -> Address {
        [tag; 20]
    }

    fn channel(our: u8, partner: u8, deposit: u64, id: u8) -> Channel {
        Channel::new(
            [0xAA; 20],
            addr(our),
            addr(partner),
            TokenAmount::from_u64(deposit),
            TokenAmount::from_u64(deposit),
            ExternalState::new([id; 32], 1, 500, 30),
        )
    }

    fn no_fee(_: &Address) -> TokenAmount {
        TokenAmount::zero()
    }

    /// Topology: us(1) - B(2) - D(4), us(1) - C(3) - D(4).
    fn diamond() -> ChannelGraph {
        let mut graph = ChannelGraph::new([0xAA; 20], addr(1));
        graph.add_channel(channel(1, 2, 100, 2));
        graph.add_channel(channel(1, 3, 10, 3));
        graph.add_edge(addr(2), addr(4));
        graph.add_edge(addr(3), addr(4));
        graph
    }

    #[test]
    fn test_direct_neighbour_route() {
        let graph = diamond();
        let routes = graph.available_routes(
            addr(2),
            TokenAmount::from_u64(50),
            &HashSet::new(),
            &AllReachable,
            no_fee,
        );
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].next_hop, addr(2));
        assert_eq!(routes[0].hops, 1);
    }

    #[test]
    fn test_capacity_filter() {
        let graph = diamond();
        // Only the B channel can carry 50.
        let routes = graph.available_routes(
            addr(4),
            TokenAmount::from_u64(50),
            &HashSet::new(),
            &AllReachable,
            no_fee,
        );
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].next_hop, addr(2));
        assert_eq!(routes[0].hops, 2);
    }

    #[test]
    fn test_both_routes_when_amount_fits() {
        let graph = diamond();
        let routes = graph.available_routes(
            addr(4),
            TokenAmount::from_u64(5),
            &HashSet::new(),
            &AllReachable,
            no_fee,
        );
        assert_eq!(routes.len(), 2);
    }

    #[test]
    fn test_offline_neighbour_skipped() {
        let graph = diamond();
        let mut presence: HashMap<Address, bool> = HashMap::new();
        presence.insert(addr(2), false);
        presence.insert(addr(3), true);

        let routes = graph.available_routes(
            addr(4),
            TokenAmount::from_u64(5),
            &HashSet::new(),
            &presence,
            no_fee,
        );
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].next_hop, addr(3));
    }

    #[test]
    fn test_excluded_nodes_honoured() {
        let graph = diamond();
        let mut excluded = HashSet::new();
        excluded.insert(addr(2));

        let routes = graph.available_routes(
            addr(4),
            TokenAmount::from_u64(5),
            &excluded,
            &AllReachable,
            no_fee,
        );
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].next_hop, addr(3));
    }

    #[test]
    fn test_unreachable_target() {
        let graph = diamond();
        let routes = graph.available_routes(
            addr(9),
            TokenAmount::from_u64(5),
            &HashSet::new(),
            &AllReachable,
            no_fee,
        );
        assert!(routes.is_empty());
    }

    #[test]
    fn test_closed_channel_skipped() {
        let mut graph = diamond();
        graph
            .channel_with_mut(&addr(2))
            .unwrap()
            .handle_closed(100)
            .unwrap();

        let routes = graph.available_routes(
            addr(4),
            TokenAmount::from_u64(5),
            &HashSet::new(),
            &AllReachable,
            no_fee,
        );
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].next_hop, addr(3));
    }

    #[test]
    fn test_fee_ordering() {
        let graph = diamond();
        let fee_for = |address: &Address| {
            if *address == addr(2) {
                TokenAmount::from_u64(5)
            } else {
                TokenAmount::from_u64(1)
            }
        };
        let routes = graph.available_routes(
            addr(4),
            TokenAmount::from_u64(5),
            &HashSet::new(),
            &AllReachable,
            fee_for,
        );
        assert_eq!(routes[0].next_hop, addr(3));
    }
}
