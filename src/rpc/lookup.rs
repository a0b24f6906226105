//! Iterative Kademlia lookups.

use std::collections::HashSet;
use std::thread;

use tracing::trace;

use crate::common::{Id, NodeInfo};

/// Number of concurrent requests per lookup round.
pub const ALPHA: usize = 3;

/// Bound on lookup rounds, far above what a converging lookup needs.
const MAX_ROUNDS: usize = 64;

#[derive(Debug, Clone)]
/// Nodes sorted by XOR distance to a target, without duplicate ids.
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<NodeInfo>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::with_capacity(64),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    // === Public Methods ===

    /// Insert a node at its distance position, returns false if its id is already present.
    pub fn add(&mut self, node: NodeInfo) -> bool {
        if self.nodes.iter().any(|known| known.id == node.id) {
            return false;
        }

        let seek = node.id.xor(&self.target);
        let position = self.nodes.partition_point(|known| known.id.xor(&self.target) < seek);

        self.nodes.insert(position, node);
        true
    }

    /// XOR distance of the closest node, if any.
    pub fn closest_distance(&self) -> Option<Id> {
        self.nodes.first().map(|node| node.id.xor(&self.target))
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn into_nodes(self) -> Vec<NodeInfo> {
        self.nodes
    }
}

/// What a queried node answered.
#[derive(Debug, Clone, Default)]
pub struct LookupResponse {
    pub nodes: Vec<NodeInfo>,
    pub providers: Vec<NodeInfo>,
}

#[derive(Debug, Clone)]
/// Result of a finished [IterativeLookup].
pub struct LookupResult {
    /// Up to K responding nodes, closest to the target first.
    pub closest: Vec<NodeInfo>,
    /// Providers reported by any responder, without duplicates.
    pub providers: Vec<NodeInfo>,
    /// Number of nodes that got a request.
    pub queried: usize,
}

/// An iterative process of concurrently querying the closest known nodes to
/// the target, learning closer nodes from their responses, and repeating
/// until the K closest nodes all have been queried.
#[derive(Debug)]
pub struct IterativeLookup {
    k: usize,
    /// Our own id, never queried nor returned.
    local_id: Id,
    candidates: ClosestNodes,
    responders: ClosestNodes,
    queried: HashSet<Id>,
    providers: Vec<NodeInfo>,
}

impl IterativeLookup {
    pub fn new(
        local_id: Id,
        target: Id,
        k: usize,
        seeds: impl IntoIterator<Item = NodeInfo>,
    ) -> Self {
        let mut lookup = Self {
            k: k.max(1),
            local_id,
            candidates: ClosestNodes::new(target),
            responders: ClosestNodes::new(target),
            queried: HashSet::new(),
            providers: Vec::new(),
        };

        for seed in seeds {
            lookup.add_candidate(seed);
        }

        lookup
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.candidates.target()
    }

    // === Public Methods ===

    /// Run the lookup, `query` sends the request to one node and returns its
    /// response, or None if it failed to answer.
    ///
    /// Requests of a round run concurrently, `query` is called from scoped threads.
    pub fn run<F>(mut self, query: F) -> LookupResult
    where
        F: Fn(&NodeInfo) -> Option<LookupResponse> + Sync,
    {
        let mut widen = false;

        for _ in 0..MAX_ROUNDS {
            let batch = self.next_batch(if widen { self.k } else { ALPHA });
            if batch.is_empty() {
                break;
            }

            let before = self.candidates.closest_distance();

            let responses: Vec<(NodeInfo, Option<LookupResponse>)> = thread::scope(|scope| {
                let query = &query;
                let handles: Vec<_> = batch
                    .into_iter()
                    .map(|node| scope.spawn(move || (node, query(&node))))
                    .collect();

                handles
                    .into_iter()
                    .filter_map(|handle| handle.join().ok())
                    .collect()
            });

            for (node, response) in responses {
                if let Some(response) = response {
                    self.add_response(node, response);
                }
            }

            // Once a round stops getting closer, ask every unqueried node of the K closest.
            widen = self.candidates.closest_distance() >= before;
        }

        trace!(
            target = %self.target(),
            queried = self.queried.len(),
            responders = self.responders.len(),
            "Lookup done"
        );

        let mut closest = self.responders.into_nodes();
        closest.truncate(self.k);

        LookupResult {
            closest,
            providers: self.providers,
            queried: self.queried.len(),
        }
    }

    /// Up to `count` unqueried nodes among the K closest candidates, marked as queried.
    fn next_batch(&mut self, count: usize) -> Vec<NodeInfo> {
        let batch: Vec<NodeInfo> = self
            .candidates
            .nodes()
            .iter()
            .take(self.k)
            .filter(|node| !self.queried.contains(&node.id))
            .take(count)
            .copied()
            .collect();

        for node in &batch {
            self.queried.insert(node.id);
        }

        batch
    }

    fn add_candidate(&mut self, node: NodeInfo) {
        if node.id != self.local_id {
            self.candidates.add(node);
        }
    }

    fn add_response(&mut self, from: NodeInfo, response: LookupResponse) {
        self.responders.add(from);

        for node in response.nodes {
            self.add_candidate(node);
        }

        for provider in response.providers {
            if !self.providers.iter().any(|known| known.id == provider.id) {
                self.providers.push(provider);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::net::SocketAddr;

    use super::*;
    use crate::common::{RoutingEntry, RoutingTable};

    fn node(id: Id) -> NodeInfo {
        NodeInfo::new(id, SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    /// Simulated network where every node knows what fits in its routing table.
    fn network(size: usize) -> HashMap<Id, RoutingTable> {
        let ids: Vec<Id> = (0..size).map(|_| Id::random()).collect();

        ids.iter()
            .map(|id| {
                let mut table = RoutingTable::new(*id);
                for other in &ids {
                    table.insert(RoutingEntry::new(*other, node(*other).address));
                }
                (*id, table)
            })
            .collect()
    }

    #[test]
    fn closest_nodes_sorted_and_unique() {
        let target = Id::random();
        let mut closest = ClosestNodes::new(target);

        let ids: Vec<Id> = (0..50).map(|_| Id::random()).collect();
        for id in &ids {
            assert!(closest.add(node(*id)));
        }
        assert!(!closest.add(node(ids[0])));

        assert_eq!(closest.len(), 50);
        for pair in closest.nodes().windows(2) {
            assert!(pair[0].id.xor(&target) < pair[1].id.xor(&target));
        }
    }

    #[test]
    fn finds_the_closest_node() {
        let network = network(200);
        let target = Id::random();

        let expected = network
            .keys()
            .min_by_key(|id| id.xor(&target))
            .copied()
            .unwrap();

        let local_id = Id::random();
        let seeds: Vec<NodeInfo> = network.keys().take(3).map(|id| node(*id)).collect();

        let result = IterativeLookup::new(local_id, target, 20, seeds).run(|queried| {
            network.get(&queried.id).map(|table| LookupResponse {
                nodes: table
                    .find_closest(&target, 20)
                    .iter()
                    .map(NodeInfo::from)
                    .collect(),
                providers: vec![],
            })
        });

        assert_eq!(result.closest[0].id, expected);
        assert!(result.closest.len() <= 20);
        for pair in result.closest.windows(2) {
            assert!(pair[0].id.xor(&target) < pair[1].id.xor(&target));
        }
        assert!(result.queried < network.len());
    }

    #[test]
    fn unresponsive_nodes_are_not_returned() {
        let target = Id::random();
        let alive = node(Id::random());
        let dead = node(Id::random());

        let result = IterativeLookup::new(Id::random(), target, 20, vec![alive, dead]).run(
            |queried| (queried.id == alive.id).then(LookupResponse::default),
        );

        assert_eq!(result.queried, 2);
        assert_eq!(result.closest.len(), 1);
        assert_eq!(result.closest[0].id, alive.id);
    }

    #[test]
    fn never_queries_itself() {
        let local_id = Id::random();
        let seed = node(Id::random());

        let result = IterativeLookup::new(local_id, Id::random(), 20, vec![seed]).run(|queried| {
            assert_ne!(queried.id, local_id);
            Some(LookupResponse {
                nodes: vec![node(local_id)],
                providers: vec![],
            })
        });

        assert_eq!(result.queried, 1);
    }

    #[test]
    fn aggregates_providers() {
        let provider = node(Id::random());
        let seeds: Vec<NodeInfo> = (0..4).map(|_| node(Id::random())).collect();

        let result = IterativeLookup::new(Id::random(), Id::random(), 20, seeds).run(|_| {
            Some(LookupResponse {
                nodes: vec![],
                providers: vec![provider],
            })
        });

        assert_eq!(result.providers, vec![provider]);
    }

    #[test]
    fn no_seeds_no_lookup() {
        let result =
            IterativeLookup::new(Id::random(), Id::random(), 20, vec![]).run(|_| unreachable!());

        assert!(result.closest.is_empty());
        assert_eq!(result.queried, 0);
    }
}
