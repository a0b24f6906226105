//! Kademlia routing table with liveness checked eviction

use std::collections::BTreeMap;
use std::slice::Iter;
use std::time::{Duration, Instant};

use crate::common::{Id, RoutingEntry};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

/// The result of [RoutingTable::insert].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The entry was appended to a bucket with room.
    Added,
    /// The entry was already known, its liveness and address were refreshed.
    Updated,
    /// The entry was not inserted: it is our own Id, or its bucket is full
    /// and already waiting on a liveness check.
    Rejected,
    /// The bucket is full. `challenged` is its least recently seen entry, which
    /// must be pinged, then the result reported with [RoutingTable::resolve_challenge].
    Pending { challenged: RoutingEntry },
}

#[derive(Debug, Clone)]
/// Kademlia routing table, bucketed by the bit length of the XOR distance to our own [Id].
pub struct RoutingTable {
    id: Id,
    k: usize,
    buckets: BTreeMap<u16, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id and the default bucket size.
    pub fn new(id: Id) -> Self {
        Self::with_bucket_size(id, MAX_BUCKET_SIZE_K)
    }

    /// Create a new [RoutingTable] whose buckets hold at most `k` entries.
    pub fn with_bucket_size(id: Id, k: usize) -> Self {
        RoutingTable {
            id,
            k: k.max(1),
            buckets: BTreeMap::new(),
        }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Maximum number of entries per bucket.
    pub fn bucket_size(&self) -> usize {
        self.k
    }

    // === Public Methods ===

    /// Insert or refresh an entry.
    ///
    /// A full bucket never grows: the caller gets a [InsertOutcome::Pending] and
    /// has to check the liveness of the least recently seen entry first.
    pub fn insert(&mut self, entry: RoutingEntry) -> InsertOutcome {
        let distance = self.id.distance(entry.id());

        if distance == 0 {
            // Do not add self to the routing_table
            return InsertOutcome::Rejected;
        }

        let k = self.k;
        let bucket = self
            .buckets
            .entry(distance)
            .or_insert_with(|| KBucket::new(k));

        bucket.insert(entry)
    }

    /// Report the result of pinging the `challenged` entry of a full bucket.
    ///
    /// If it answered, it is refreshed and the waiting candidate dropped,
    /// otherwise it is evicted in favor of the candidate.
    /// Returns the candidate if it got inserted.
    pub fn resolve_challenge(&mut self, challenged: &Id, alive: bool) -> Option<RoutingEntry> {
        let distance = self.id.distance(challenged);

        self.buckets
            .get_mut(&distance)
            .and_then(|bucket| bucket.resolve_challenge(challenged, alive))
    }

    /// Refresh the liveness of a known entry, returns false if it is unknown.
    pub fn touch(&mut self, node_id: &Id) -> bool {
        let distance = self.id.distance(node_id);

        self.buckets
            .get_mut(&distance)
            .map(|bucket| bucket.touch(node_id))
            .unwrap_or(false)
    }

    /// Count a failed liveness check against an entry, evicting it once it
    /// failed `max_failures` times in a row. Returns true if it got evicted.
    pub fn record_failure(&mut self, node_id: &Id, max_failures: u8) -> bool {
        let distance = self.id.distance(node_id);

        let Some(bucket) = self.buckets.get_mut(&distance) else {
            return false;
        };

        let Some(index) = bucket.position(node_id) else {
            return false;
        };

        let entry = &mut bucket.nodes[index];
        entry.failed_pings = entry.failed_pings.saturating_add(1);

        if entry.failed_pings >= max_failures {
            bucket.nodes.remove(index);
            return true;
        }

        false
    }

    /// Remove an entry from this routing table. Removing an unknown Id is a noop.
    pub fn remove(&mut self, node_id: &Id) {
        let distance = self.id.distance(node_id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.remove(node_id)
        }
    }

    /// Return up to `count` entries sorted by ascending XOR distance to `target`,
    /// ties broken by the most recently seen first.
    pub fn find_closest(&self, target: &Id, count: usize) -> Vec<RoutingEntry> {
        let mut closest: Vec<(Id, &RoutingEntry)> = self
            .nodes()
            .map(|entry| (entry.id().xor(target), entry))
            .collect();

        closest.sort_by(|(a_distance, a), (b_distance, b)| {
            a_distance
                .cmp(b_distance)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });

        closest
            .into_iter()
            .take(count)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Return the `k` closest entries to the target, `k` being the bucket size.
    pub fn closest(&self, target: &Id) -> Vec<RoutingEntry> {
        self.find_closest(target, self.k)
    }

    /// Entries not heard from for longer than `stale_after`, least recently seen first.
    pub fn stale_entries(&self, stale_after: Duration, limit: usize) -> Vec<RoutingEntry> {
        let mut stale: Vec<&RoutingEntry> = self
            .nodes()
            .filter(|entry| entry.is_stale(stale_after))
            .collect();

        stale.sort_by_key(|entry| entry.last_seen);

        stale.into_iter().take(limit).cloned().collect()
    }

    pub fn get(&self, node_id: &Id) -> Option<&RoutingEntry> {
        let distance = self.id.distance(node_id);

        self.buckets
            .get(&distance)
            .and_then(|bucket| bucket.iter().find(|entry| entry.id() == node_id))
    }

    pub fn contains(&self, node_id: &Id) -> bool {
        self.get(node_id).is_some()
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of nodes in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.nodes.len())
    }

    /// Returns an iterator over the nodes in this routing table, closest buckets first.
    pub fn nodes(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.buckets.values().flat_map(|bucket| bucket.iter())
    }

    /// Export an owned vector of nodes from this routing table.
    pub fn to_owned_nodes(&self) -> Vec<RoutingEntry> {
        self.nodes().cloned().collect()
    }
}

/// A candidate waiting for the liveness check of the least recently seen entry
/// of a full bucket.
#[derive(Debug, Clone)]
struct PendingInsertion {
    candidate: RoutingEntry,
    challenged: Id,
    challenged_at: Instant,
}

/// How long a liveness challenge may stay unresolved before another one can replace it.
const CHALLENGE_EXPIRY: Duration = Duration::from_secs(30);

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Nodes in the k-bucket, sorted by the least recently seen.
    nodes: Vec<RoutingEntry>,
    capacity: usize,
    pending: Option<PendingInsertion>,
}

impl KBucket {
    pub fn new(capacity: usize) -> Self {
        KBucket {
            nodes: Vec::with_capacity(capacity),
            capacity,
            pending: None,
        }
    }

    // === Public Methods ===

    pub fn insert(&mut self, mut incoming: RoutingEntry) -> InsertOutcome {
        if let Some(index) = self.position(incoming.id()) {
            // Same Id proved ownership of the key, so accept a new address,
            // and move it to the end of the bucket as the most recently seen.
            self.nodes.remove(index);
            incoming.touch();
            self.nodes.push(incoming);

            return InsertOutcome::Updated;
        }

        if self.nodes.len() < self.capacity {
            self.nodes.push(incoming);

            return InsertOutcome::Added;
        }

        if let Some(pending) = &self.pending {
            if pending.challenged_at.elapsed() < CHALLENGE_EXPIRY {
                return InsertOutcome::Rejected;
            }
        }

        let challenged = self.nodes[0].clone();

        self.pending = Some(PendingInsertion {
            candidate: incoming,
            challenged: challenged.id,
            challenged_at: Instant::now(),
        });

        InsertOutcome::Pending { challenged }
    }

    fn resolve_challenge(&mut self, challenged: &Id, alive: bool) -> Option<RoutingEntry> {
        match &self.pending {
            Some(pending) if &pending.challenged == challenged => {}
            _ => return None,
        }

        let pending = self.pending.take()?;

        if alive {
            self.touch(challenged);
            return None;
        }

        self.remove(challenged);

        if self.nodes.len() < self.capacity && self.position(pending.candidate.id()).is_none() {
            self.nodes.push(pending.candidate.clone());
            return Some(pending.candidate);
        }

        None
    }

    fn touch(&mut self, node_id: &Id) -> bool {
        let Some(index) = self.position(node_id) else {
            return false;
        };

        let mut entry = self.nodes.remove(index);
        entry.touch();
        self.nodes.push(entry);

        true
    }

    pub fn remove(&mut self, node_id: &Id) {
        self.nodes.retain(|node| node.id() != node_id);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, RoutingEntry> {
        self.nodes.iter()
    }

    fn position(&self, node_id: &Id) -> Option<usize> {
        self.nodes.iter().position(|n| n.id() == node_id)
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new(MAX_BUCKET_SIZE_K)
    }
}
