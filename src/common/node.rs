//! Struct and implementation of the entry in the Kademlia routing table
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use crate::common::Id;

#[derive(Debug, Clone)]
/// A known peer in the routing table.
pub struct RoutingEntry {
    pub(crate) id: Id,
    pub(crate) address: SocketAddr,
    pub(crate) last_seen: Instant,
    pub(crate) last_seen_utc: SystemTime,
    /// Consecutive liveness checks this peer failed to answer.
    pub(crate) failed_pings: u8,
}

impl RoutingEntry {
    /// Creates a new entry, seen just now.
    pub fn new(id: Id, address: SocketAddr) -> RoutingEntry {
        RoutingEntry {
            id,
            address,
            last_seen: Instant::now(),
            last_seen_utc: SystemTime::now(),
            failed_pings: 0,
        }
    }

    /// Creates a entry with random Id for testing purposes.
    pub fn random() -> RoutingEntry {
        RoutingEntry::new(Id::random(), SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    /// Creates an entry that was last seen `age` ago, for testing purposes.
    pub fn seen_ago(id: Id, address: SocketAddr, age: Duration) -> RoutingEntry {
        let mut entry = RoutingEntry::new(id, address);
        entry.last_seen = entry.last_seen.checked_sub(age).unwrap_or(entry.last_seen);
        entry.last_seen_utc = entry
            .last_seen_utc
            .checked_sub(age)
            .unwrap_or(entry.last_seen_utc);
        entry
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Wall clock time of the last successful exchange with this peer.
    pub fn last_seen_utc(&self) -> SystemTime {
        self.last_seen_utc
    }

    pub fn failed_pings(&self) -> u8 {
        self.failed_pings
    }

    /// Returns true if this peer wasn't heard from for longer than `stale_after`.
    pub fn is_stale(&self, stale_after: Duration) -> bool {
        self.last_seen.elapsed() > stale_after
    }

    pub(crate) fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_utc = SystemTime::now();
        self.failed_pings = 0;
    }
}

impl PartialEq for RoutingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}
