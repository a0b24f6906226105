//! Routing table maintenance logic.

use std::time::Duration;

use crate::common::{Id, RoutingEntry, RoutingTable};
use crate::manifest::ManifestSummary;

/// Routing table and announcement maintenance state
#[derive(Debug, Default)]
pub struct RoutingMaintenance {
    /// Set hash of the manifests last announced with STORE.
    last_announced: Option<Id>,
}

/// Decisions about one maintenance cycle
#[derive(Debug)]
pub struct MaintenanceDecisions {
    /// Whether to populate the routing table from the bootstrap peers
    pub should_populate: bool,

    /// Stale entries to ping, least recently seen first
    pub nodes_to_ping: Vec<RoutingEntry>,
}

impl RoutingMaintenance {
    /// Create new routing maintenance tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Determine what maintenance operations should be performed.
    ///
    /// Pure function, examines the routing table and returns decisions.
    pub fn periodic_maintenance_decisions(
        &self,
        routing_table: &RoutingTable,
        stale_after: Duration,
        ping_sample_size: usize,
    ) -> MaintenanceDecisions {
        MaintenanceDecisions {
            should_populate: routing_table.is_empty(),
            nodes_to_ping: routing_table.stale_entries(stale_after, ping_sample_size),
        }
    }

    /// Whether the manifest set changed since it was last announced.
    pub fn should_announce(&self, summary: &ManifestSummary) -> bool {
        summary.count > 0 && self.last_announced != Some(summary.set_hash)
    }

    pub fn announced(&mut self, summary: &ManifestSummary) {
        self.last_announced = Some(summary.set_hash);
    }

    /// Whether a cycle that pinged `pinged` entries with `answered` answers, and
    /// ended with `table_size` entries, means we lost contact with every known peer.
    pub fn lost_all_peers(
        pinged: usize,
        answered: usize,
        had_peers: bool,
        table_size: usize,
    ) -> bool {
        (pinged > 0 && answered == 0) || (had_peers && table_size == 0)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use crate::common::{Id, RoutingEntry, RoutingTable};
    use crate::manifest::ManifestSummary;

    use super::RoutingMaintenance;

    #[test]
    fn empty_table_should_populate() {
        let maintenance = RoutingMaintenance::new();
        let routing_table = RoutingTable::new(Id::random());

        let decisions = maintenance.periodic_maintenance_decisions(
            &routing_table,
            Duration::from_secs(60),
            8,
        );

        assert!(decisions.should_populate);
        assert!(decisions.nodes_to_ping.is_empty());
    }

    #[test]
    fn pings_only_stale_entries() {
        let maintenance = RoutingMaintenance::new();
        let mut routing_table = RoutingTable::new(Id::random());
        let address = SocketAddr::from(([127, 0, 0, 1], 4000));

        let stale = RoutingEntry::seen_ago(Id::random(), address, Duration::from_secs(120));
        routing_table.insert(stale.clone());
        routing_table.insert(RoutingEntry::new(Id::random(), address));

        let decisions = maintenance.periodic_maintenance_decisions(
            &routing_table,
            Duration::from_secs(60),
            8,
        );

        assert!(!decisions.should_populate);
        assert_eq!(decisions.nodes_to_ping.len(), 1);
        assert_eq!(decisions.nodes_to_ping[0].id(), stale.id());
    }

    #[test]
    fn announces_once_per_set() {
        let mut maintenance = RoutingMaintenance::new();
        let summary = ManifestSummary::from_hashes(&[Id::random()]);

        assert!(maintenance.should_announce(&summary));
        maintenance.announced(&summary);
        assert!(!maintenance.should_announce(&summary));

        let changed = ManifestSummary::from_hashes(&[Id::random(), Id::random()]);
        assert!(maintenance.should_announce(&changed));
    }

    #[test]
    fn empty_set_is_not_announced() {
        let maintenance = RoutingMaintenance::new();

        assert!(!maintenance.should_announce(&ManifestSummary::from_hashes(&[])));
    }

    #[test]
    fn lost_all_peers() {
        assert!(RoutingMaintenance::lost_all_peers(3, 0, true, 3));
        assert!(RoutingMaintenance::lost_all_peers(0, 0, true, 0));
        assert!(!RoutingMaintenance::lost_all_peers(3, 1, true, 3));
        // A standalone node never had anyone to lose.
        assert!(!RoutingMaintenance::lost_all_peers(0, 0, false, 0));
    }
}
