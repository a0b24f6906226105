//! Initial peer sets to join the mesh with.

use std::fmt::Debug;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::tracker::TrackerClient;

/// Supplies candidate endpoints to ping while bootstrapping.
pub trait BootstrapProvider: Debug + Send + Sync {
    /// Candidate endpoints, possibly empty. Never fails, unavailable sources
    /// just contribute nothing.
    fn bootstrap_peers(&self) -> Vec<SocketAddr>;
}

#[derive(Debug, Clone, Default)]
/// A fixed list of `host:port` endpoints.
pub struct StaticBootstrap {
    endpoints: Vec<String>,
}

impl StaticBootstrap {
    pub fn new<T: ToString>(endpoints: &[T]) -> Self {
        Self {
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl BootstrapProvider for StaticBootstrap {
    fn bootstrap_peers(&self) -> Vec<SocketAddr> {
        to_socket_address(&self.endpoints)
    }
}

#[derive(Debug, Clone)]
/// Peers known to the tracker, falling back to a static list when the tracker
/// is unreachable or knows nobody.
pub struct TrackerBootstrap {
    tracker: Arc<dyn TrackerClient>,
    fallback: StaticBootstrap,
}

impl TrackerBootstrap {
    pub fn new(tracker: Arc<dyn TrackerClient>, fallback: StaticBootstrap) -> Self {
        Self { tracker, fallback }
    }
}

impl BootstrapProvider for TrackerBootstrap {
    fn bootstrap_peers(&self) -> Vec<SocketAddr> {
        match self.tracker.get_peers() {
            Ok(peers) if !peers.is_empty() => {
                let mut addresses: Vec<SocketAddr> = Vec::with_capacity(peers.len());
                for peer in peers {
                    if !addresses.contains(&peer.address) {
                        addresses.push(peer.address);
                    }
                }
                addresses
            }
            Ok(_) => {
                debug!("Tracker knows no peers, using static bootstrap");
                self.fallback.bootstrap_peers()
            }
            Err(error) => {
                warn!(%error, "Tracker unavailable, using static bootstrap");
                self.fallback.bootstrap_peers()
            }
        }
    }
}

/// Resolve endpoints, skipping the ones that fail to resolve.
pub(crate) fn to_socket_address<T: ToSocketAddrs + Debug>(bootstrap: &[T]) -> Vec<SocketAddr> {
    let mut addresses: Vec<SocketAddr> = Vec::new();

    for endpoint in bootstrap {
        match endpoint.to_socket_addrs() {
            Ok(resolved) => {
                for address in resolved {
                    if !addresses.contains(&address) {
                        addresses.push(address);
                    }
                }
            }
            Err(error) => debug!(?endpoint, %error, "Failed to resolve bootstrap endpoint"),
        }
    }

    addresses
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;
    use crate::common::{Id, NodeInfo};
    use crate::tracker::{Challenge, TrackerError};

    #[derive(Debug)]
    struct FixedTracker(Mutex<Result<Vec<NodeInfo>, TrackerError>>);

    impl TrackerClient for FixedTracker {
        fn ping(&self, _: &Id, _: &Id, _: usize) -> Result<(), TrackerError> {
            Ok(())
        }

        fn get_peers(&self) -> Result<Vec<NodeInfo>, TrackerError> {
            self.0.lock().unwrap().clone()
        }

        fn get_peers_for_manifest(&self, _: &Id) -> Result<Vec<NodeInfo>, TrackerError> {
            Ok(vec![])
        }

        fn check_node_exists(&self, _: &Id) -> Result<bool, TrackerError> {
            Ok(false)
        }

        fn create_challenge(&self, _: &Id) -> Result<Challenge, TrackerError> {
            Err(TrackerError::Rejected("unsupported".to_string()))
        }

        fn verify_challenge(&self, _: &Id, _: &str, _: &[u8]) -> Result<bool, TrackerError> {
            Ok(false)
        }
    }

    #[test]
    fn static_resolves_and_skips_invalid() {
        let bootstrap =
            StaticBootstrap::new(&["127.0.0.1:6881", "not an endpoint", "127.0.0.1:6881"]);

        assert_eq!(
            bootstrap.bootstrap_peers(),
            vec![SocketAddr::from(([127, 0, 0, 1], 6881))]
        );
    }

    #[test]
    fn tracker_peers_preferred() {
        let peer = NodeInfo::new(Id::random(), SocketAddr::from(([10, 0, 0, 1], 4000)));
        let tracker = Arc::new(FixedTracker(Mutex::new(Ok(vec![peer, peer]))));

        let bootstrap = TrackerBootstrap::new(tracker, StaticBootstrap::new(&["127.0.0.1:6881"]));

        assert_eq!(bootstrap.bootstrap_peers(), vec![peer.address]);
    }

    #[test]
    fn unreachable_tracker_falls_back() {
        let tracker = Arc::new(FixedTracker(Mutex::new(Err(TrackerError::Unreachable(
            "connection refused".to_string(),
        )))));

        let bootstrap = TrackerBootstrap::new(tracker, StaticBootstrap::new(&["127.0.0.1:6881"]));

        assert_eq!(
            bootstrap.bootstrap_peers(),
            vec![SocketAddr::from(([127, 0, 0, 1], 6881))]
        );
    }
}
