//! Client interface of the tracker, the central discovery and attestation service.

use std::fmt::Debug;

use crate::common::{Id, NodeInfo};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Tracker call failures, the node degrades gracefully on all of them.
pub enum TrackerError {
    #[error("No tracker configured")]
    NotConfigured,

    #[error("Tracker unreachable: {0}")]
    Unreachable(String),

    #[error("Tracker rejected the request: {0}")]
    Rejected(String),

    #[error("Invalid tracker response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A key ownership challenge issued by the tracker.
pub struct Challenge {
    pub id: String,
    /// Bytes the node must sign with its key.
    pub nonce: Vec<u8>,
}

/// Outbound calls a node makes to the tracker.
///
/// Implementations do their own I/O and must return within a bounded time,
/// they are called from the maintenance loop.
pub trait TrackerClient: Debug + Send + Sync {
    /// Report liveness and the local manifest set summary.
    fn ping(
        &self,
        node_id: &Id,
        manifest_set_hash: &Id,
        manifest_count: usize,
    ) -> Result<(), TrackerError>;

    /// Peers currently known to the tracker.
    fn get_peers(&self) -> Result<Vec<NodeInfo>, TrackerError>;

    /// Peers that announced holding the manifest `hash`.
    fn get_peers_for_manifest(&self, hash: &Id) -> Result<Vec<NodeInfo>, TrackerError>;

    fn check_node_exists(&self, node_id: &Id) -> Result<bool, TrackerError>;

    /// Ask for a challenge binding `node_id` to its previously approved public key.
    fn create_challenge(&self, node_id: &Id) -> Result<Challenge, TrackerError>;

    /// Submit the signature of a challenge nonce, returns whether it was accepted.
    fn verify_challenge(
        &self,
        node_id: &Id,
        challenge_id: &str,
        signature: &[u8],
    ) -> Result<bool, TrackerError>;
}
