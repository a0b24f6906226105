//! Dht node.

use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, RecvTimeoutError, Sender};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::bootstrap::{BootstrapProvider, StaticBootstrap, TrackerBootstrap};
use crate::common::{
    DhtMessage, FindNodeRequestArguments, FindNodeResponseArguments, FindValueRequestArguments,
    FindValueResponseArguments, Id, IdentityProvider, InsertOutcome, KeyStore, MessageError,
    MessageType, NodeIdentity, NodeInfo, RoutingEntry, RoutingTable, StoreRequestArguments,
};
use crate::core::routing_maintenance::RoutingMaintenance;
use crate::manifest::{ManifestStore, ManifestSummary};
use crate::rpc::{
    Config, InboundHandler, IterativeLookup, LookupResponse, RequestTracker, TcpTransport,
    TransportError, ALPHA,
};
use crate::server::Server;
use crate::tracker::{TrackerClient, TrackerError};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Lifecycle of a [DhtNode].
pub enum NodeState {
    /// Listening, not yet bootstrapping.
    Starting,
    /// Pinging the bootstrap candidates.
    Bootstrapping,
    Active,
    /// Lost contact with every known peer, back to [NodeState::Active] on the next
    /// successful exchange.
    Degraded,
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Starting => "starting",
            NodeState::Bootstrapping => "bootstrapping",
            NodeState::Active => "active",
            NodeState::Degraded => "degraded",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
/// Create a [DhtNode] with custom settings and collaborators.
pub struct DhtBuilder {
    config: Config,
    identity: Option<Arc<NodeIdentity>>,
    identity_provider: Option<Arc<IdentityProvider>>,
    tracker: Option<Arc<dyn TrackerClient>>,
    manifests: Option<Arc<dyn ManifestStore>>,
    bootstrap_provider: Option<Arc<dyn BootstrapProvider>>,
}

impl DhtBuilder {
    /// Replace the whole [Config].
    pub fn config(&mut self, config: Config) -> &mut Self {
        self.config = config;

        self
    }

    /// Set the static bootstrap endpoints, `host:port`.
    pub fn bootstrap<T: ToString>(&mut self, bootstrap: &[T]) -> &mut Self {
        self.config.bootstrap = bootstrap.iter().map(|s| s.to_string()).collect();

        self
    }

    /// Set the address to listen on.
    pub fn bind_address(&mut self, bind_address: IpAddr) -> &mut Self {
        self.config.bind_address = bind_address;

        self
    }

    /// Set an explicit port to listen on.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.config.port = Some(port);

        self
    }

    /// Set the request timeout, see [Config::request_timeout].
    pub fn request_timeout(&mut self, request_timeout: Duration) -> &mut Self {
        self.config.request_timeout = request_timeout;

        self
    }

    /// Set the tolerated clock skew of inbound messages.
    pub fn max_clock_skew(&mut self, max_clock_skew: Duration) -> &mut Self {
        self.config.max_clock_skew = max_clock_skew;

        self
    }

    /// Set the period of the maintenance loop.
    pub fn maintenance_interval(&mut self, maintenance_interval: Duration) -> &mut Self {
        self.config.maintenance_interval = maintenance_interval;

        self
    }

    /// Set how long an entry goes unseen before the maintenance loop pings it.
    pub fn stale_after(&mut self, stale_after: Duration) -> &mut Self {
        self.config.stale_after = stale_after;

        self
    }

    /// Set the number and spacing of bootstrap rounds.
    pub fn bootstrap_rounds(&mut self, rounds: usize, round_delay: Duration) -> &mut Self {
        self.config.bootstrap_rounds = rounds;
        self.config.bootstrap_round_delay = round_delay;

        self
    }

    /// Set how many peers are pinged at once during bootstrap and maintenance.
    pub fn ping_sample_size(&mut self, ping_sample_size: usize) -> &mut Self {
        self.config.ping_sample_size = ping_sample_size;

        self
    }

    /// Set the capacity of each routing table bucket.
    pub fn bucket_size(&mut self, bucket_size: usize) -> &mut Self {
        self.config.bucket_size = bucket_size;

        self
    }

    /// Set the grace period of inflight handlers on shutdown.
    pub fn shutdown_grace(&mut self, shutdown_grace: Duration) -> &mut Self {
        self.config.shutdown_grace = shutdown_grace;

        self
    }

    /// Use an already provisioned identity.
    pub fn identity(&mut self, identity: NodeIdentity) -> &mut Self {
        self.identity = Some(Arc::new(identity));

        self
    }

    /// Load the identity from, or persist a new one to, `key_store`.
    ///
    /// Without an identity or key store, an ephemeral identity is generated.
    pub fn key_store(&mut self, key_store: Arc<dyn KeyStore>) -> &mut Self {
        self.identity_provider = Some(Arc::new(IdentityProvider::new(key_store)));

        self
    }

    /// Report to, and discover peers from, a tracker.
    pub fn tracker(&mut self, tracker: Arc<dyn TrackerClient>) -> &mut Self {
        self.tracker = Some(tracker);

        self
    }

    /// Announce and report the manifests of this store.
    pub fn manifest_store(&mut self, manifests: Arc<dyn ManifestStore>) -> &mut Self {
        self.manifests = Some(manifests);

        self
    }

    /// Override where bootstrap candidates come from.
    ///
    /// Defaults to [TrackerBootstrap] if a tracker is set, [StaticBootstrap] otherwise.
    pub fn bootstrap_provider(&mut self, provider: Arc<dyn BootstrapProvider>) -> &mut Self {
        self.bootstrap_provider = Some(provider);

        self
    }

    /// Create a node with the given settings, listening and bootstrapping in the background.
    pub fn build(&self) -> Result<DhtNode> {
        DhtNode::new(self.clone())
    }
}

#[derive(Debug)]
/// A mangamesh DHT node.
///
/// Listens for inbound requests, bootstraps, and runs the maintenance loop
/// on background threads until [DhtNode::shutdown] or drop.
pub struct DhtNode {
    inner: Arc<Inner>,
    stop: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DhtNode {
    /// Returns a builder to edit settings before creating a node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Create a node with default settings.
    pub fn new(builder: DhtBuilder) -> Result<Self> {
        let DhtBuilder {
            config,
            identity,
            identity_provider,
            tracker,
            manifests,
            bootstrap_provider,
        } = builder;

        config.validate()?;

        let identity = match (identity, identity_provider) {
            (Some(identity), _) => identity,
            (None, Some(provider)) => provider.get()?,
            (None, None) => Arc::new(NodeIdentity::generate()),
        };

        let bootstrap: Arc<dyn BootstrapProvider> = match (bootstrap_provider, &tracker) {
            (Some(provider), _) => provider,
            (None, Some(tracker)) => Arc::new(TrackerBootstrap::new(
                tracker.clone(),
                StaticBootstrap::new(&config.bootstrap),
            )),
            (None, None) => Arc::new(StaticBootstrap::new(&config.bootstrap)),
        };

        let requests = Arc::new(RequestTracker::new());
        let transport = TcpTransport::bind(&config, requests.clone())?;

        info!(
            id = %identity.id(),
            local_addr = ?transport.local_addr(),
            "Listening"
        );

        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            routing_table: RwLock::new(RoutingTable::with_bucket_size(
                *identity.id(),
                config.bucket_size,
            )),
            server: Mutex::new(Server::new(
                config.max_provided_hashes,
                config.max_providers_per_hash,
            )),
            maintenance: Mutex::new(RoutingMaintenance::new()),
            state: Mutex::new(NodeState::Starting),
            state_changed: Condvar::new(),
            identity,
            requests,
            transport,
            tracker,
            manifests,
            bootstrap,
            config,
        });

        let handler: Weak<dyn InboundHandler> = Arc::downgrade(&inner) as Weak<Inner>;
        inner.transport.serve(handler)?;

        let (stop, stopped) = flume::bounded::<()>(1);

        let worker = thread::Builder::new()
            .name("mangamesh-maintenance".to_string())
            .spawn({
                let inner = inner.clone();
                move || inner.run(stopped)
            })?;

        Ok(DhtNode {
            inner,
            stop: Mutex::new(Some(stop)),
            worker: Mutex::new(Some(worker)),
        })
    }

    // === Getters ===

    /// This node's [Id], derived from its public key.
    pub fn id(&self) -> &Id {
        self.inner.identity.id()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    /// Address the transport is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    pub fn state(&self) -> NodeState {
        *lock(&self.inner.state)
    }

    /// Information and statistics about this node.
    pub fn info(&self) -> Info {
        self.inner.info()
    }

    /// A snapshot of the routing table.
    pub fn routing_table(&self) -> RoutingTable {
        self.inner.table_read().clone()
    }

    // === Public Methods ===

    /// Block until bootstrapping finished, returns true if the routing table
    /// has any peer.
    pub fn bootstrapped(&self) -> bool {
        let mut state = lock(&self.inner.state);

        while matches!(*state, NodeState::Starting | NodeState::Bootstrapping) {
            state = self
                .inner
                .state_changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(state);

        !self.inner.table_read().is_empty()
    }

    /// Ping `address`, returns the node that answered.
    pub fn ping(&self, address: SocketAddr) -> Result<NodeInfo, TransportError> {
        self.inner.ping(address)
    }

    /// Ask a single node for its closest nodes to `target`.
    pub fn find_node_at(
        &self,
        address: SocketAddr,
        target: Id,
    ) -> Result<Vec<NodeInfo>, TransportError> {
        self.inner.find_node_at(address, target)
    }

    /// Iterative lookup of the closest nodes to `target`, closest first.
    pub fn find_node(&self, target: Id) -> Vec<NodeInfo> {
        self.inner.find_node(target)
    }

    /// Nodes known to hold the content `hash`, from our own records, the
    /// nodes closest to `hash`, and the tracker.
    pub fn find_providers(&self, hash: Id) -> Vec<NodeInfo> {
        self.inner.find_providers(hash)
    }

    /// Announce that this node holds `hash` to the closest known nodes,
    /// returns how many acknowledged.
    pub fn announce(&self, hash: Id) -> usize {
        self.inner.announce(hash)
    }

    /// Prove to the tracker that this node owns the key its [Id] derives from.
    pub fn attest_with_tracker(&self) -> Result<bool, TrackerError> {
        let tracker = self
            .inner
            .tracker
            .as_ref()
            .ok_or(TrackerError::NotConfigured)?;
        let node_id = self.id();

        let challenge = tracker.create_challenge(node_id)?;
        let signature = self.inner.identity.sign_challenge(&challenge.nonce);

        let accepted = tracker.verify_challenge(node_id, &challenge.id, &signature)?;
        info!(accepted, "Tracker attestation");

        Ok(accepted)
    }

    /// Whether the tracker knows this node.
    pub fn registered_with_tracker(&self) -> Result<bool, TrackerError> {
        self.inner
            .tracker
            .as_ref()
            .ok_or(TrackerError::NotConfigured)?
            .check_node_exists(self.id())
    }

    /// Cancel the maintenance loop and close the listener, letting inflight
    /// handlers finish within [Config::shutdown_grace].
    pub fn shutdown(&self) {
        let Some(stop) = lock(&self.stop).take() else {
            return;
        };
        drop(stop);

        self.inner
            .transport
            .shutdown(self.inner.config.shutdown_grace);
        self.inner.requests.shutdown();

        if let Some(worker) = lock(&self.worker).take() {
            let _ = worker.join();
        }

        info!(id = %self.id(), "Node shut down");
    }
}

impl Drop for DhtNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddr,
    state: NodeState,
    routing_table_size: usize,
    pending_requests: usize,
    provided_hashes: usize,
    inbound_connections: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    pub fn state(&self) -> NodeState {
        self.state
    }
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Outbound requests waiting for their response.
    pub fn pending_requests(&self) -> usize {
        self.pending_requests
    }
    /// Content hashes with providers announced to this node.
    pub fn provided_hashes(&self) -> usize {
        self.provided_hashes
    }
    pub fn inbound_connections(&self) -> usize {
        self.inbound_connections
    }
}

#[derive(Debug)]
struct Inner {
    me: Weak<Inner>,

    identity: Arc<NodeIdentity>,
    config: Config,

    routing_table: RwLock<RoutingTable>,
    requests: Arc<RequestTracker>,
    transport: TcpTransport,
    server: Mutex<Server>,
    maintenance: Mutex<RoutingMaintenance>,

    state: Mutex<NodeState>,
    state_changed: Condvar,

    tracker: Option<Arc<dyn TrackerClient>>,
    manifests: Option<Arc<dyn ManifestStore>>,
    bootstrap: Arc<dyn BootstrapProvider>,
}

impl Inner {
    fn info(&self) -> Info {
        Info {
            id: *self.identity.id(),
            local_addr: self.transport.local_addr(),
            state: *lock(&self.state),
            routing_table_size: self.table_read().size(),
            pending_requests: self.requests.len(),
            provided_hashes: lock(&self.server).providers().len(),
            inbound_connections: self.transport.inbound_connections(),
        }
    }

    fn run(&self, stopped: Receiver<()>) {
        self.bootstrap(&stopped);

        while let Err(RecvTimeoutError::Timeout) =
            stopped.recv_timeout(self.config.maintenance_interval)
        {
            self.maintain();
        }

        debug!("Maintenance loop stopped");
    }

    // === State ===

    fn table_read(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.routing_table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn table_write(&self) -> RwLockWriteGuard<'_, RoutingTable> {
        self.routing_table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, new: NodeState) {
        let mut state = lock(&self.state);
        if *state == new {
            return;
        }

        info!(from = %*state, to = %new, "Node state changed");

        *state = new;
        self.state_changed.notify_all();
    }

    /// A successful exchange ends a degraded period.
    fn mark_contact(&self) {
        if *lock(&self.state) == NodeState::Degraded {
            self.set_state(NodeState::Active);
        }
    }

    fn port(&self) -> u16 {
        self.transport.local_addr().port()
    }

    /// Insert or refresh a node we just had a verified exchange with.
    fn observe(&self, node: NodeInfo) {
        let outcome = self.table_write().insert(RoutingEntry::from(node));

        if let InsertOutcome::Pending { challenged } = outcome {
            self.challenge(challenged);
        }
    }

    /// Ping the least recently seen entry of a full bucket in the background,
    /// evicting it for the waiting candidate if it doesn't answer.
    fn challenge(&self, challenged: RoutingEntry) {
        let Some(inner) = self.me.upgrade() else {
            return;
        };

        let spawned = thread::Builder::new()
            .name("mangamesh-challenge".to_string())
            .spawn(move || {
                let alive = inner.ping_entry(&challenged);
                let inserted = inner
                    .table_write()
                    .resolve_challenge(challenged.id(), alive);

                debug!(
                    challenged = %challenged.id(),
                    alive,
                    inserted = ?inserted.map(|entry| *entry.id()),
                    "Resolved bucket challenge"
                );
            });

        if let Err(error) = spawned {
            debug!(%error, "Failed to spawn bucket challenge");
        }
    }

    // === Requests ===

    /// Send a request, recording the responder on success.
    fn request(
        &self,
        address: SocketAddr,
        message_type: MessageType,
        payload: Bytes,
    ) -> Result<DhtMessage, TransportError> {
        let request = DhtMessage::request(&self.identity, message_type, payload, self.port());
        let response = self.transport.request(address, request)?;

        self.observe(NodeInfo::new(response.sender_id, address));
        self.mark_contact();

        Ok(response)
    }

    fn ping(&self, address: SocketAddr) -> Result<NodeInfo, TransportError> {
        let response = self.request(address, MessageType::Ping, Bytes::new())?;

        expect_type(&response, MessageType::Pong)?;

        Ok(NodeInfo::new(response.sender_id, address))
    }

    /// Returns true if the entry answered from its known address with its known id.
    fn ping_entry(&self, entry: &RoutingEntry) -> bool {
        matches!(self.ping(entry.address()), Ok(node) if node.id == *entry.id())
    }

    /// Ping all `addresses` concurrently, returns the nodes that answered.
    fn ping_all(&self, addresses: &[SocketAddr]) -> Vec<NodeInfo> {
        let own_id = *self.identity.id();

        thread::scope(|scope| {
            let handles: Vec<_> = addresses
                .iter()
                .map(|address| scope.spawn(move || self.ping(*address)))
                .collect();

            handles
                .into_iter()
                .filter_map(|handle| handle.join().ok())
                .filter_map(|result| result.ok())
                .filter(|node| node.id != own_id)
                .collect()
        })
    }

    fn find_node_at(
        &self,
        address: SocketAddr,
        target: Id,
    ) -> Result<Vec<NodeInfo>, TransportError> {
        let response = self.request(
            address,
            MessageType::FindNode,
            FindNodeRequestArguments { target }.to_payload(),
        )?;

        expect_type(&response, MessageType::FindNodeResponse)?;

        Ok(FindNodeResponseArguments::from_payload(&response.payload)?.nodes)
    }

    fn find_value_at(
        &self,
        address: SocketAddr,
        hash: Id,
    ) -> Result<FindValueResponseArguments, TransportError> {
        let response = self.request(
            address,
            MessageType::FindValue,
            FindValueRequestArguments { hash }.to_payload(),
        )?;

        expect_type(&response, MessageType::FindValueResponse)?;

        Ok(FindValueResponseArguments::from_payload(&response.payload)?)
    }

    fn store_at(&self, address: SocketAddr, hash: Id) -> Result<(), TransportError> {
        let response = self.request(
            address,
            MessageType::Store,
            StoreRequestArguments { hash }.to_payload(),
        )?;

        expect_type(&response, MessageType::StoreAck)
    }

    /// Count a failed request against a known node.
    fn record_failure(&self, node: &NodeInfo) {
        let evicted = self
            .table_write()
            .record_failure(&node.id, self.config.max_failed_pings);

        if evicted {
            debug!(id = %node.id, address = ?node.address, "Evicted unresponsive node");
        }
    }

    // === Lookups ===

    fn lookup(&self, target: Id) -> IterativeLookup {
        let seeds: Vec<NodeInfo> = self
            .table_read()
            .closest(&target)
            .iter()
            .map(NodeInfo::from)
            .collect();

        IterativeLookup::new(*self.identity.id(), target, self.config.bucket_size, seeds)
    }

    fn find_node(&self, target: Id) -> Vec<NodeInfo> {
        self.lookup(target)
            .run(|node| match self.find_node_at(node.address, target) {
                Ok(nodes) => Some(LookupResponse {
                    nodes,
                    providers: Vec::new(),
                }),
                Err(error) => {
                    debug!(id = %node.id, %error, "find_node failed");
                    self.record_failure(node);
                    None
                }
            })
            .closest
    }

    fn find_providers(&self, hash: Id) -> Vec<NodeInfo> {
        let mut providers = lock(&self.server).get_providers(&hash);

        let result = self
            .lookup(hash)
            .run(|node| match self.find_value_at(node.address, hash) {
                Ok(response) => Some(LookupResponse {
                    nodes: response.nodes,
                    providers: response.providers,
                }),
                Err(error) => {
                    debug!(id = %node.id, %error, "find_value failed");
                    self.record_failure(node);
                    None
                }
            });

        let mut found = result.providers;

        if let Some(tracker) = &self.tracker {
            match tracker.get_peers_for_manifest(&hash) {
                Ok(peers) => found.extend(peers),
                Err(error) => warn!(%error, %hash, "Tracker unavailable, skipping manifest peers"),
            }
        }

        for provider in found {
            if !providers.iter().any(|known| known.id == provider.id) {
                providers.push(provider);
            }
        }

        providers
    }

    fn announce(&self, hash: Id) -> usize {
        let targets: Vec<NodeInfo> = self
            .table_read()
            .find_closest(&hash, ALPHA)
            .iter()
            .map(NodeInfo::from)
            .collect();

        thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|node| scope.spawn(move || (node, self.store_at(node.address, hash))))
                .collect();

            handles
                .into_iter()
                .filter_map(|handle| handle.join().ok())
                .filter(|(node, result)| match result {
                    Ok(()) => true,
                    Err(error) => {
                        debug!(id = %node.id, %error, %hash, "store failed");
                        false
                    }
                })
                .count()
        })
    }

    // === Bootstrap and maintenance ===

    /// A random sample of at most `ping_sample_size` bootstrap candidates.
    fn bootstrap_candidates(&self) -> Vec<SocketAddr> {
        let mut candidates = self.bootstrap.bootstrap_peers();

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.config.ping_sample_size);

        candidates
    }

    /// Ping the bootstrap candidates until one answers or the rounds run out,
    /// then go [NodeState::Active] either way.
    fn bootstrap(&self, stopped: &Receiver<()>) {
        self.set_state(NodeState::Bootstrapping);

        let rounds = self.config.bootstrap_rounds.max(1);
        let mut joined = false;

        for round in 1..=rounds {
            let candidates = self.bootstrap_candidates();
            if candidates.is_empty() {
                debug!("No bootstrap candidates");
                break;
            }

            let responders = self.ping_all(&candidates);
            debug!(
                round,
                candidates = candidates.len(),
                responders = responders.len(),
                "Bootstrap round"
            );

            if !responders.is_empty() {
                joined = true;
                break;
            }

            if round < rounds
                && !matches!(
                    stopped.recv_timeout(self.config.bootstrap_round_delay),
                    Err(RecvTimeoutError::Timeout)
                )
            {
                break;
            }
        }

        if joined {
            // Fill the table beyond the bootstrap peers.
            self.find_node(*self.identity.id());

            info!(
                routing_table_size = self.table_read().size(),
                "Bootstrapped"
            );
        } else {
            info!("No bootstrap peer responded, running standalone");
        }

        self.set_state(NodeState::Active);
    }

    fn maintain(&self) {
        let decisions = {
            let routing_table = self.table_read();

            lock(&self.maintenance).periodic_maintenance_decisions(
                &routing_table,
                self.config.stale_after,
                self.config.ping_sample_size,
            )
        };
        let had_peers = !decisions.should_populate;

        // Refresh stale entries, evicting the ones that keep failing.
        let pinged = decisions.nodes_to_ping.len();
        let answered = thread::scope(|scope| {
            let handles: Vec<_> = decisions
                .nodes_to_ping
                .iter()
                .map(|entry| scope.spawn(move || (entry, self.ping_entry(entry))))
                .collect();

            let mut answered = 0;
            for (entry, alive) in handles.into_iter().filter_map(|handle| handle.join().ok()) {
                if alive {
                    answered += 1;
                } else {
                    self.record_failure(&NodeInfo::from(entry));
                }
            }
            answered
        });

        let table_size = self.table_read().size();
        if RoutingMaintenance::lost_all_peers(pinged, answered, had_peers, table_size)
            && *lock(&self.state) == NodeState::Active
        {
            warn!(pinged, "Lost contact with all known peers");
            self.set_state(NodeState::Degraded);
        }

        let hashes = self.manifest_hashes();
        let summary = hashes
            .as_ref()
            .map(|hashes| ManifestSummary::from_hashes(hashes.iter()));

        if let Some(tracker) = &self.tracker {
            if let Some(summary) = &summary {
                let reported = tracker.ping(self.identity.id(), &summary.set_hash, summary.count);
                if let Err(error) = reported {
                    warn!(%error, "Tracker unreachable, skipping report until next cycle");
                }
            }

            self.ping_tracker_peers(tracker.as_ref());
        }

        if self.table_read().is_empty() {
            let candidates = self.bootstrap_candidates();

            if !candidates.is_empty() && !self.ping_all(&candidates).is_empty() {
                self.find_node(*self.identity.id());
            }
        }

        if let (Some(hashes), Some(summary)) = (hashes, summary) {
            self.announce_manifests(&hashes, &summary);
        }
    }

    /// Local manifest hashes, None if the store failed this cycle.
    fn manifest_hashes(&self) -> Option<Vec<Id>> {
        let Some(manifests) = &self.manifests else {
            return Some(Vec::new());
        };

        match manifests.manifest_hashes() {
            Ok(hashes) => Some(hashes),
            Err(error) => {
                warn!(%error, "Manifest store unavailable, skipping manifest report");
                None
            }
        }
    }

    /// Feed peers announced to the tracker into the routing table.
    fn ping_tracker_peers(&self, tracker: &dyn TrackerClient) {
        let peers = match tracker.get_peers() {
            Ok(peers) => peers,
            Err(error) => {
                warn!(%error, "Tracker unreachable, skipping peer discovery");
                return;
            }
        };

        let candidates: Vec<SocketAddr> = {
            let routing_table = self.table_read();

            peers
                .iter()
                .filter(|peer| peer.id != *self.identity.id() && !routing_table.contains(&peer.id))
                .take(self.config.ping_sample_size)
                .map(|peer| peer.address)
                .collect()
        };

        if !candidates.is_empty() {
            let responders = self.ping_all(&candidates);
            debug!(
                candidates = candidates.len(),
                responders = responders.len(),
                "Pinged tracker peers"
            );
        }
    }

    /// STORE a batch of local hashes when the manifest set changed.
    fn announce_manifests(&self, hashes: &[Id], summary: &ManifestSummary) {
        if !lock(&self.maintenance).should_announce(summary) || self.table_read().is_empty() {
            return;
        }

        let acknowledged: usize = hashes
            .iter()
            .take(self.config.announce_batch)
            .map(|hash| self.announce(*hash))
            .sum();

        debug!(
            count = summary.count,
            set_hash = %summary.set_hash,
            acknowledged,
            "Announced manifests"
        );

        lock(&self.maintenance).announced(summary);
    }
}

impl InboundHandler for Inner {
    fn handle_request(&self, from: SocketAddr, request: DhtMessage) -> Option<DhtMessage> {
        // Trust the observed IP, only the port comes from the sender.
        let requester = NodeInfo::new(
            request.sender_id,
            SocketAddr::new(from.ip(), request.sender_port),
        );

        if request.message_type.is_request() && request.sender_port != 0 {
            self.observe(requester);
            self.mark_contact();
        }

        let (message_type, payload) = {
            let routing_table = self.table_read();
            lock(&self.server).handle_request(&routing_table, requester, &request)?
        };

        Some(DhtMessage::response_to(
            &self.identity,
            &request,
            message_type,
            payload,
            self.port(),
        ))
    }
}

fn expect_type(response: &DhtMessage, expected: MessageType) -> Result<(), TransportError> {
    if response.message_type != expected {
        return Err(MessageError::UnexpectedType(response.message_type.clone()).into());
    }

    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::*;
    use crate::common::MemoryKeyStore;
    use crate::Error;

    fn loopback() -> DhtBuilder {
        let mut builder = DhtNode::builder();
        builder
            .bind_address("127.0.0.1".parse().unwrap())
            .request_timeout(Duration::from_millis(500))
            .bootstrap_rounds(1, Duration::from_millis(10));
        builder
    }

    #[test]
    fn shutdown() {
        let node = Arc::new(loopback().build().unwrap());

        let clone = node.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));

            clone.shutdown();
        });

        handle.join().unwrap();
        node.shutdown();

        assert!(node.ping(node.local_addr()).is_err());
    }

    #[test]
    fn standalone_when_nobody_answers() {
        let unreachable = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();

        let node = loopback()
            .bootstrap(&[unreachable.to_string()])
            .build()
            .unwrap();

        assert!(!node.bootstrapped());
        assert_eq!(node.state(), NodeState::Active);
        assert_eq!(node.info().routing_table_size(), 0);
    }

    #[test]
    fn invalid_config_fails_startup() {
        let result = loopback()
            .request_timeout(Duration::ZERO)
            .build();

        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn identity_from_key_store() {
        let stored = NodeIdentity::generate();
        let key_store = Arc::new(MemoryKeyStore::with_keypair(stored.to_stored()));

        let node = loopback().key_store(key_store.clone()).build().unwrap();

        assert_eq!(node.id(), stored.id());
        assert_eq!(key_store.saves(), 0);
    }

    #[test]
    fn ping_self_is_not_inserted() {
        let node = loopback().build().unwrap();
        node.bootstrapped();

        let address = SocketAddr::from(([127, 0, 0, 1], node.local_addr().port()));
        let pong = node.ping(address).unwrap();

        assert_eq!(pong.id, *node.id());
        assert!(node.routing_table().is_empty());
    }

    #[test]
    fn info() {
        let start = Instant::now();
        let node = loopback().build().unwrap();
        node.bootstrapped();

        let info = node.info();

        assert_eq!(info.id(), node.id());
        assert_eq!(info.local_addr(), node.local_addr());
        assert_eq!(info.state(), NodeState::Active);
        assert_eq!(info.pending_requests(), 0);
        assert_eq!(info.provided_hashes(), 0);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
