//! Answering verified inbound requests.

pub mod providers;

use std::num::NonZeroUsize;

use bytes::Bytes;
use tracing::debug;

use crate::common::{
    DhtMessage, ErrorSpecific, FindNodeRequestArguments, FindNodeResponseArguments,
    FindValueRequestArguments, FindValueResponseArguments, Id, MessageType, NodeInfo,
    RoutingTable, StoreRequestArguments,
};

pub use providers::ProvidersStore;

/// Error code for requests whose payload can not be parsed.
pub const PROTOCOL_ERROR_CODE: i64 = 203;

pub const MAX_PROVIDED_HASHES: usize = 2000;
pub const MAX_PROVIDERS_PER_HASH: usize = 200;

#[derive(Debug)]
/// Answers PING, FIND_NODE, STORE and FIND_VALUE requests from the routing table
/// and the announced providers.
pub struct Server {
    providers: ProvidersStore,
}

impl Default for Server {
    fn default() -> Self {
        Server::new(MAX_PROVIDED_HASHES, MAX_PROVIDERS_PER_HASH)
    }
}

impl Server {
    pub fn new(max_provided_hashes: usize, max_providers_per_hash: usize) -> Self {
        let max_hashes = NonZeroUsize::new(max_provided_hashes).unwrap_or(NonZeroUsize::MIN);
        let max_providers = NonZeroUsize::new(max_providers_per_hash).unwrap_or(NonZeroUsize::MIN);

        Self {
            providers: ProvidersStore::new(max_hashes, max_providers),
        }
    }

    // === Getters ===

    pub fn providers(&self) -> &ProvidersStore {
        &self.providers
    }

    // === Public Methods ===

    /// Record a provider of `hash`, from a STORE or our own announcement.
    pub fn add_provider(&mut self, hash: Id, provider: NodeInfo) {
        self.providers.add_provider(hash, provider);
    }

    pub fn get_providers(&mut self, hash: &Id) -> Vec<NodeInfo> {
        self.providers.get_random_providers(hash)
    }

    /// Handle a verified request from `requester`.
    ///
    /// Returns the response type and payload, or None for types that are ignored.
    pub fn handle_request(
        &mut self,
        routing_table: &RoutingTable,
        requester: NodeInfo,
        request: &DhtMessage,
    ) -> Option<(MessageType, Bytes)> {
        let k = routing_table.bucket_size();
        let payload = &request.payload;

        let response = match &request.message_type {
            MessageType::Ping => (MessageType::Pong, Bytes::new()),
            MessageType::FindNode => match FindNodeRequestArguments::from_payload(payload) {
                Ok(arguments) => (
                    MessageType::FindNodeResponse,
                    FindNodeResponseArguments {
                        nodes: closest_except(routing_table, &arguments.target, k, &requester.id),
                    }
                    .to_payload(),
                ),
                Err(error) => malformed(request, error),
            },
            MessageType::Store => match StoreRequestArguments::from_payload(payload) {
                // Port 0 senders don't listen, nobody could fetch from them.
                Ok(_) if requester.address.port() == 0 => {
                    debug!(
                        sender_id = %request.sender_id,
                        "Refusing STORE from a sender without a listening port"
                    );
                    protocol_error("Sender has no listening port")
                }
                Ok(arguments) => {
                    self.providers.add_provider(arguments.hash, requester);
                    (MessageType::StoreAck, Bytes::new())
                }
                Err(error) => malformed(request, error),
            },
            MessageType::FindValue => match FindValueRequestArguments::from_payload(payload) {
                Ok(arguments) => (
                    MessageType::FindValueResponse,
                    FindValueResponseArguments {
                        providers: self.providers.get_random_providers(&arguments.hash),
                        nodes: closest_except(routing_table, &arguments.hash, k, &requester.id),
                    }
                    .to_payload(),
                ),
                Err(error) => malformed(request, error),
            },
            other => {
                debug!(
                    message_type = %other,
                    sender_id = %request.sender_id,
                    "Ignoring unsupported request type"
                );
                return None;
            }
        };

        Some(response)
    }
}

/// The `count` closest nodes to `target`, never including the requester itself.
fn closest_except(
    routing_table: &RoutingTable,
    target: &Id,
    count: usize,
    requester: &Id,
) -> Vec<NodeInfo> {
    routing_table
        .find_closest(target, count + 1)
        .iter()
        .filter(|entry| entry.id() != requester)
        .take(count)
        .map(NodeInfo::from)
        .collect()
}

fn malformed(request: &DhtMessage, error: impl std::fmt::Display) -> (MessageType, Bytes) {
    debug!(
        message_type = %request.message_type,
        sender_id = %request.sender_id,
        %error,
        "Malformed request payload"
    );

    protocol_error("Malformed payload")
}

fn protocol_error(description: &str) -> (MessageType, Bytes) {
    (
        MessageType::Error,
        ErrorSpecific {
            code: PROTOCOL_ERROR_CODE,
            description: description.to_string(),
        }
        .to_payload(),
    )
}
