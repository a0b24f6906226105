//! Serialize, sign and verify DHT messages.
//!
//! Every message is a bencoded dictionary framed by the transport. The signature
//! covers the message type, payload, timestamp and request id, under the sender's
//! ed25519 key, which travels with the message so the receiver can check it
//! hashes to the claimed sender [Id].

mod internal;

use std::fmt::{self, Debug, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};

use crate::common::{verify, Id, NodeIdentity, RoutingEntry};

use internal::{WireError, WireMessage, WireNode, WireNodes, WireProviders, WireTarget};

/// Domain tag of the signable encoding, bump when the signed fields change.
const SIGNATURE_DOMAIN: &[u8] = b"mangamesh-dht/v1";

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
/// 128-bit identifier correlating a request with its response.
pub struct RequestId([u8; 16]);

impl RequestId {
    pub fn random() -> Self {
        RequestId(rand::thread_rng().gen())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for RequestId {
    fn from(bytes: [u8; 16]) -> Self {
        RequestId(bytes)
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    Pong,
    FindNode,
    FindNodeResponse,
    Store,
    StoreAck,
    FindValue,
    FindValueResponse,
    Error,
    /// A type this node doesn't understand, kept verbatim so its signature can be checked.
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::FindNode => "find_node",
            MessageType::FindNodeResponse => "find_node_response",
            MessageType::Store => "store",
            MessageType::StoreAck => "store_ack",
            MessageType::FindValue => "find_value",
            MessageType::FindValueResponse => "find_value_response",
            MessageType::Error => "error",
            MessageType::Unknown(other) => other,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "find_node" => MessageType::FindNode,
            "find_node_response" => MessageType::FindNodeResponse,
            "store" => MessageType::Store,
            "store_ack" => MessageType::StoreAck,
            "find_value" => MessageType::FindValue,
            "find_value_response" => MessageType::FindValueResponse,
            "error" => MessageType::Error,
            other => MessageType::Unknown(other.to_string()),
        }
    }

    /// Returns true for types that expect a correlated response.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            MessageType::Ping | MessageType::FindNode | MessageType::Store | MessageType::FindValue
        )
    }

    /// Returns true for types that answer a request.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            MessageType::Pong
                | MessageType::FindNodeResponse
                | MessageType::StoreAck
                | MessageType::FindValueResponse
                | MessageType::Error
        )
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq)]
/// The wire unit exchanged between nodes.
pub struct DhtMessage {
    pub message_type: MessageType,
    pub sender_id: Id,
    pub sender_public_key: [u8; 32],
    pub payload: Bytes,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub request_id: RequestId,
    pub signature: [u8; 64],
    /// The sender's listening port, its IP is taken from the connection.
    pub sender_port: u16,
}

impl DhtMessage {
    /// Create and sign a message with an explicit request id.
    pub fn new_signed(
        identity: &NodeIdentity,
        message_type: MessageType,
        payload: Bytes,
        request_id: RequestId,
        sender_port: u16,
    ) -> Self {
        let timestamp = now_millis();
        let signable = encode_signable(message_type.as_str(), &payload, timestamp, &request_id);

        Self {
            sender_id: *identity.id(),
            sender_public_key: identity.public_key(),
            signature: identity.sign(&signable),
            message_type,
            payload,
            timestamp,
            request_id,
            sender_port,
        }
    }

    /// Create a signed request with a fresh random request id.
    pub fn request(
        identity: &NodeIdentity,
        message_type: MessageType,
        payload: Bytes,
        sender_port: u16,
    ) -> Self {
        Self::new_signed(
            identity,
            message_type,
            payload,
            RequestId::random(),
            sender_port,
        )
    }

    /// Create a signed response correlated to `request`.
    pub fn response_to(
        identity: &NodeIdentity,
        request: &DhtMessage,
        message_type: MessageType,
        payload: Bytes,
        sender_port: u16,
    ) -> Self {
        Self::new_signed(
            identity,
            message_type,
            payload,
            request.request_id,
            sender_port,
        )
    }

    /// The deterministic encoding the signature is computed over.
    pub fn signable(&self) -> Vec<u8> {
        encode_signable(
            self.message_type.as_str(),
            &self.payload,
            self.timestamp,
            &self.request_id,
        )
    }

    /// Verify the sender binding, timestamp and signature of this message.
    pub fn verify(&self, max_clock_skew: Duration) -> Result<(), RejectReason> {
        self.verify_at(now_millis(), max_clock_skew)
    }

    pub(crate) fn verify_at(&self, now: u64, max_clock_skew: Duration) -> Result<(), RejectReason> {
        if Id::from_public_key(&self.sender_public_key) != self.sender_id {
            return Err(RejectReason::NodeIdMismatch);
        }

        let skew = now.abs_diff(self.timestamp);
        if u128::from(skew) > max_clock_skew.as_millis() {
            return Err(RejectReason::StaleTimestamp { skew_ms: skew });
        }

        if !verify(&self.signable(), &self.signature, &self.sender_public_key) {
            return Err(RejectReason::BadSignature);
        }

        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<DhtMessage, MessageError> {
        let wire = WireMessage::from_bytes(bytes)?;

        Ok(DhtMessage {
            message_type: MessageType::parse(&wire.message_type),
            sender_id: Id::from(wire.sender_id),
            sender_public_key: wire.public_key,
            payload: Bytes::from(wire.payload),
            timestamp: wire.timestamp,
            request_id: RequestId(wire.request_id),
            signature: wire.signature,
            sender_port: wire.sender_port,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        let wire = WireMessage {
            message_type: self.message_type.as_str().to_string(),
            sender_id: (*self.sender_id.as_bytes()),
            public_key: self.sender_public_key,
            payload: self.payload.to_vec(),
            timestamp: self.timestamp,
            request_id: self.request_id.0,
            signature: self.signature,
            sender_port: self.sender_port,
        };

        Ok(wire.to_bytes()?)
    }
}

impl Debug for DhtMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtMessage")
            .field("message_type", &self.message_type)
            .field("sender_id", &self.sender_id)
            .field("request_id", &self.request_id)
            .field("timestamp", &self.timestamp)
            .field("sender_port", &self.sender_port)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Encode the signed fields of a message, prefixed with a domain tag.
pub fn encode_signable(
    message_type: &str,
    payload: &[u8],
    timestamp: u64,
    request_id: &RequestId,
) -> Vec<u8> {
    let mut signable = Vec::with_capacity(64 + payload.len());

    signable.extend(SIGNATURE_DOMAIN);
    signable.extend(format!("1:y{}:{}", message_type.len(), message_type).into_bytes());
    signable.extend(format!("1:p{}:", payload.len()).into_bytes());
    signable.extend(payload);
    signable.extend(format!("2:tsi{}e", timestamp).into_bytes());
    signable.extend(b"1:r16:");
    signable.extend(request_id.as_bytes());

    signable
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Why an inbound message was dropped before dispatch.
pub enum RejectReason {
    #[error("sender id is not the hash of the sender public key")]
    NodeIdMismatch,

    #[error("timestamp is {skew_ms}ms away from our clock")]
    StaleTimestamp { skew_ms: u64 },

    #[error("invalid signature")]
    BadSignature,
}

#[derive(thiserror::Error, Debug)]
/// Errors decoding messages or their payloads.
pub enum MessageError {
    #[error("Failed to parse bencode: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("Invalid node address: {0}")]
    InvalidAddress(String),

    #[error("Unexpected message type {0}")]
    UnexpectedType(MessageType),
}

// === Payloads ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A peer as advertised in responses.
pub struct NodeInfo {
    pub id: Id,
    pub address: SocketAddr,
}

impl NodeInfo {
    pub fn new(id: Id, address: SocketAddr) -> Self {
        Self { id, address }
    }

    fn to_wire(self) -> WireNode {
        WireNode {
            id: *self.id.as_bytes(),
            ip: self.address.ip().to_string(),
            port: self.address.port(),
        }
    }

    fn from_wire(wire: WireNode) -> Result<Self, MessageError> {
        let ip: IpAddr = wire
            .ip
            .parse()
            .map_err(|_| MessageError::InvalidAddress(wire.ip.clone()))?;

        Ok(Self {
            id: Id::from(wire.id),
            address: SocketAddr::new(ip, wire.port),
        })
    }
}

impl From<&RoutingEntry> for NodeInfo {
    fn from(entry: &RoutingEntry) -> Self {
        NodeInfo::new(*entry.id(), entry.address())
    }
}

impl From<NodeInfo> for RoutingEntry {
    fn from(info: NodeInfo) -> Self {
        RoutingEntry::new(info.id, info.address)
    }
}

fn encode<T: Serialize>(value: &T) -> Bytes {
    // Serializing these plain structs to bencode can not fail.
    serde_bencode::to_bytes(value)
        .map(Bytes::from)
        .unwrap_or_default()
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, MessageError> {
    Ok(serde_bencode::from_bytes(payload)?)
}

fn nodes_from_wire(nodes: Vec<WireNode>) -> Result<Vec<NodeInfo>, MessageError> {
    nodes.into_iter().map(NodeInfo::from_wire).collect()
}

fn nodes_to_wire(nodes: &[NodeInfo]) -> Vec<WireNode> {
    nodes.iter().map(|node| node.to_wire()).collect()
}

// === FIND_NODE ===
#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

impl FindNodeRequestArguments {
    pub fn to_payload(&self) -> Bytes {
        encode(&WireTarget {
            target: *self.target.as_bytes(),
        })
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, MessageError> {
        let wire: WireTarget = decode(payload)?;
        Ok(Self {
            target: Id::from(wire.target),
        })
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponseArguments {
    pub nodes: Vec<NodeInfo>,
}

impl FindNodeResponseArguments {
    pub fn to_payload(&self) -> Bytes {
        encode(&WireNodes {
            nodes: nodes_to_wire(&self.nodes),
        })
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, MessageError> {
        let wire: WireNodes = decode(payload)?;
        Ok(Self {
            nodes: nodes_from_wire(wire.nodes)?,
        })
    }
}

// === STORE ===
#[derive(Debug, PartialEq, Clone)]
/// Announce that the sender holds the content with this hash.
pub struct StoreRequestArguments {
    pub hash: Id,
}

impl StoreRequestArguments {
    pub fn to_payload(&self) -> Bytes {
        encode(&WireTarget {
            target: *self.hash.as_bytes(),
        })
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, MessageError> {
        let wire: WireTarget = decode(payload)?;
        Ok(Self {
            hash: Id::from(wire.target),
        })
    }
}

// === FIND_VALUE ===
#[derive(Debug, PartialEq, Clone)]
pub struct FindValueRequestArguments {
    pub hash: Id,
}

impl FindValueRequestArguments {
    pub fn to_payload(&self) -> Bytes {
        encode(&WireTarget {
            target: *self.hash.as_bytes(),
        })
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, MessageError> {
        let wire: WireTarget = decode(payload)?;
        Ok(Self {
            hash: Id::from(wire.target),
        })
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueResponseArguments {
    /// Known holders of the requested hash.
    pub providers: Vec<NodeInfo>,
    /// Closest nodes to the requested hash, to continue the lookup.
    pub nodes: Vec<NodeInfo>,
}

impl FindValueResponseArguments {
    pub fn to_payload(&self) -> Bytes {
        encode(&WireProviders {
            providers: nodes_to_wire(&self.providers),
            nodes: nodes_to_wire(&self.nodes),
        })
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, MessageError> {
        let wire: WireProviders = decode(payload)?;
        Ok(Self {
            providers: nodes_from_wire(wire.providers)?,
            nodes: nodes_from_wire(wire.nodes)?,
        })
    }
}

// === ERROR ===
#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i64,
    pub description: String,
}

impl ErrorSpecific {
    pub fn to_payload(&self) -> Bytes {
        encode(&WireError {
            code: self.code,
            description: self.description.clone(),
        })
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, MessageError> {
        let wire: WireError = decode(payload)?;
        Ok(Self {
            code: wire.code,
            description: wire.description,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_ping(identity: &NodeIdentity) -> DhtMessage {
        DhtMessage::request(identity, MessageType::Ping, Bytes::new(), 6881)
    }

    #[test]
    fn signable_layout() {
        let request_id = RequestId::from([7; 16]);
        let signable = encode_signable("ping", b"abc", 42, &request_id);

        let mut expected = b"mangamesh-dht/v11:y4:ping1:p3:abc2:tsi42e1:r16:".to_vec();
        expected.extend([7; 16]);

        assert_eq!(signable, expected);
    }

    #[test]
    fn wire_round_trip_preserves_signature() {
        let identity = NodeIdentity::generate();
        let message = DhtMessage::request(
            &identity,
            MessageType::FindNode,
            FindNodeRequestArguments {
                target: Id::random(),
            }
            .to_payload(),
            4000,
        );

        let decoded = DhtMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, message);
        assert!(decoded.verify(Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn verify_rejects_any_mutated_field() {
        let identity = NodeIdentity::generate();
        let skew = Duration::from_secs(60);

        let message = DhtMessage::request(
            &identity,
            MessageType::Store,
            StoreRequestArguments { hash: Id::random() }.to_payload(),
            4000,
        );
        assert!(message.verify(skew).is_ok());

        let mut mutated = message.clone();
        mutated.message_type = MessageType::FindValue;
        assert_eq!(mutated.verify(skew), Err(RejectReason::BadSignature));

        let mut mutated = message.clone();
        mutated.payload = StoreRequestArguments { hash: Id::random() }.to_payload();
        assert_eq!(mutated.verify(skew), Err(RejectReason::BadSignature));

        let mut mutated = message.clone();
        mutated.timestamp -= 1;
        assert_eq!(mutated.verify(skew), Err(RejectReason::BadSignature));

        let mut mutated = message.clone();
        mutated.request_id = RequestId::random();
        assert_eq!(mutated.verify(skew), Err(RejectReason::BadSignature));

        let mut mutated = message.clone();
        mutated.signature[0] ^= 1;
        assert_eq!(mutated.verify(skew), Err(RejectReason::BadSignature));
    }

    #[test]
    fn verify_rejects_borrowed_identity() {
        let identity = NodeIdentity::generate();
        let impostor = NodeIdentity::generate();

        let mut message = signed_ping(&impostor);
        message.sender_id = *identity.id();

        assert_eq!(
            message.verify(Duration::from_secs(60)),
            Err(RejectReason::NodeIdMismatch)
        );
    }

    #[test]
    fn clock_skew_window() {
        let identity = NodeIdentity::generate();
        let message = signed_ping(&identity);
        let skew = Duration::from_secs(30);

        let within = message.timestamp + 29_000;
        assert!(message.verify_at(within, skew).is_ok());

        let before = message.timestamp - 29_000;
        assert!(message.verify_at(before, skew).is_ok());

        let beyond = message.timestamp + 31_000;
        assert_eq!(
            message.verify_at(beyond, skew),
            Err(RejectReason::StaleTimestamp { skew_ms: 31_000 })
        );
    }

    #[test]
    fn unknown_types_survive_decoding() {
        let identity = NodeIdentity::generate();
        let message = DhtMessage::request(
            &identity,
            MessageType::Unknown("gossip".to_string()),
            Bytes::from_static(b"hi"),
            1,
        );

        let decoded = DhtMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();

        assert_eq!(
            decoded.message_type,
            MessageType::Unknown("gossip".to_string())
        );
        assert!(!decoded.message_type.is_request());
        assert!(decoded.verify(Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(DhtMessage::from_bytes(b"not bencode").is_err());
        assert!(FindNodeResponseArguments::from_payload(b"d5:nodesi3ee").is_err());
    }

    #[test]
    fn find_value_payload() {
        let response = FindValueResponseArguments {
            providers: vec![NodeInfo::new(
                Id::random(),
                SocketAddr::from(([10, 0, 0, 1], 7000)),
            )],
            nodes: vec![NodeInfo::new(
                Id::random(),
                "[::1]:7001".parse().unwrap(),
            )],
        };

        let decoded = FindValueResponseArguments::from_payload(&response.to_payload()).unwrap();

        assert_eq!(decoded, response);
    }
}
