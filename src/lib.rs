#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;

pub mod bootstrap;
mod core;
mod dht;
mod error;
pub mod manifest;
pub mod rpc;
pub mod server;
pub mod tracker;

pub use crate::common::{
    messages, verify, verify_challenge, DhtMessage, Id, InsertOutcome, KeyStore, KeyStoreError,
    MemoryKeyStore, MessageError, MessageType, NodeIdentity, NodeInfo, RejectReason, RequestId,
    RoutingEntry, RoutingTable, StoredKeyPair, MAX_BUCKET_SIZE_K,
};
pub use bootstrap::{BootstrapProvider, StaticBootstrap, TrackerBootstrap};
pub use bytes::Bytes;
pub use dht::{DhtBuilder, DhtNode, Info, NodeState};
pub use error::{Error, Result};
pub use manifest::{ManifestStore, ManifestStoreError, ManifestSummary, MemoryManifestStore};
pub use rpc::{Config, TransportError};
pub use tracker::{Challenge, TrackerClient, TrackerError};

pub use ed25519_dalek::SigningKey;
