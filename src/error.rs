//! Main Crate Error

use crate::common::KeyStoreError;

#[derive(thiserror::Error, Debug)]
/// Mangamesh DHT crate error enum.
///
/// Only conditions that make the node itself non-functional end up here,
/// recoverable per-peer failures are absorbed where they happen.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error], usually failing to bind the listening port.
    IO(#[from] std::io::Error),

    #[error("Could not establish a node identity: {0}")]
    /// The key store failed or returned an unusable keypair.
    Identity(#[from] KeyStoreError),

    #[error("Invalid configuration: {0}")]
    /// A [crate::Config] value that can never work, like a zero timeout.
    InvalidConfig(&'static str),
}

/// Alias for results returned by startup operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
