//! Node identity: keypair provisioning, node Id derivation, signing and verification.

use std::{
    fmt::{self, Debug, Formatter},
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use tracing::info;

use crate::common::Id;

/// Domain tag prepended to challenge nonces before signing them for the tracker,
/// so a challenge signature can never be replayed as a message signature.
const CHALLENGE_DOMAIN: &[u8] = b"mangamesh-dht/challenge";

/// A keypair as held by an external [KeyStore], both halves base64 encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct StoredKeyPair {
    pub public_key: String,
    pub private_key: String,
}

impl Debug for StoredKeyPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredKeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Persistence for the node's keypair. The DHT never writes keys anywhere itself.
pub trait KeyStore: Send + Sync {
    /// Returns the persisted keypair, if any.
    fn get(&self) -> Result<Option<StoredKeyPair>, KeyStoreError>;

    /// Persist a newly generated keypair.
    fn save(&self, public_key: &str, private_key: &str) -> Result<(), KeyStoreError>;
}

#[derive(thiserror::Error, Debug)]
/// Errors from a [KeyStore] or from the keys it returned.
pub enum KeyStoreError {
    #[error("Key store unavailable: {0}")]
    Unavailable(String),

    #[error("Stored keypair is invalid: {0}")]
    InvalidKey(&'static str),
}

#[derive(Debug, Default)]
/// A [KeyStore] that keeps the keypair in memory, for tests and throwaway nodes.
pub struct MemoryKeyStore {
    keypair: Mutex<Option<StoredKeyPair>>,
    saves: Mutex<usize>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds a keypair.
    pub fn with_keypair(keypair: StoredKeyPair) -> Self {
        Self {
            keypair: Mutex::new(Some(keypair)),
            saves: Mutex::new(0),
        }
    }

    /// How many times [KeyStore::save] was called.
    pub fn saves(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self) -> Result<Option<StoredKeyPair>, KeyStoreError> {
        Ok(self
            .keypair
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, public_key: &str, private_key: &str) -> Result<(), KeyStoreError> {
        *self.keypair.lock().unwrap_or_else(PoisonError::into_inner) = Some(StoredKeyPair {
            public_key: public_key.to_string(),
            private_key: private_key.to_string(),
        });
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;

        Ok(())
    }
}

/// The node's keypair and the [Id] derived from its public key.
///
/// Immutable once created, share it behind an [Arc].
pub struct NodeIdentity {
    signing_key: SigningKey,
    id: Id,
}

impl NodeIdentity {
    /// Generate a fresh identity, not persisted anywhere.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let id = Id::from_public_key(signing_key.verifying_key().as_bytes());

        Self { signing_key, id }
    }

    /// Load the identity from a stored keypair, checking that both halves belong together.
    pub fn from_stored(stored: &StoredKeyPair) -> Result<Self, KeyStoreError> {
        let secret: [u8; 32] = STANDARD
            .decode(&stored.private_key)
            .map_err(|_| KeyStoreError::InvalidKey("private key is not valid base64"))?
            .try_into()
            .map_err(|_| KeyStoreError::InvalidKey("private key must be 32 bytes"))?;

        let public = STANDARD
            .decode(&stored.public_key)
            .map_err(|_| KeyStoreError::InvalidKey("public key is not valid base64"))?;

        let signing_key = SigningKey::from_bytes(&secret);

        if signing_key.verifying_key().as_bytes().as_slice() != public.as_slice() {
            return Err(KeyStoreError::InvalidKey(
                "public key does not match private key",
            ));
        }

        Ok(Self::from_signing_key(signing_key))
    }

    /// Load the persisted keypair, or generate and persist one if the store is empty.
    pub fn load_or_generate(store: &dyn KeyStore) -> Result<Self, KeyStoreError> {
        if let Some(stored) = store.get()? {
            return Self::from_stored(&stored);
        }

        let identity = Self::generate();
        let stored = identity.to_stored();
        store.save(&stored.public_key, &stored.private_key)?;

        info!(id = %identity.id, "Generated and persisted a new node keypair");

        Ok(identity)
    }

    // === Getters ===

    /// This node's [Id], derived once from the public key.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Base64 encoding of the public key, as exchanged with the tracker.
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public_key())
    }

    pub fn to_stored(&self) -> StoredKeyPair {
        StoredKeyPair {
            public_key: self.public_key_base64(),
            private_key: STANDARD.encode(self.signing_key.to_bytes()),
        }
    }

    // === Public Methods ===

    /// Sign an already domain separated signable encoding.
    pub fn sign(&self, signable: &[u8]) -> [u8; 64] {
        self.signing_key.sign(signable).to_bytes()
    }

    /// Sign a tracker key-ownership challenge.
    pub fn sign_challenge(&self, nonce: &[u8]) -> [u8; 64] {
        let mut signable = Vec::with_capacity(CHALLENGE_DOMAIN.len() + nonce.len());
        signable.extend_from_slice(CHALLENGE_DOMAIN);
        signable.extend_from_slice(nonce);

        self.sign(&signable)
    }
}

impl Debug for NodeIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `signable` under `public_key`.
///
/// Fails closed: malformed keys or signatures return `false`.
pub fn verify(signable: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::try_from(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };

    key.verify(signable, &signature).is_ok()
}

/// Verify a challenge signature produced by [NodeIdentity::sign_challenge].
pub fn verify_challenge(nonce: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let mut signable = Vec::with_capacity(CHALLENGE_DOMAIN.len() + nonce.len());
    signable.extend_from_slice(CHALLENGE_DOMAIN);
    signable.extend_from_slice(nonce);

    verify(&signable, signature, public_key)
}

/// Provisions the node identity from a [KeyStore] on first use, exactly once.
///
/// Concurrent first callers block on the same provisioning and all observe
/// the same keypair.
pub struct IdentityProvider {
    store: Arc<dyn KeyStore>,
    identity: OnceLock<Arc<NodeIdentity>>,
    provisioning: Mutex<()>,
}

impl IdentityProvider {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            identity: OnceLock::new(),
            provisioning: Mutex::new(()),
        }
    }

    /// Returns the identity, provisioning it through the key store if needed.
    pub fn get(&self) -> Result<Arc<NodeIdentity>, KeyStoreError> {
        if let Some(identity) = self.identity.get() {
            return Ok(identity.clone());
        }

        let _guard = self
            .provisioning
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(identity) = self.identity.get() {
            return Ok(identity.clone());
        }

        let identity = Arc::new(NodeIdentity::load_or_generate(self.store.as_ref())?);

        Ok(self.identity.get_or_init(|| identity).clone())
    }
}

impl Debug for IdentityProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityProvider")
            .field("identity", &self.identity.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::thread;

    use super::*;

    // RFC 8032 test 1.
    const SECRET: &str = "nWGxne/9WmC6hEr0kuwsxERJxWl7MmkZcDusAxyuf2A=";
    const PUBLIC: &str = "11qYAYKxCrfVS/7TyWQHOg7hcvPapiMlrwIaaPcHURo=";

    fn rfc_keypair() -> StoredKeyPair {
        StoredKeyPair {
            public_key: PUBLIC.to_string(),
            private_key: SECRET.to_string(),
        }
    }

    #[test]
    fn node_id_from_stored_keypair() {
        let identity = NodeIdentity::from_stored(&rfc_keypair()).unwrap();

        assert_eq!(
            identity.id(),
            &Id::from_str("21fe31dfa154a261626bf854046fd2271b7bed4b6abe45aa58877ef47f9721b9")
                .unwrap()
        );
        assert_eq!(identity.public_key_base64(), PUBLIC);
    }

    #[test]
    fn rfc8032_signature() {
        let identity = NodeIdentity::from_stored(&rfc_keypair()).unwrap();

        let signature = identity.sign(b"");

        let expected = "e5564300c360ac729086e2cc806e828a84877f1eb8e5d974d873e065224901555fb8821590a33bacc61e39701cf9b46bd25bf5f0595bbe24655141438e7a100b";
        let hex: String = signature.iter().map(|b| format!("{b:02x}")).collect();

        assert_eq!(hex, expected);
    }

    #[test]
    fn mismatched_halves_are_rejected() {
        let other = NodeIdentity::generate();

        let stored = StoredKeyPair {
            public_key: other.public_key_base64(),
            private_key: SECRET.to_string(),
        };

        assert!(matches!(
            NodeIdentity::from_stored(&stored),
            Err(KeyStoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn generate_and_persist_once() {
        let store = MemoryKeyStore::new();

        let first = NodeIdentity::load_or_generate(&store).unwrap();
        let second = NodeIdentity::load_or_generate(&store).unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(store.saves(), 1);
    }

    #[test]
    fn verify_fails_closed() {
        let identity = NodeIdentity::generate();
        let signature = identity.sign(b"hello");

        assert!(verify(b"hello", &signature, &identity.public_key()));
        assert!(!verify(b"hellO", &signature, &identity.public_key()));
        assert!(!verify(b"hello", &signature[..10], &identity.public_key()));
        assert!(!verify(b"hello", &signature, &[1, 2, 3]));
        assert!(!verify(
            b"hello",
            &signature,
            &NodeIdentity::generate().public_key()
        ));
    }

    #[test]
    fn challenge_signature_is_not_a_message_signature() {
        let identity = NodeIdentity::generate();
        let signature = identity.sign_challenge(b"nonce");

        assert!(verify_challenge(b"nonce", &signature, &identity.public_key()));
        assert!(!verify(b"nonce", &signature, &identity.public_key()));
    }

    #[test]
    fn concurrent_first_use_provisions_one_keypair() {
        let store = Arc::new(MemoryKeyStore::new());
        let provider = Arc::new(IdentityProvider::new(store.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider = provider.clone();
                thread::spawn(move || *provider.get().unwrap().id())
            })
            .collect();

        let ids: Vec<Id> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(store.saves(), 1);
    }
}
