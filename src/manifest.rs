//! The local manifest set, as far as the DHT is concerned.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::{PoisonError, RwLock};

use sha2::{Digest, Sha256};

use crate::common::Id;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Manifest store unavailable: {0}")]
pub struct ManifestStoreError(pub String);

/// Supplies the hashes of the manifests held locally.
pub trait ManifestStore: Debug + Send + Sync {
    fn manifest_hashes(&self) -> Result<Vec<Id>, ManifestStoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Count and order independent digest of a manifest set.
pub struct ManifestSummary {
    pub count: usize,
    /// SHA-256 over the sorted, deduplicated hashes.
    pub set_hash: Id,
}

impl ManifestSummary {
    pub fn from_hashes<'a>(hashes: impl IntoIterator<Item = &'a Id>) -> Self {
        let unique: BTreeSet<&Id> = hashes.into_iter().collect();

        let mut hasher = Sha256::new();
        for hash in &unique {
            hasher.update(hash.as_bytes());
        }
        let digest: [u8; 32] = hasher.finalize().into();

        Self {
            count: unique.len(),
            set_hash: Id::from(digest),
        }
    }
}

#[derive(Debug, Default)]
/// In memory [ManifestStore].
pub struct MemoryManifestStore {
    hashes: RwLock<BTreeSet<Id>>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, hash: Id) -> bool {
        self.hashes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash)
    }

    pub fn remove(&self, hash: &Id) -> bool {
        self.hashes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hash)
    }
}

impl ManifestStore for MemoryManifestStore {
    fn manifest_hashes(&self) -> Result<Vec<Id>, ManifestStoreError> {
        Ok(self
            .hashes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_set() {
        let summary = ManifestSummary::from_hashes(&[]);

        assert_eq!(summary.count, 0);
        assert_eq!(
            summary.set_hash.to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn order_and_duplicates_do_not_matter() {
        let a = Id::random();
        let b = Id::random();

        let summary = ManifestSummary::from_hashes(&[a, b]);

        assert_eq!(summary, ManifestSummary::from_hashes(&[b, a, b]));
        assert_eq!(summary.count, 2);
        assert_ne!(summary, ManifestSummary::from_hashes(&[a]));
    }

    #[test]
    fn memory_store() {
        let store = MemoryManifestStore::new();
        let hash = Id::random();

        assert!(store.insert(hash));
        assert!(!store.insert(hash));
        assert_eq!(store.manifest_hashes().unwrap(), vec![hash]);

        assert!(store.remove(&hash));
        assert!(store.manifest_hashes().unwrap().is_empty());
    }
}
