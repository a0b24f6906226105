//! Manage announced providers of content hashes

use std::{net::SocketAddr, num::NonZeroUsize};

use rand::{thread_rng, Rng};

use crate::common::{Id, NodeInfo};

/// Maximum providers returned for one hash.
pub const MAX_RETURNED_PROVIDERS: usize = 20;

#[derive(Debug)]
/// An LRU cache of providers per content hash.
///
/// Both levels are bounded, the least recently announced hash, or provider of
/// a hash, is dropped first.
pub struct ProvidersStore {
    hashes: lru::LruCache<Id, lru::LruCache<Id, SocketAddr>>,
    max_providers: NonZeroUsize,
}

impl ProvidersStore {
    pub fn new(max_hashes: NonZeroUsize, max_providers: NonZeroUsize) -> Self {
        Self {
            hashes: lru::LruCache::new(max_hashes),
            max_providers,
        }
    }

    /// Record that `provider` holds `hash`, refreshing it if already known.
    pub fn add_provider(&mut self, hash: Id, provider: NodeInfo) {
        if let Some(providers) = self.hashes.get_mut(&hash) {
            providers.put(provider.id, provider.address);
        } else {
            let mut providers = lru::LruCache::new(self.max_providers);
            providers.put(provider.id, provider.address);
            self.hashes.put(hash, providers);
        };
    }

    /// Up to [MAX_RETURNED_PROVIDERS] providers of `hash`, sampled uniformly.
    pub fn get_random_providers(&mut self, hash: &Id) -> Vec<NodeInfo> {
        let Some(providers) = self.hashes.get(hash) else {
            return Vec::new();
        };

        let size = providers.len();
        let target_size = MAX_RETURNED_PROVIDERS;

        if size <= target_size {
            return providers
                .iter()
                .map(|(id, address)| NodeInfo::new(*id, *address))
                .collect();
        }

        let mut results = Vec::with_capacity(target_size);
        let mut rng = thread_rng();

        for (index, (id, address)) in providers.iter().enumerate() {
            // Chance of picking the current item, from remaining slots over remaining items
            let remaining_slots = target_size - results.len();
            let remaining_items = size - index;
            let current_chance = remaining_slots as f64 / remaining_items as f64;

            if rng.gen_bool(current_chance) {
                results.push(NodeInfo::new(*id, *address));
                if results.len() == target_size {
                    break;
                }
            }
        }

        results
    }

    /// Number of hashes with at least one provider.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Number of (hash, provider) records.
    pub fn records(&self) -> usize {
        self.hashes.iter().map(|(_, providers)| providers.len()).sum()
    }
}
