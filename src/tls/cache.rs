use super::authority::LeafCertificate;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// Optional TTL cache of issued leaves keyed by the sorted hostname set.
/// Issuance is correct without it; it only saves signing work.
pub struct LeafCache {
    entries: DashMap<Vec<String>, CachedLeaf>,
    ttl: Duration,
}

struct CachedLeaf {
    leaf: Arc<LeafCertificate>,
    inserted: Instant,
}

impl LeafCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// A hit must be inside the cache TTL and the leaf itself still valid.
    pub fn get(&self, hostnames: &[String]) -> Option<Arc<LeafCertificate>> {
        let key = cache_key(hostnames);
        let now = OffsetDateTime::now_utc();
        let hit = self.entries.get(&key).and_then(|entry| {
            let fresh = entry.inserted.elapsed() < self.ttl && entry.leaf.not_after() > now;
            fresh.then(|| entry.leaf.clone())
        });
        if hit.is_none() {
            self.entries.remove(&key);
        }
        hit
    }

    pub fn insert(&self, hostnames: &[String], leaf: Arc<LeafCertificate>) {
        self.entries.insert(
            cache_key(hostnames),
            CachedLeaf {
                leaf,
                inserted: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// The subject is hostnames[0], so only the tail is order-insensitive.
fn cache_key(hostnames: &[String]) -> Vec<String> {
    let mut key = hostnames.to_vec();
    if key.len() > 2 {
        key[1..].sort();
    }
    key
}
