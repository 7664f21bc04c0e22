//! Bounded TTL cache for classifications held in process memory.

use crate::providers::Classification;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CachedClassification {
    classification: Classification,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedClassification {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// Thread-safe TTL cache keyed by address.
pub struct ReputationCache {
    cache: RwLock<HashMap<IpAddr, CachedClassification>>,
    default_ttl: Duration,
    max_entries: usize,
}

impl ReputationCache {
    /// Create a new cache.
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            default_ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Get a cached classification if available and not expired.
    pub fn get(&self, ip: &IpAddr) -> Option<Classification> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(ip)?;

        if entry.is_expired() {
            // Left in place; cleanup or eviction removes it
            None
        } else {
            Some(entry.classification)
        }
    }

    /// Store a classification with the default TTL.
    pub fn set(&self, ip: IpAddr, classification: Classification) {
        self.set_with_ttl(ip, classification, self.default_ttl);
    }

    /// Store a classification with a custom TTL.
    pub fn set_with_ttl(&self, ip: IpAddr, classification: Classification, ttl: Duration) {
        let entry = CachedClassification {
            classification,
            cached_at: Instant::now(),
            ttl,
        };

        if let Ok(mut cache) = self.cache.write() {
            if cache.len() >= self.max_entries && !cache.contains_key(&ip) {
                evict_expired_entries(&mut cache);

                // Still full: drop the oldest entry
                if cache.len() >= self.max_entries {
                    if let Some(oldest_ip) = cache
                        .iter()
                        .min_by_key(|(_, v)| v.cached_at)
                        .map(|(k, _)| *k)
                    {
                        cache.remove(&oldest_ip);
                    }
                }
            }

            cache.insert(ip, entry);
        }
    }

    /// Remove expired entries from the cache.
    pub fn cleanup(&self) {
        if let Ok(mut cache) = self.cache.write() {
            evict_expired_entries(&mut cache);
        }
    }

    /// Number of entries, expired ones included until cleanup.
    pub(crate) fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }
}

fn evict_expired_entries(cache: &mut HashMap<IpAddr, CachedClassification>) {
    cache.retain(|_, v| !v.is_expired());
}
