//! Tiered resolution of address classifications.
//!
//! Lookup order is in-process cache, persistent store, then the external
//! source. Concurrent resolutions of the same address share a single
//! store probe and source call; the first caller drives the lookup and
//! the others await its result.
//!
//! Failures never surface to the caller. A store error is treated as a
//! miss, a source error produces [`Classification::fallback`] which is not
//! cached, so the next resolution asks the source again.

use crate::address::Key;
use crate::cache::ReputationCache;
use crate::providers::{Classification, ClassificationSource};
use crate::store::{ReputationStore, StoreRecord};
use chrono::Utc;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Which tier answered a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Loopback or private address, nothing consulted.
    LocalScope,
    Memory,
    Store,
    Source,
    /// Source failed; fail-open result.
    Fallback,
}

/// Outcome of [`Resolver::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub classification: Classification,
    pub tier: Tier,
}

impl Resolution {
    pub fn is_flagged(&self) -> bool {
        self.classification.flagged
    }
}

/// Who a lookup is made for; written next to the verdict in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditTag {
    pub identity: String,
    pub label: String,
}

impl AuditTag {
    pub fn new(identity: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            label: label.into(),
        }
    }
}

/// Point-in-time copy of the resolver counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub resolutions: u64,
    pub local_skips: u64,
    pub memory_hits: u64,
    pub store_hits: u64,
    pub store_errors: u64,
    pub source_calls: u64,
    pub source_failures: u64,
    /// Live entries in the in-process tier, expired ones included until purged.
    pub memory_entries: usize,
}

#[derive(Default)]
struct Counters {
    resolutions: AtomicU64,
    local_skips: AtomicU64,
    memory_hits: AtomicU64,
    store_hits: AtomicU64,
    store_errors: AtomicU64,
    source_calls: AtomicU64,
    source_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ResolverStats {
        ResolverStats {
            resolutions: self.resolutions.load(Ordering::Relaxed),
            local_skips: self.local_skips.load(Ordering::Relaxed),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            store_hits: self.store_hits.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            source_calls: self.source_calls.load(Ordering::Relaxed),
            source_failures: self.source_failures.load(Ordering::Relaxed),
            memory_entries: 0,
        }
    }
}

type Flight = Arc<OnceCell<Resolution>>;

/// Coordinates the cache tiers and the external source.
pub struct Resolver {
    memory: ReputationCache,
    store: Arc<dyn ReputationStore>,
    source: Arc<dyn ClassificationSource>,
    freshness: Duration,
    in_flight: Mutex<HashMap<IpAddr, Flight>>,
    counters: Counters,
}

impl Resolver {
    /// Create a resolver. `freshness` bounds both the store window and the
    /// in-process TTL.
    pub fn new(
        store: Arc<dyn ReputationStore>,
        source: Arc<dyn ClassificationSource>,
        freshness: Duration,
        max_memory_entries: usize,
    ) -> Self {
        Self {
            memory: ReputationCache::new(freshness, max_memory_entries),
            store,
            source,
            freshness,
            in_flight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            memory_entries: self.memory.len(),
            ..self.counters.snapshot()
        }
    }

    /// Freshness window applied to stored verdicts.
    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Drop expired in-process entries.
    pub fn purge_expired(&self) {
        self.memory.cleanup();
    }

    /// Classify `key`. Never fails; see the module docs for degradation.
    pub async fn resolve(&self, key: &Key, audit: &AuditTag) -> Resolution {
        Counters::bump(&self.counters.resolutions);
        let ip = key.ip();

        if key.is_locally_scoped() {
            Counters::bump(&self.counters.local_skips);
            debug!(ip = %ip, "Local address, skipping lookup");
            return Resolution {
                classification: Classification::clean(),
                tier: Tier::LocalScope,
            };
        }

        if let Some(classification) = self.memory.get(&ip) {
            Counters::bump(&self.counters.memory_hits);
            if classification.flagged {
                debug!(ip = %ip, "Memory cache hit: flagged");
            }
            return Resolution {
                classification,
                tier: Tier::Memory,
            };
        }

        let flight = self.join_flight(ip);
        let resolution = *flight.get_or_init(|| self.lookup(ip, audit)).await;
        self.land_flight(ip, &flight);
        resolution
    }

    fn join_flight(&self, ip: IpAddr) -> Flight {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(in_flight.entry(ip).or_default())
    }

    fn land_flight(&self, ip: IpAddr, flight: &Flight) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight.get(&ip).is_some_and(|f| Arc::ptr_eq(f, flight)) {
            in_flight.remove(&ip);
        }
    }

    async fn lookup(&self, ip: IpAddr, audit: &AuditTag) -> Resolution {
        // A flight that finished just before this one started may have
        // filled the memory tier already.
        if let Some(classification) = self.memory.get(&ip) {
            Counters::bump(&self.counters.memory_hits);
            return Resolution {
                classification,
                tier: Tier::Memory,
            };
        }

        match self.store.lookup(&ip, self.freshness).await {
            Ok(Some(record)) => {
                Counters::bump(&self.counters.store_hits);
                let remaining = self.freshness.saturating_sub(record.age(Utc::now()));
                self.memory.set_with_ttl(ip, record.classification, remaining);
                if record.classification.flagged {
                    debug!(
                        ip = %ip,
                        severity = ?record.classification.severity,
                        "Store hit: flagged"
                    );
                }
                return Resolution {
                    classification: record.classification,
                    tier: Tier::Store,
                };
            }
            Ok(None) => {}
            Err(e) => {
                Counters::bump(&self.counters.store_errors);
                warn!(ip = %ip, error = %e, "Store lookup failed, treating as miss");
            }
        }

        Counters::bump(&self.counters.source_calls);
        let classification = match self.source.classify(&ip).await {
            Ok(classification) => classification,
            Err(e) => {
                Counters::bump(&self.counters.source_failures);
                warn!(
                    ip = %ip,
                    source = self.source.name(),
                    error = %e,
                    "Classification source failed, treating as clean"
                );
                return Resolution {
                    classification: Classification::fallback(),
                    tier: Tier::Fallback,
                };
            }
        };

        self.memory.set(ip, classification);

        let record = StoreRecord {
            ip,
            classification,
            identity: audit.identity.clone(),
            label: audit.label.clone(),
            checked_at: Utc::now(),
        };
        if let Err(e) = self.store.upsert(&record).await {
            Counters::bump(&self.counters.store_errors);
            warn!(ip = %ip, error = %e, "Failed to persist classification");
        } else {
            info!(
                ip = %ip,
                flagged = classification.flagged,
                severity = ?classification.severity,
                identity = %audit.identity,
                "Classification stored"
            );
        }

        Resolution {
            classification,
            tier: Tier::Source,
        }
    }
}
