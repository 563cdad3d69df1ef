//! Custom domain resolution
//!
//! Maps customer-owned host names to target identifiers through a
//! [`DomainStore`] collaborator, with a read-through TTL cache in front.
//! Concurrent misses for the same host share one store query: the first
//! caller spawns the lookup and later callers await the same shared future.
//! Invalidating a host also detaches its in-flight lookup, which then
//! answers its existing waiters but never writes the cache.

use crate::config::{DomainRecordConfig, DomainsConfig};
use crate::error::panic_message;
use crate::resolver::{normalize_host, validate_identifier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A persisted custom domain mapping. Owned by the platform; the dispatcher
/// only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomDomainRecord {
    pub host: String,
    pub target: String,
    pub verified: bool,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

impl CustomDomainRecord {
    /// A verified, active record. The host is stored in the same normalized
    /// form the resolver looks up (lowercase, no port, no trailing dot).
    pub fn new(host: &str, target: &str) -> Self {
        Self {
            host: normalize_host(host).unwrap_or_else(|| host.to_ascii_lowercase()),
            target: target.to_string(),
            verified: true,
            active: true,
            updated_at: Utc::now(),
        }
    }

    pub fn is_routable(&self) -> bool {
        self.verified && self.active
    }
}

/// Read interface of the persistent domain store
#[async_trait]
pub trait DomainStore: Send + Sync {
    /// Look up the record for a normalized host name
    async fn lookup_custom_domain(&self, host: &str) -> anyhow::Result<Option<CustomDomainRecord>>;
}

/// In-memory store seeded from configuration
#[derive(Default)]
pub struct StaticDomainStore {
    records: RwLock<HashMap<String, CustomDomainRecord>>,
}

impl StaticDomainStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(records: &[DomainRecordConfig]) -> Self {
        let store = Self::new();
        for r in records {
            store.upsert(CustomDomainRecord {
                verified: r.verified,
                active: r.active,
                ..CustomDomainRecord::new(&r.host, &r.target)
            });
        }
        store
    }

    pub fn upsert(&self, record: CustomDomainRecord) {
        self.records.write().insert(record.host.clone(), record);
    }

    pub fn remove(&self, host: &str) -> Option<CustomDomainRecord> {
        self.records.write().remove(host)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl DomainStore for StaticDomainStore {
    async fn lookup_custom_domain(&self, host: &str) -> anyhow::Result<Option<CustomDomainRecord>> {
        Ok(self.records.read().get(host).cloned())
    }
}

/// Why a custom domain did not resolve
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    /// Unmapped, inactive and unverified all collapse into this variant
    #[error("custom domain is not routable")]
    NotFound,

    #[error("domain store lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("domain store error: {0}")]
    Store(String),
}

/// A routable custom domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDomain {
    pub target: String,
    pub updated_at: DateTime<Utc>,
}

pub type LookupOutcome = Result<ResolvedDomain, LookupError>;

type PendingLookup = Shared<BoxFuture<'static, LookupOutcome>>;

struct InflightLookup {
    id: u64,
    pending: PendingLookup,
}

#[derive(Debug, Clone)]
enum CachedAnswer {
    Routable(ResolvedDomain),
    NotRoutable,
}

impl CachedAnswer {
    fn into_outcome(self) -> LookupOutcome {
        match self {
            CachedAnswer::Routable(resolved) => Ok(resolved),
            CachedAnswer::NotRoutable => Err(LookupError::NotFound),
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    answer: CachedAnswer,
    expires_at: Instant,
}

/// Cache timings
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub negative_ttl: Duration,
    pub lookup_timeout: Duration,
    pub max_identifier_len: usize,
}

impl CacheSettings {
    pub fn from_config(config: &DomainsConfig, max_identifier_len: usize) -> Self {
        Self {
            ttl: config.cache_ttl(),
            negative_ttl: config.negative_ttl(),
            lookup_timeout: config.lookup_timeout(),
            max_identifier_len,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            negative_ttl: Duration::from_secs(10),
            lookup_timeout: Duration::from_millis(500),
            max_identifier_len: 63,
        }
    }
}

/// Counters for the admin stats endpoint
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub coalesced: AtomicU64,
    pub store_queries: AtomicU64,
}

impl CacheStats {
    pub fn get_store_queries(&self) -> u64 {
        self.store_queries.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "hits": self.hits.load(Ordering::Relaxed),
            "misses": self.misses.load(Ordering::Relaxed),
            "coalesced": self.coalesced.load(Ordering::Relaxed),
            "store_queries": self.get_store_queries(),
        })
    }
}

/// Read-through, single-flight custom domain resolver
pub struct DomainResolver {
    store: Arc<dyn DomainStore>,
    cache: Arc<DashMap<String, CacheEntry>>,
    inflight: Arc<Mutex<HashMap<String, InflightLookup>>>,
    next_lookup_id: AtomicU64,
    settings: CacheSettings,
    stats: Arc<CacheStats>,
}

impl DomainResolver {
    pub fn new(store: Arc<dyn DomainStore>, settings: CacheSettings) -> Self {
        Self {
            store,
            cache: Arc::new(DashMap::new()),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_lookup_id: AtomicU64::new(0),
            settings,
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    /// Number of cache entries, including expired ones not yet purged
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Resolve a normalized host to its active target
    pub async fn resolve(&self, host: &str) -> LookupOutcome {
        if let Some(answer) = self.cached(host) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return answer.into_outcome();
        }

        let pending = {
            let mut inflight = self.inflight.lock();
            if let Some(lookup) = inflight.get(host) {
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                lookup.pending.clone()
            } else if let Some(answer) = self.cached(host) {
                // A lookup completed between the first cache check and the lock
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return answer.into_outcome();
            } else {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                let id = self.next_lookup_id.fetch_add(1, Ordering::Relaxed);
                let pending = self.spawn_lookup(host.to_string(), id);
                inflight.insert(
                    host.to_string(),
                    InflightLookup {
                        id,
                        pending: pending.clone(),
                    },
                );
                pending
            }
        };

        pending.await
    }

    /// Drop a cached answer, and detach any lookup still in flight, so the
    /// next request re-queries the store
    pub fn invalidate(&self, host: &str) -> bool {
        // Same lock a finishing lookup holds while it writes the cache
        let mut inflight = self.inflight.lock();
        let detached = inflight.remove(host).is_some();
        let removed = self.cache.remove(host).is_some();
        drop(inflight);

        if removed || detached {
            info!(host, cached = removed, in_flight = detached, "Custom domain invalidated");
        }
        removed || detached
    }

    /// Remove expired entries, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.expires_at > now);
        let purged = before.saturating_sub(self.cache.len());
        if purged > 0 {
            debug!(purged, "Purged expired custom domain cache entries");
        }
        purged
    }

    fn cached(&self, host: &str) -> Option<CachedAnswer> {
        let entry = self.cache.get(host)?;
        if entry.expires_at > Instant::now() {
            Some(entry.answer.clone())
        } else {
            None
        }
    }

    /// The lookup runs as its own task so it finishes and fills the cache
    /// even if every waiting request is cancelled.
    fn spawn_lookup(&self, host: String, id: u64) -> PendingLookup {
        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        let inflight = Arc::clone(&self.inflight);
        let stats = Arc::clone(&self.stats);
        let settings = self.settings.clone();

        let handle = tokio::spawn(async move {
            stats.store_queries.fetch_add(1, Ordering::Relaxed);
            // A panicking store must still clear the inflight entry below
            let lookup = AssertUnwindSafe(store.lookup_custom_domain(&host)).catch_unwind();

            let answer = match tokio::time::timeout(settings.lookup_timeout, lookup).await {
                Ok(Ok(Ok(Some(record)))) if record.is_routable() => {
                    match validate_identifier(&record.target, settings.max_identifier_len) {
                        Some(target) => Ok(CachedAnswer::Routable(ResolvedDomain {
                            target,
                            updated_at: record.updated_at,
                        })),
                        None => {
                            warn!(host, target_id = %record.target, "Custom domain maps to an invalid target identifier");
                            Ok(CachedAnswer::NotRoutable)
                        }
                    }
                }
                Ok(Ok(Ok(_))) => Ok(CachedAnswer::NotRoutable),
                Ok(Ok(Err(e))) => Err(LookupError::Store(e.to_string())),
                Ok(Err(payload)) => Err(LookupError::Store(format!(
                    "store panicked: {}",
                    panic_message(payload.as_ref())
                ))),
                Err(_) => Err(LookupError::Timeout(settings.lookup_timeout)),
            };

            {
                let mut inflight = inflight.lock();
                let current = inflight.get(&host).is_some_and(|lookup| lookup.id == id);
                if current {
                    inflight.remove(&host);
                    // Only definitive answers are cached; store failures are
                    // retried by the next request.
                    if let Ok(answer) = &answer {
                        let ttl = match answer {
                            CachedAnswer::Routable(_) => settings.ttl,
                            CachedAnswer::NotRoutable => settings.negative_ttl,
                        };
                        cache.insert(
                            host.clone(),
                            CacheEntry {
                                answer: answer.clone(),
                                expires_at: Instant::now() + ttl,
                            },
                        );
                    }
                } else {
                    debug!(host, "Lookup was invalidated while in flight, not caching");
                }
            }

            match answer {
                Ok(answer) => answer.into_outcome(),
                Err(e) => {
                    warn!(host, error = %e, "Custom domain lookup failed");
                    Err(e)
                }
            }
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(LookupError::Store(format!("lookup task failed: {}", e))))
        }
        .boxed()
        .shared()
    }
}
