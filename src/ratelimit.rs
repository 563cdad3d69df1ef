//! Fixed-window request quotas per (identity, target)
//!
//! Counters live in a `DashMap`; each increment holds the shard lock for its
//! key, so concurrent requests for the same identity are counted exactly.

use crate::auth::AuthContext;
use crate::config::RateLimitConfig;
use crate::error::DispatchError;
use dashmap::DashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Who a quota is charged to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Subject(String),
    Address(IpAddr),
}

impl Identity {
    /// Authenticated subject, falling back to the client address
    pub fn from_context(context: &AuthContext, client_ip: IpAddr) -> Self {
        match context.subject() {
            Some(subject) => Identity::Subject(subject.to_string()),
            None => Identity::Address(client_ip),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Address(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Subject(s) => write!(f, "sub:{}", s),
            Identity::Address(ip) => write!(f, "ip:{}", ip),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RateKey {
    identity: Identity,
    target: String,
}

#[derive(Debug)]
struct Window {
    bucket: u64,
    count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the current window closes
    pub retry_after_secs: u64,
}

#[derive(Debug, Default)]
pub struct RateStats {
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl RateStats {
    pub fn get_admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn get_rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

pub struct RateLimiter {
    windows: DashMap<RateKey, Window>,
    enabled: bool,
    quota: u64,
    anonymous_quota: u64,
    window_secs: u64,
    stats: RateStats,
}

impl RateLimiter {
    pub fn new(quota: u64, anonymous_quota: u64, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            enabled: true,
            quota,
            anonymous_quota,
            window_secs: window.as_secs().max(1),
            stats: RateStats::default(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        let mut limiter = Self::new(
            config.requests_per_window,
            config.anonymous_quota(),
            Duration::from_secs(config.window_secs),
        );
        limiter.enabled = config.enabled;
        limiter
    }

    pub fn stats(&self) -> &RateStats {
        &self.stats
    }

    /// Number of live counters
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    fn quota_for(&self, identity: &Identity) -> u64 {
        if identity.is_anonymous() {
            self.anonymous_quota
        } else {
            self.quota
        }
    }

    pub fn check(&self, identity: &Identity, target: &str) -> RateDecision {
        self.check_at(identity, target, unix_now())
    }

    /// Count one request against the window containing `now_secs`.
    /// Rejected requests are not counted.
    pub fn check_at(&self, identity: &Identity, target: &str, now_secs: u64) -> RateDecision {
        let limit = self.quota_for(identity);
        if !self.enabled {
            return RateDecision {
                allowed: true,
                limit,
                remaining: limit,
                retry_after_secs: 0,
            };
        }

        let bucket = now_secs / self.window_secs;
        let window_end = (bucket + 1) * self.window_secs;
        let key = RateKey {
            identity: identity.clone(),
            target: target.to_string(),
        };

        let mut window = self.windows.entry(key).or_insert(Window { bucket, count: 0 });
        if window.bucket < bucket {
            window.bucket = bucket;
            window.count = 0;
        }

        if window.count >= limit {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                retry_after_secs: window_end.saturating_sub(now_secs).max(1),
            };
        }

        window.count += 1;
        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        RateDecision {
            allowed: true,
            limit,
            remaining: limit - window.count,
            retry_after_secs: 0,
        }
    }

    /// Admission stage: a rejected decision becomes a terminal error
    pub fn admit(&self, identity: &Identity, target: &str) -> Result<RateDecision, DispatchError> {
        let decision = self.check(identity, target);
        if decision.allowed {
            Ok(decision)
        } else {
            debug!(identity = %identity, target_id = target, "Rate limit exceeded");
            Err(DispatchError::RateLimited {
                key: format!("{}/{}", identity, target),
                retry_after_secs: decision.retry_after_secs,
            })
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(unix_now())
    }

    /// Drop counters whose window has closed
    pub fn purge_expired_at(&self, now_secs: u64) -> usize {
        let current = now_secs / self.window_secs;
        let before = self.windows.len();
        self.windows.retain(|_, window| window.bucket >= current);
        before.saturating_sub(self.windows.len())
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "enabled": self.enabled,
            "tracked_keys": self.tracked_keys(),
            "admitted": self.stats.get_admitted(),
            "rejected": self.stats.get_rejected(),
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
