//! Scoped limiter registry.
//!
//! Owns every token bucket the gate consults: one global bucket, one per
//! client identity and one per overridden endpoint path. Keyed buckets are
//! created on first use and live in bounded caches behind `RwLock`s; each
//! bucket carries its own mutex so unrelated keys never contend.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use super::bucket::{Acquire, TokenBucket};
use super::cache::BoundedCache;
use super::policy::RateLimitPolicy;
use crate::clock::Clock;
use crate::config::RegistryConfig;

/// An independent axis of rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One bucket shared by every request
    Global,
    /// One bucket per client identity
    Identity,
    /// One bucket per overridden endpoint path
    Endpoint,
}

impl Scope {
    /// Lowercase name used in logs and stats.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Identity => "identity",
            Scope::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A token bucket guarded by its own lock.
///
/// The idle clock used for eviction is kept by the owning cache slot.
#[derive(Debug)]
pub struct LimiterEntry {
    bucket: Mutex<TokenBucket>,
}

impl LimiterEntry {
    /// Create an entry holding a full bucket.
    pub fn new(requests_per_minute: u32, burst: u32, now: Instant) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(requests_per_minute, burst, now)),
        }
    }

    /// Try to take one token.
    pub fn try_acquire(&self, now: Instant) -> Acquire {
        self.bucket.lock().try_acquire(now)
    }

    /// Tokens available at `now`.
    pub fn available(&self, now: Instant) -> f64 {
        self.bucket.lock().available(now)
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> f64 {
        self.bucket.lock().capacity()
    }

    /// Whether the bucket is still below capacity and will refill.
    ///
    /// Such an entry must outlive idle eviction: a recreated bucket starts
    /// full and would hand back the burst it is still paying off.
    pub fn is_refilling(&self, now: Instant) -> bool {
        let mut bucket = self.bucket.lock();
        bucket.refill_rate() > 0.0 && bucket.available(now) < bucket.capacity()
    }
}

/// Entries removed by one registry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySweep {
    pub identities: usize,
    pub endpoints: usize,
}

impl RegistrySweep {
    pub fn total(&self) -> usize {
        self.identities + self.endpoints
    }
}

/// Lazily populated buckets for the global, identity and endpoint scopes.
pub struct ScopedLimiterRegistry {
    policy: Arc<RateLimitPolicy>,
    clock: Arc<dyn Clock>,
    global: Arc<LimiterEntry>,
    identities: RwLock<BoundedCache<LimiterEntry>>,
    endpoints: RwLock<BoundedCache<LimiterEntry>>,
}

impl ScopedLimiterRegistry {
    /// Create a registry for a validated policy.
    pub fn new(policy: Arc<RateLimitPolicy>, config: &RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let idle_timeout = config.idle_timeout();

        let global = Arc::new(LimiterEntry::new(
            policy.global_requests_per_minute,
            policy.global_burst,
            now,
        ));
        // Endpoint keys are limited to configured overrides, so that map
        // cannot outgrow the policy.
        let endpoint_capacity = policy.endpoint_overrides.len().max(1);

        Self {
            identities: RwLock::new(BoundedCache::new(config.max_entries, idle_timeout, now)),
            endpoints: RwLock::new(BoundedCache::new(endpoint_capacity, idle_timeout, now)),
            global,
            policy,
            clock,
        }
    }

    /// Look up the bucket for a scope and key, creating it on first use.
    ///
    /// The global scope ignores `key`. The endpoint scope returns `None` for
    /// paths without an override.
    pub fn get_or_create(&self, scope: Scope, key: &str) -> Option<Arc<LimiterEntry>> {
        match scope {
            Scope::Global => Some(self.global()),
            Scope::Identity => Some(self.identity(key)),
            Scope::Endpoint => self.endpoint(key),
        }
    }

    /// The process-wide bucket.
    pub fn global(&self) -> Arc<LimiterEntry> {
        Arc::clone(&self.global)
    }

    /// The bucket for a client identity.
    ///
    /// If the insert pushes the map past its maximum, eviction runs before
    /// returning.
    pub fn identity(&self, identity: &str) -> Arc<LimiterEntry> {
        let now = self.clock.now();

        if let Some(entry) = self.identities.read().get(identity, now) {
            return entry;
        }

        let mut identities = self.identities.write();
        let (entry, created) = identities.get_or_insert_with(identity, now, || {
            LimiterEntry::new(
                self.policy.per_identity_requests_per_minute,
                self.policy.per_identity_burst,
                now,
            )
        });

        if created {
            debug!(identity = %identity, "Creating identity rate limiter");

            if identities.is_over_capacity() {
                let removed = identities.enforce_capacity(
                    now,
                    |e| e.is_refilling(now),
                    |e| std::ptr::eq(e, &*entry),
                );
                info!(
                    removed = removed,
                    remaining = identities.len(),
                    max_entries = identities.max_entries(),
                    "Evicted identity rate limiters over capacity"
                );
            }
        }

        entry
    }

    /// The bucket for an endpoint path, if the policy overrides it.
    pub fn endpoint(&self, path: &str) -> Option<Arc<LimiterEntry>> {
        let limit = *self.policy.endpoint_limit(path)?;
        let now = self.clock.now();

        if let Some(entry) = self.endpoints.read().get(path, now) {
            return Some(entry);
        }

        let mut endpoints = self.endpoints.write();
        let (entry, created) = endpoints.get_or_insert_with(path, now, || {
            LimiterEntry::new(limit.requests_per_minute, limit.burst, now)
        });
        if created {
            debug!(
                path = %path,
                requests_per_minute = limit.requests_per_minute,
                burst = limit.burst,
                "Creating endpoint rate limiter"
            );
        }

        Some(entry)
    }

    /// Remove keyed buckets idle beyond the idle timeout.
    ///
    /// Buckets that have not yet refilled to capacity are kept.
    pub fn evict_idle(&self) -> RegistrySweep {
        let now = self.clock.now();
        let identities = self
            .identities
            .write()
            .evict_idle(now, |e| e.is_refilling(now));
        let endpoints = self
            .endpoints
            .write()
            .evict_idle(now, |e| e.is_refilling(now));
        RegistrySweep {
            identities,
            endpoints,
        }
    }

    /// Number of identity buckets.
    pub fn identity_count(&self) -> usize {
        self.identities.read().len()
    }

    /// Number of endpoint buckets.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.read().len()
    }

    /// Maximum number of identity buckets before eviction kicks in.
    pub fn max_identities(&self) -> usize {
        self.identities.read().max_entries()
    }

    /// Whether a bucket exists for an identity, without creating one.
    pub fn contains_identity(&self, identity: &str) -> bool {
        self.identities.read().index_of(identity).is_some()
    }

    /// The policy these buckets were built from.
    pub fn policy(&self) -> &Arc<RateLimitPolicy> {
        &self.policy
    }

    /// Drop every keyed bucket.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.identities.write().clear();
        self.endpoints.write().clear();
    }
}
