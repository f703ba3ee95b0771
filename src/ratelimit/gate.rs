//! Per-request admission gate.

use std::sync::Arc;

use serde::Serialize;
use tracing::{trace, warn};

use super::bucket::Acquire;
use super::decision::{Decision, Quota, RejectReason};
use super::pattern::{pattern_key, PatternState, PatternTracker};
use super::policy::RateLimitPolicy;
use super::registry::{Scope, ScopedLimiterRegistry};
use super::stats::{GateStats, StatsSnapshot};
use crate::clock::Clock;

/// What the transport knows about an inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestInfo {
    /// Client identity, normally the remote address
    pub identity: String,
    /// Request path, matched exactly against endpoint overrides
    pub path: String,
    /// `User-Agent` header, if any
    pub user_agent: Option<String>,
}

impl RequestInfo {
    pub fn new(identity: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            path: path.into(),
            user_agent: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Decides, per request, whether to admit, throttle or block.
///
/// Checks run in a fixed order and the first failure wins: whitelist,
/// global bucket, identity bucket, endpoint bucket (only for overridden
/// paths), then the pattern tracker. A token taken by an earlier scope is not
/// returned when a later one rejects.
pub struct RateLimitGate {
    policy: Arc<RateLimitPolicy>,
    registry: Arc<ScopedLimiterRegistry>,
    tracker: Option<Arc<PatternTracker>>,
    clock: Arc<dyn Clock>,
    stats: GateStats,
}

impl RateLimitGate {
    /// Create a gate over an existing registry and optional pattern tracker.
    pub fn new(
        registry: Arc<ScopedLimiterRegistry>,
        tracker: Option<Arc<PatternTracker>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy: Arc::clone(registry.policy()),
            registry,
            tracker,
            clock,
            stats: GateStats::default(),
        }
    }

    /// Evaluate a request known only by identity and path.
    ///
    /// The pattern tracker, if enabled, keys this identity with an empty
    /// user agent.
    pub fn evaluate(&self, identity: &str, endpoint_path: &str) -> Decision {
        self.check(identity, endpoint_path, None)
    }

    /// Evaluate a request.
    pub fn evaluate_request(&self, request: &RequestInfo) -> Decision {
        self.check(&request.identity, &request.path, request.user_agent.as_deref())
    }

    /// Outcome counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn policy(&self) -> &Arc<RateLimitPolicy> {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<ScopedLimiterRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> Option<&Arc<PatternTracker>> {
        self.tracker.as_ref()
    }

    fn check(&self, identity: &str, path: &str, user_agent: Option<&str>) -> Decision {
        if self.policy.is_whitelisted(identity) {
            trace!(identity = %identity, path = %path, "Whitelisted identity admitted");
            self.stats.record_whitelisted();
            return Decision::whitelisted();
        }

        let now = self.clock.now();

        let acquire = self.registry.global().try_acquire(now);
        if !acquire.allowed {
            warn!(identity = %identity, path = %path, "global rate limit exceeded");
            return self.rate_limited(Scope::Global, &acquire);
        }

        let acquire = self.registry.identity(identity).try_acquire(now);
        if !acquire.allowed {
            warn!(identity = %identity, path = %path, "identity rate limit exceeded");
            return self.rate_limited(Scope::Identity, &acquire);
        }
        let mut quota = Quota::from_acquire(Scope::Identity, &acquire);

        if let Some(entry) = self.registry.endpoint(path) {
            let acquire = entry.try_acquire(now);
            if !acquire.allowed {
                warn!(identity = %identity, path = %path, "endpoint rate limit exceeded");
                return self.rate_limited(Scope::Endpoint, &acquire);
            }
            quota = Quota::from_acquire(Scope::Endpoint, &acquire);
        }

        if let Some(tracker) = &self.tracker {
            let state = tracker.observe(&pattern_key(identity, user_agent));
            if let PatternState::Blocked { .. } = state {
                warn!(
                    identity = %identity,
                    path = %path,
                    user_agent = user_agent.unwrap_or_default(),
                    retry_after = state.retry_after_secs(),
                    "blocked request from suspicious pattern"
                );
                self.stats.record_rejected(RejectReason::Blocked);
                return Decision::reject(
                    RejectReason::Blocked,
                    quota,
                    state.retry_after_secs(),
                    self.policy.include_headers,
                    self.clock.unix_now(),
                );
            }
        }

        trace!(
            identity = %identity,
            path = %path,
            scope = %quota.scope,
            remaining = quota.remaining,
            "Request admitted"
        );
        self.stats.record_allowed();
        Decision::allow(quota, self.policy.include_headers, self.clock.unix_now())
    }

    fn rate_limited(&self, scope: Scope, acquire: &Acquire) -> Decision {
        let reason = RejectReason::RateLimited(scope);
        self.stats.record_rejected(reason);
        Decision::reject(
            reason,
            Quota::from_acquire(scope, acquire),
            acquire.retry_after_secs(),
            self.policy.include_headers,
            self.clock.unix_now(),
        )
    }
}
