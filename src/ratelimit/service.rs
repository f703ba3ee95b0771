//! The admission service: one value owning all limiter state.
//!
//! Build one per process (or per test) and share it by reference or `Arc`
//! with request handlers. Nothing here is global, so independent instances
//! can coexist.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use super::decision::Decision;
use super::gate::{RateLimitGate, RequestInfo};
use super::pattern::PatternTracker;
use super::reaper::{Reaper, ReaperHandle};
use super::registry::ScopedLimiterRegistry;
use super::stats::StatsSnapshot;
use crate::clock::{Clock, SystemClock};
use crate::config::FloodgateConfig;
use crate::error::Result;

/// Owns the registry, pattern tracker and gate built from one configuration.
pub struct RateLimiterService {
    instance_id: Uuid,
    config: FloodgateConfig,
    gate: RateLimitGate,
}

impl RateLimiterService {
    /// Validate the configuration and build the service on the system clock.
    pub fn new(config: FloodgateConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Validate the configuration and build the service on a given clock.
    pub fn with_clock(config: FloodgateConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let instance_id = Uuid::new_v4();
        let policy = Arc::new(config.policy.clone());

        let registry = Arc::new(ScopedLimiterRegistry::new(
            policy,
            &config.registry,
            Arc::clone(&clock),
        ));

        let tracker = config.pattern.enabled.then(|| {
            Arc::new(PatternTracker::new(
                config.pattern.clone(),
                config.registry.idle_timeout(),
                Arc::clone(&clock),
            ))
        });

        let gate = RateLimitGate::new(registry, tracker, clock);

        info!(
            instance = %instance_id,
            global_rpm = config.policy.global_requests_per_minute,
            global_burst = config.policy.global_burst,
            identity_rpm = config.policy.per_identity_requests_per_minute,
            identity_burst = config.policy.per_identity_burst,
            endpoint_overrides = config.policy.endpoint_overrides.len(),
            whitelist = config.policy.whitelist.len(),
            pattern_tracking = config.pattern.enabled,
            "Rate limiter service initialized"
        );

        Ok(Self {
            instance_id,
            config,
            gate,
        })
    }

    /// Decide on one request.
    pub fn check(&self, request: &RequestInfo) -> Decision {
        let decision = self.gate.evaluate_request(request);
        debug!(
            instance = %self.instance_id,
            identity = %request.identity,
            path = %request.path,
            allowed = decision.allowed,
            "Admission decision made"
        );
        decision
    }

    /// Decide on a request known only by identity and path.
    pub fn evaluate(&self, identity: &str, endpoint_path: &str) -> Decision {
        self.gate.evaluate(identity, endpoint_path)
    }

    /// A reaper over this service's state, not yet started.
    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            Arc::clone(self.gate.registry()),
            self.gate.tracker().cloned(),
            self.config.reaper.interval(),
        )
    }

    /// Start the background reaper if the configuration enables it.
    ///
    /// Must be called from within a tokio runtime. Keep the handle and call
    /// [`ReaperHandle::stop`] during shutdown.
    pub fn start_reaper(&self) -> Option<ReaperHandle> {
        if !self.config.reaper.enabled {
            info!(instance = %self.instance_id, "Reaper disabled by configuration");
            return None;
        }
        Some(self.reaper().start())
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &FloodgateConfig {
        &self.config
    }

    pub fn gate(&self) -> &RateLimitGate {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<ScopedLimiterRegistry> {
        self.gate.registry()
    }

    pub fn tracker(&self) -> Option<&Arc<PatternTracker>> {
        self.gate.tracker()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.gate.stats()
    }
}
