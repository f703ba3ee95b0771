//! Decision counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::decision::RejectReason;
use super::registry::Scope;

/// Lock-free tallies of gate outcomes, readable by a metrics exporter.
#[derive(Debug, Default)]
pub struct GateStats {
    allowed: AtomicU64,
    whitelisted: AtomicU64,
    rejected_global: AtomicU64,
    rejected_identity: AtomicU64,
    rejected_endpoint: AtomicU64,
    blocked: AtomicU64,
}

/// Point-in-time copy of [`GateStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub allowed: u64,
    pub whitelisted: u64,
    pub rejected_global: u64,
    pub rejected_identity: u64,
    pub rejected_endpoint: u64,
    pub blocked: u64,
}

impl StatsSnapshot {
    /// All rejections, rate limited or blocked.
    pub fn rejected(&self) -> u64 {
        self.rejected_global + self.rejected_identity + self.rejected_endpoint + self.blocked
    }

    /// Every decision counted.
    pub fn total(&self) -> u64 {
        self.allowed + self.whitelisted + self.rejected()
    }
}

impl GateStats {
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_whitelisted(&self) {
        self.whitelisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::RateLimited(Scope::Global) => &self.rejected_global,
            RejectReason::RateLimited(Scope::Identity) => &self.rejected_identity,
            RejectReason::RateLimited(Scope::Endpoint) => &self.rejected_endpoint,
            RejectReason::Blocked => &self.blocked,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            whitelisted: self.whitelisted.load(Ordering::Relaxed),
            rejected_global: self.rejected_global.load(Ordering::Relaxed),
            rejected_identity: self.rejected_identity.load(Ordering::Relaxed),
            rejected_endpoint: self.rejected_endpoint.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }
}
