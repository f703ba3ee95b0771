//! Request admission: token-bucket rate limiting and burst-abuse blocking.

mod bucket;
mod cache;
mod decision;
mod gate;
mod pattern;
mod policy;
mod reaper;
mod registry;
mod service;
mod stats;

pub use bucket::{Acquire, TokenBucket, UNREFILLABLE_RETRY_AFTER_SECS};
pub use cache::{BoundedCache, CacheIndex};
pub use decision::{
    Decision, Quota, RejectBody, RejectReason, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET,
    HEADER_RETRY_AFTER, TOO_MANY_REQUESTS,
};
pub use gate::{RateLimitGate, RequestInfo};
pub use pattern::{pattern_key, PatternRecord, PatternState, PatternTracker};
pub use policy::{EndpointLimit, RateLimitPolicy};
pub use reaper::{Reaper, ReaperHandle, SweepReport};
pub use registry::{LimiterEntry, RegistrySweep, Scope, ScopedLimiterRegistry};
pub use service::RateLimiterService;
pub use stats::{GateStats, StatsSnapshot};
