//! Short-window burst detection.
//!
//! Each client pattern key (address plus user agent) gets a record counting
//! requests in the current window. Going over the burst threshold blocks the
//! key for a fixed duration. Blocks expire lazily, the next time the key is
//! observed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::cache::BoundedCache;
use crate::clock::Clock;
use crate::config::PatternConfig;

/// Build the key the tracker counts under.
///
/// Clients behind one address with different agents are tracked apart; a
/// missing agent is treated as empty.
pub fn pattern_key(identity: &str, user_agent: Option<&str>) -> String {
    format!("{}:{}", identity, user_agent.unwrap_or_default())
}

/// Result of observing one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternState {
    /// Under the threshold
    Normal,
    /// Blocked for at least `remaining` longer
    Blocked { remaining: Duration },
}

impl PatternState {
    /// Whether the request must be rejected.
    pub fn is_blocked(&self) -> bool {
        matches!(self, PatternState::Blocked { .. })
    }

    /// Whole seconds until the block lifts, at least one. Zero when not blocked.
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            PatternState::Normal => 0,
            PatternState::Blocked { remaining } => {
                let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                secs.max(1)
            }
        }
    }
}

/// Per-key burst state.
#[derive(Debug, Clone)]
pub struct PatternRecord {
    count: u32,
    window_start: Instant,
    blocked: bool,
    block_until: Instant,
}

impl PatternRecord {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            blocked: false,
            block_until: now,
        }
    }

    /// Requests counted in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether a block is in force at `now`.
    pub fn is_blocked_at(&self, now: Instant) -> bool {
        self.blocked && now < self.block_until
    }

    fn observe(&mut self, now: Instant, rules: &PatternConfig) -> PatternState {
        if self.blocked {
            if now < self.block_until {
                return PatternState::Blocked {
                    remaining: self.block_until - now,
                };
            }
            // Block served; this request opens a fresh window.
            self.blocked = false;
            self.window_start = now;
            self.count = 0;
        }

        if now.saturating_duration_since(self.window_start) < rules.window() {
            self.count = self.count.saturating_add(1);
        } else {
            self.window_start = now;
            self.count = 1;
        }

        if self.count > rules.burst_threshold {
            self.blocked = true;
            self.block_until = now + rules.block_duration();
            return PatternState::Blocked {
                remaining: rules.block_duration(),
            };
        }

        PatternState::Normal
    }
}

/// Tracks request bursts per pattern key and blocks abusive clients.
pub struct PatternTracker {
    rules: PatternConfig,
    clock: Arc<dyn Clock>,
    records: RwLock<BoundedCache<Mutex<PatternRecord>>>,
}

impl PatternTracker {
    /// Create a tracker. Records idle longer than `idle_timeout` become
    /// eligible for eviction unless they are serving a block.
    pub fn new(rules: PatternConfig, idle_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        let records = BoundedCache::new(rules.max_entries, idle_timeout, clock.now());
        Self {
            rules,
            clock,
            records: RwLock::new(records),
        }
    }

    /// Count one request for `key` and report whether it is blocked.
    pub fn observe(&self, key: &str) -> PatternState {
        let now = self.clock.now();
        let record = self.record(key, now);

        let mut record = record.lock();
        let was_blocked = record.blocked;
        let state = record.observe(now, &self.rules);

        match state {
            PatternState::Blocked { .. } if !was_blocked => {
                warn!(
                    key = %key,
                    request_count = record.count,
                    block_secs = self.rules.block_duration_secs,
                    "Blocking suspicious request pattern"
                );
            }
            PatternState::Normal if was_blocked => {
                debug!(key = %key, "Pattern block expired");
            }
            _ => {}
        }

        state
    }

    /// Whether `key` is blocked right now, without counting a request.
    pub fn is_blocked(&self, key: &str) -> bool {
        let now = self.clock.now();
        let record = self.records.read().get(key, now);
        record.is_some_and(|r| r.lock().is_blocked_at(now))
    }

    /// Remove records idle beyond the idle timeout. Active blocks are kept.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        self.records
            .write()
            .evict_idle(now, |r| r.lock().is_blocked_at(now))
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// The thresholds in force.
    pub fn rules(&self) -> &PatternConfig {
        &self.rules
    }

    fn record(&self, key: &str, now: Instant) -> Arc<Mutex<PatternRecord>> {
        if let Some(record) = self.records.read().get(key, now) {
            return record;
        }

        let mut records = self.records.write();
        let (record, created) =
            records.get_or_insert_with(key, now, || Mutex::new(PatternRecord::new(now)));

        if created && records.is_over_capacity() {
            let removed = records.enforce_capacity(
                now,
                |_| false,
                |r| std::ptr::eq(r, &*record) || r.lock().is_blocked_at(now),
            );
            info!(
                removed = removed,
                remaining = records.len(),
                "Evicted pattern records over capacity"
            );
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn tracker() -> (PatternTracker, Arc<MockClock>) {
        tracker_with(PatternConfig::default())
    }

    fn tracker_with(rules: PatternConfig) -> (PatternTracker, Arc<MockClock>) {
        let clock = Arc::new(MockClock::default());
        let tracker = PatternTracker::new(rules, Duration::from_secs(600), clock.clone());
        (tracker, clock)
    }

    #[test]
    fn test_pattern_key() {
        assert_eq!(pattern_key("1.2.3.4", Some("curl/8.0")), "1.2.3.4:curl/8.0");
        assert_eq!(pattern_key("1.2.3.4", None), "1.2.3.4:");
    }

    #[test]
    fn test_threshold_requests_are_allowed() {
        let (tracker, _clock) = tracker();
        for i in 0..10 {
            assert_eq!(tracker.observe("k"), PatternState::Normal, "request {}", i + 1);
        }
    }

    #[test]
    fn test_exceeding_threshold_blocks() {
        let (tracker, _clock) = tracker();
        for _ in 0..10 {
            tracker.observe("k");
        }

        let state = tracker.observe("k");
        assert_eq!(
            state,
            PatternState::Blocked {
                remaining: Duration::from_secs(300)
            }
        );
        assert_eq!(state.retry_after_secs(), 300);
        assert!(tracker.is_blocked("k"));
        assert!(!tracker.is_blocked("other"));
    }

    #[test]
    fn test_blocked_requests_do_not_count() {
        let (tracker, clock) = tracker();
        for _ in 0..11 {
            tracker.observe("k");
        }

        for _ in 0..50 {
            clock.advance(Duration::from_secs(1));
            assert!(tracker.observe("k").is_blocked());
        }

        let record = tracker.record("k", clock.now());
        assert_eq!(record.lock().count(), 11);
    }

    #[test]
    fn test_quiet_period_inside_block_does_not_unblock() {
        let (tracker, clock) = tracker();
        for _ in 0..11 {
            tracker.observe("k");
        }

        clock.advance(Duration::from_secs(299));
        let state = tracker.observe("k");
        assert_eq!(
            state,
            PatternState::Blocked {
                remaining: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_block_expires_into_fresh_window() {
        let (tracker, clock) = tracker();
        for _ in 0..11 {
            tracker.observe("k");
        }

        clock.advance(Duration::from_secs(300));
        assert_eq!(tracker.observe("k"), PatternState::Normal);

        // Fresh window: nine more fit under the threshold
        for _ in 0..9 {
            assert_eq!(tracker.observe("k"), PatternState::Normal);
        }
        assert!(tracker.observe("k").is_blocked());
    }

    #[test]
    fn test_window_resets_after_one_second() {
        let (tracker, clock) = tracker();
        for _ in 0..10 {
            tracker.observe("k");
        }

        clock.advance(Duration::from_secs(1));
        for _ in 0..10 {
            assert_eq!(tracker.observe("k"), PatternState::Normal);
        }
    }

    #[test]
    fn test_keys_are_independent() {
        let (tracker, _clock) = tracker();
        for _ in 0..11 {
            tracker.observe("a");
        }
        assert!(tracker.observe("a").is_blocked());
        assert_eq!(tracker.observe("b"), PatternState::Normal);
    }

    #[test]
    fn test_evict_idle_keeps_active_blocks() {
        let rules = PatternConfig {
            block_duration_secs: 3600,
            ..PatternConfig::default()
        };
        let (tracker, clock) = tracker_with(rules);

        for _ in 0..11 {
            tracker.observe("abuser");
        }
        tracker.observe("quiet");

        clock.advance(Duration::from_secs(601));
        assert_eq!(tracker.evict_idle(), 1);
        assert!(tracker.is_blocked("abuser"));
        assert_eq!(tracker.len(), 1);

        clock.advance(Duration::from_secs(3600));
        assert_eq!(tracker.evict_idle(), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let state = PatternState::Blocked {
            remaining: Duration::from_millis(1_200),
        };
        assert_eq!(state.retry_after_secs(), 2);

        let state = PatternState::Blocked {
            remaining: Duration::from_millis(10),
        };
        assert_eq!(state.retry_after_secs(), 1);
        assert_eq!(PatternState::Normal.retry_after_secs(), 0);
    }
}
