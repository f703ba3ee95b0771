//! Token bucket primitive.

use std::time::Instant;

/// Retry hint returned when a bucket can never refill on its own
/// (zero rate or zero burst). One policy minute.
pub const UNREFILLABLE_RETRY_AFTER_SECS: u64 = 60;

/// Outcome of a single [`TokenBucket::try_acquire`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Acquire {
    /// Whether one unit of work may proceed
    pub allowed: bool,
    /// Tokens left after the call (post-subtraction when allowed)
    pub tokens_remaining: f64,
    /// Bucket capacity (the configured burst)
    pub capacity: f64,
    /// Refill rate in tokens per second
    pub refill_rate: f64,
}

impl Acquire {
    /// Whole tokens left, as advertised in `X-RateLimit-Remaining`.
    pub fn remaining(&self) -> u64 {
        self.tokens_remaining.max(0.0).floor() as u64
    }

    /// Capacity as advertised in `X-RateLimit-Limit`.
    pub fn limit(&self) -> u64 {
        self.capacity.max(0.0).round() as u64
    }

    /// Seconds until at least one token is available, never less than one.
    pub fn retry_after_secs(&self) -> u64 {
        if !self.can_refill() {
            return UNREFILLABLE_RETRY_AFTER_SECS;
        }
        let missing = (1.0 - self.tokens_remaining).max(0.0);
        ((missing / self.refill_rate).ceil() as u64).max(1)
    }

    /// Seconds until the bucket is full again.
    pub fn secs_until_full(&self) -> u64 {
        let missing = (self.capacity - self.tokens_remaining).max(0.0);
        if missing == 0.0 {
            return 0;
        }
        if self.refill_rate <= 0.0 {
            return UNREFILLABLE_RETRY_AFTER_SECS;
        }
        (missing / self.refill_rate).ceil() as u64
    }

    fn can_refill(&self) -> bool {
        self.refill_rate > 0.0 && self.capacity >= 1.0
    }
}

/// A lazily refilled token bucket.
///
/// There is no background timer: tokens are topped up from the elapsed time
/// on each call. The bucket itself is not synchronized; its owner wraps it in
/// a lock (see [`LimiterEntry`](super::LimiterEntry)).
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket from a per-minute rate and a burst size.
    ///
    /// A zero rate or a zero burst always rejects: the bucket starts empty
    /// and never refills.
    pub fn new(requests_per_minute: u32, burst: u32, now: Instant) -> Self {
        let capacity = f64::from(burst);
        let tokens = if requests_per_minute == 0 { 0.0 } else { capacity };
        Self {
            tokens,
            capacity,
            refill_rate: f64::from(requests_per_minute) / 60.0,
            last_refill: now,
        }
    }

    /// Refill from elapsed time, then try to take one token.
    pub fn try_acquire(&mut self, now: Instant) -> Acquire {
        self.refill(now);

        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }

        debug_assert!(
            self.tokens >= 0.0 && self.tokens <= self.capacity,
            "token count {} outside [0, {}]",
            self.tokens,
            self.capacity
        );

        Acquire {
            allowed,
            tokens_remaining: self.tokens,
            capacity: self.capacity,
            refill_rate: self.refill_rate,
        }
    }

    /// Current token count after refilling up to `now`.
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// When the bucket was last refilled.
    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    fn refill(&mut self, now: Instant) {
        // A clock reading older than last_refill contributes nothing.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_capacity_then_reject() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(60, 3, now);

        for i in 0..3 {
            assert!(bucket.try_acquire(now).allowed, "request {} should pass", i + 1);
        }

        let result = bucket.try_acquire(now);
        assert!(!result.allowed);
        assert_eq!(result.tokens_remaining, 0.0);
    }

    #[test]
    fn test_one_refill_interval_admits_exactly_one() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(60, 3, start); // 1 token/second

        for _ in 0..3 {
            bucket.try_acquire(start);
        }
        assert!(!bucket.try_acquire(start).allowed);

        let later = start + Duration::from_secs(1);
        assert!(bucket.try_acquire(later).allowed);
        assert!(!bucket.try_acquire(later).allowed);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(600, 5, start);
        bucket.try_acquire(start);

        let much_later = start + Duration::from_secs(3600);
        assert_eq!(bucket.available(much_later), 5.0);
    }

    #[test]
    fn test_fractional_refill_at_low_rate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1, 1, start); // one token per minute
        assert!(bucket.try_acquire(start).allowed);

        let half = start + Duration::from_secs(30);
        let result = bucket.try_acquire(half);
        assert!(!result.allowed);
        assert!((result.tokens_remaining - 0.5).abs() < 1e-9);

        let full = start + Duration::from_secs(60);
        assert!(bucket.try_acquire(full).allowed);
    }

    #[test]
    fn test_remaining_reports_post_subtraction() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(600, 5, now);

        let result = bucket.try_acquire(now);
        assert!(result.allowed);
        assert_eq!(result.remaining(), 4);
        assert_eq!(result.limit(), 5);
    }

    #[test]
    fn test_retry_after_rounds_up_with_floor_of_one() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(600, 1, now); // 10 tokens/second
        bucket.try_acquire(now);

        let result = bucket.try_acquire(now);
        assert!(!result.allowed);
        assert_eq!(result.retry_after_secs(), 1);

        let mut slow = TokenBucket::new(6, 1, now); // 0.1 tokens/second
        slow.try_acquire(now);
        assert_eq!(slow.try_acquire(now).retry_after_secs(), 10);
    }

    #[test]
    fn test_zero_rate_always_rejects_with_finite_retry() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(0, 5, start);

        let result = bucket.try_acquire(start);
        assert!(!result.allowed);
        assert_eq!(result.remaining(), 0);
        assert_eq!(result.limit(), 5);
        assert_eq!(result.retry_after_secs(), UNREFILLABLE_RETRY_AFTER_SECS);

        let later = start + Duration::from_secs(86_400);
        let result = bucket.try_acquire(later);
        assert!(!result.allowed);
        assert_eq!(result.retry_after_secs(), UNREFILLABLE_RETRY_AFTER_SECS);
        assert_eq!(result.secs_until_full(), UNREFILLABLE_RETRY_AFTER_SECS);
    }

    #[test]
    fn test_zero_burst_always_rejects() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(600, 0, now);

        let result = bucket.try_acquire(now + Duration::from_secs(10));
        assert!(!result.allowed);
        assert_eq!(result.retry_after_secs(), UNREFILLABLE_RETRY_AFTER_SECS);
    }

    #[test]
    fn test_secs_until_full() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(60, 4, now);

        let result = bucket.try_acquire(now);
        assert_eq!(result.secs_until_full(), 1);

        bucket.try_acquire(now);
        let result = bucket.try_acquire(now);
        assert_eq!(result.secs_until_full(), 3);
    }

    #[test]
    fn test_stale_timestamp_does_not_rewind() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(60, 2, start + Duration::from_secs(5));
        bucket.try_acquire(start + Duration::from_secs(5));

        // Earlier reading from a racing caller
        let result = bucket.try_acquire(start);
        assert!(result.allowed);
        assert_eq!(bucket.last_refill(), start + Duration::from_secs(5));
    }
}
