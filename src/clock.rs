//! Time source abstraction.
//!
//! Every component reads time through [`Clock`] so tests can drive refill,
//! burst windows, blocks and idle eviction deterministically.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Monotonic timestamp used for all interval arithmetic.
    fn now(&self) -> Instant;

    /// Current Unix time in seconds, used only for response headers.
    fn unix_now(&self) -> i64;
}

/// Real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Manually advanced clock for tests.
///
/// Starts at the real `Instant::now()` of construction and only moves when
/// [`advance`](MockClock::advance) is called.
#[derive(Debug)]
pub struct MockClock {
    origin: Instant,
    origin_unix: i64,
    offset: Mutex<Duration>,
}

impl MockClock {
    /// Create a mock clock whose wall-clock reading starts at `unix_start`.
    pub fn new(unix_start: i64) -> Self {
        Self {
            origin: Instant::now(),
            origin_unix: unix_start,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Total time advanced since construction.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(1_700_000_000)
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    fn unix_now(&self) -> i64 {
        self.origin_unix + self.offset.lock().as_secs() as i64
    }
}
