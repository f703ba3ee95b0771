//! Periodic sweep of idle limiter and pattern state.
//!
//! The reaper is a tokio task owned through a [`ReaperHandle`]. Stopping the
//! handle (or dropping it) signals the task over a broadcast channel; `stop`
//! also waits for the task to finish.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::pattern::PatternTracker;
use super::registry::ScopedLimiterRegistry;
use crate::error::{FloodgateError, Result};

/// Entries removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub identities: usize,
    pub endpoints: usize,
    pub patterns: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.identities + self.endpoints + self.patterns
    }
}

/// Evicts idle entries from the registry and the pattern tracker.
#[derive(Clone)]
pub struct Reaper {
    registry: Arc<ScopedLimiterRegistry>,
    tracker: Option<Arc<PatternTracker>>,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        registry: Arc<ScopedLimiterRegistry>,
        tracker: Option<Arc<PatternTracker>>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            tracker,
            interval,
        }
    }

    /// Run one sweep now.
    pub fn sweep(&self) -> SweepReport {
        let registry = self.registry.evict_idle();
        let patterns = self.tracker.as_ref().map_or(0, |t| t.evict_idle());

        SweepReport {
            identities: registry.identities,
            endpoints: registry.endpoints,
            patterns,
        }
    }

    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// The first sweep runs one interval after the start.
    pub fn start(self) -> ReaperHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let interval = self.interval;

        info!(interval_secs = interval.as_secs_f64(), "Starting reaper");
        let task = tokio::spawn(self.run(shutdown_rx));

        ReaperHandle { shutdown_tx, task }
    }

    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    debug!("reaper received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    let report = self.sweep();
                    if report.total() > 0 {
                        info!(
                            identities = report.identities,
                            endpoints = report.endpoints,
                            patterns = report.patterns,
                            "Reaper evicted idle entries"
                        );
                    } else {
                        debug!("Reaper sweep found nothing idle");
                    }
                }
            }
        }

        info!("Reaper stopped");
    }
}

/// Owner of a running reaper task.
pub struct ReaperHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal the task and wait for it to exit.
    pub async fn stop(self) -> Result<()> {
        // The receiver is gone only if the task already exited.
        let _ = self.shutdown_tx.send(());
        self.task
            .await
            .map_err(|e| FloodgateError::Reaper(e.to_string()))
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::config::{PatternConfig, RegistryConfig};
    use crate::ratelimit::RateLimitPolicy;

    fn parts() -> (Arc<ScopedLimiterRegistry>, Arc<PatternTracker>, Arc<MockClock>) {
        let clock = Arc::new(MockClock::default());
        let config = RegistryConfig::default();
        let registry = Arc::new(ScopedLimiterRegistry::new(
            Arc::new(RateLimitPolicy::default()),
            &config,
            clock.clone(),
        ));
        let tracker = Arc::new(PatternTracker::new(
            PatternConfig::default(),
            config.idle_timeout(),
            clock.clone(),
        ));
        (registry, tracker, clock)
    }

    #[test]
    fn test_sweep_removes_idle_entries() {
        let (registry, tracker, clock) = parts();
        registry.identity("a");
        registry.endpoint("/api/deploy");
        tracker.observe("a:");

        let reaper = Reaper::new(registry.clone(), Some(tracker.clone()), Duration::from_secs(300));
        assert_eq!(reaper.sweep().total(), 0);

        clock.advance(Duration::from_secs(601));
        let report = reaper.sweep();
        assert_eq!(
            report,
            SweepReport {
                identities: 1,
                endpoints: 1,
                patterns: 1
            }
        );
        assert_eq!(registry.identity_count(), 0);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_periodic_sweep_and_stop() {
        let (registry, tracker, clock) = parts();
        registry.identity("a");
        clock.advance(Duration::from_secs(601));

        let handle = Reaper::new(registry.clone(), Some(tracker), Duration::from_millis(20)).start();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while registry.identity_count() > 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.identity_count(), 0);

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_first_tick() {
        let (registry, _tracker, _clock) = parts();
        let handle = Reaper::new(registry, None, Duration::from_secs(3600)).start();
        assert!(!handle.is_finished());
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_task() {
        let (registry, _tracker, _clock) = parts();
        let handle = Reaper::new(registry.clone(), None, Duration::from_secs(3600)).start();
        drop(handle);

        // The task holds the only other registry reference.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while Arc::strong_count(&registry) > 1 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(Arc::strong_count(&registry), 1);
    }
}
