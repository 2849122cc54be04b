//! Background eviction of expired blocks and stale window state

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Millis;
use crate::monitor::{SecurityMonitor, SweepReport};

/// Periodic maintenance task bound to one monitor.
///
/// Nothing runs until [`Sweeper::start`]; [`Sweeper::stop`] cancels the
/// loop and waits for it to exit.
pub struct Sweeper {
    monitor: Arc<SecurityMonitor>,
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    passes: Arc<AtomicU64>,
}

impl Sweeper {
    /// Spawn the sweep loop on the current tokio runtime
    pub fn start(monitor: Arc<SecurityMonitor>, interval: Duration) -> Self {
        let (cancel, mut cancelled) = watch::channel(false);
        let passes = Arc::new(AtomicU64::new(0));

        let task_monitor = monitor.clone();
        let task_passes = passes.clone();
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "Sweeper started");

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        task_monitor.sweep();
                        task_passes.fetch_add(1, Ordering::Relaxed);
                    }
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Sweeper stopped");
        });

        Self {
            monitor,
            cancel,
            handle: Some(handle),
            passes,
        }
    }

    /// One pass at an explicit instant, independent of the background loop
    pub fn tick(&self, now: Millis) -> SweepReport {
        let report = self.monitor.sweep_at(now);
        self.passes.fetch_add(1, Ordering::Relaxed);
        report
    }

    /// Completed passes, background and manual
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub async fn stop(&mut self) {
        let _ = self.cancel.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Sweeper task ended abnormally: {}", e);
            }
        }
        debug!(passes = self.passes(), "Sweeper joined");
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, HOUR_MS};
    use crate::config::Config;
    use crate::models::RequestView;

    fn monitor(clock: Arc<ManualClock>) -> Arc<SecurityMonitor> {
        Arc::new(SecurityMonitor::with_clock(&Config::default(), clock))
    }

    #[tokio::test]
    async fn test_tick_evicts_expired_blocks() {
        let clock = Arc::new(ManualClock::new(1_000));
        let monitor = monitor(clock.clone());
        monitor.block("203.0.113.9", HOUR_MS);

        let mut sweeper = Sweeper::start(monitor.clone(), Duration::from_secs(3600));
        assert_eq!(sweeper.tick(1_000 + HOUR_MS - 1).blocks, 0);
        assert_eq!(sweeper.tick(1_000 + HOUR_MS).blocks, 1);
        assert!(monitor.blocked_ids().is_empty());
        sweeper.stop().await;
    }

    #[tokio::test]
    async fn test_background_loop_runs_and_stops() {
        let clock = Arc::new(ManualClock::new(0));
        let monitor = monitor(clock.clone());
        monitor.check(&RequestView::new("198.51.100.7", "GET", "/api/items"));

        let mut sweeper = Sweeper::start(monitor.clone(), Duration::from_millis(10));
        clock.advance(2 * HOUR_MS);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sweeper.is_running());
        assert!(sweeper.passes() >= 2);
        // the idle client and its rate window are gone
        assert_eq!(monitor.sweep().total(), 0);

        sweeper.stop().await;
        assert!(!sweeper.is_running());
        let after = sweeper.passes();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(sweeper.passes(), after);
    }
}
