//! Brute Force Attack Detection Module
//!
//! Counts login attempts per `(client, endpoint)` in a sliding window and
//! fires when the count inside the window exceeds the threshold.
//!
//! By default every request to an auth-class route is an attempt, because
//! the guard runs before the handler knows the outcome. With `failed_only`
//! set, requests are not counted on the way in; handlers report rejected
//! credentials through [`BruteForceTracker::record_failure`] instead.
//!
//! # Example
//! ```ignore
//! use crguard::detect::{BruteForceConfig, BruteForceTracker};
//!
//! let tracker = BruteForceTracker::with_config(config, auth_routes);
//!
//! if let Some(alert) = tracker.record_attempt(client_id, path, now) {
//!     println!("Brute force detected: {} attempts from {}", alert.attempt_count, alert.client_id);
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use super::{Detection, Detector};
use crate::clock::{Millis, SECOND_MS};
use crate::error::DetectorError;
use crate::models::{RequestView, SecurityEventType};
use crate::window::WindowCounter;

/// Configuration for brute force detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BruteForceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Attempts allowed inside the window; one more fires
    #[serde(default = "default_threshold")]
    pub threshold: usize,

    /// Time window for counting attempts (seconds)
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Count only failures reported by handlers, not every auth request
    #[serde(default)]
    pub failed_only: bool,
}

impl BruteForceConfig {
    pub fn window_ms(&self) -> Millis {
        self.window_secs * SECOND_MS
    }
}

impl Default for BruteForceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_threshold(),
            window_secs: default_window_secs(),
            failed_only: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> usize {
    10
}

fn default_window_secs() -> u64 {
    900 // 15 minutes
}

/// Brute force attack tracker
#[derive(Debug)]
pub struct BruteForceTracker {
    config: BruteForceConfig,
    /// Route prefixes that count as authentication
    auth_routes: Vec<String>,
    /// Attempt history per `client|endpoint`
    attempts: WindowCounter,
    total_alerts: AtomicUsize,
}

impl BruteForceTracker {
    pub fn with_config(config: BruteForceConfig, auth_routes: Vec<String>) -> Self {
        Self {
            config,
            auth_routes,
            attempts: WindowCounter::new(),
            total_alerts: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &BruteForceConfig {
        &self.config
    }

    /// Check if a path belongs to an authentication route
    pub fn is_auth_route(&self, path: &str) -> bool {
        self.auth_routes.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Record one inbound request and return an alert once the threshold is
    /// exceeded. Non-auth routes are ignored, as is everything in
    /// `failed_only` mode.
    pub fn record_attempt(&self, client_id: &str, path: &str, now: Millis) -> Option<BruteForceAlert> {
        if self.config.failed_only {
            return None;
        }
        self.count_attempt(client_id, path, now)
    }

    /// Record a rejected login reported after the handler ran
    pub fn record_failure(&self, client_id: &str, path: &str, now: Millis) -> Option<BruteForceAlert> {
        self.count_attempt(client_id, path, now)
    }

    fn count_attempt(&self, client_id: &str, path: &str, now: Millis) -> Option<BruteForceAlert> {
        if !self.config.enabled || !self.is_auth_route(path) {
            return None;
        }

        let key = WindowCounter::key(client_id, path);
        let count = self
            .attempts
            .record_and_count(&key, now, self.config.window_ms());

        if count <= self.config.threshold {
            return None;
        }

        self.total_alerts.fetch_add(1, Ordering::Relaxed);
        debug!(
            client = %client_id,
            endpoint = %path,
            attempts = count,
            "Brute force threshold exceeded"
        );

        Some(BruteForceAlert {
            client_id: client_id.to_string(),
            endpoint: path.to_string(),
            attempt_count: count,
            window_secs: self.config.window_secs,
        })
    }

    /// Attempts currently inside the window for one target
    pub fn attempts(&self, client_id: &str, path: &str, now: Millis) -> usize {
        let key = WindowCounter::key(client_id, path);
        self.attempts.count(&key, now, self.config.window_ms())
    }

    /// Get total alerts triggered
    pub fn total_alerts(&self) -> usize {
        self.total_alerts.load(Ordering::Relaxed)
    }

    /// Get number of targets being tracked
    pub fn tracked_targets(&self) -> usize {
        self.attempts.len()
    }

    /// Clear all tracking data
    pub fn clear(&self) {
        self.attempts.clear();
        self.total_alerts.store(0, Ordering::Relaxed);
    }

    /// Drop targets with no attempts left in the window
    pub fn cleanup_expired(&self, now: Millis) -> usize {
        self.attempts.sweep(now, self.config.window_ms())
    }
}

impl Detector for BruteForceTracker {
    fn name(&self) -> &'static str {
        "brute_force"
    }

    fn inspect(&self, request: &RequestView, now: Millis) -> Result<Option<Detection>, DetectorError> {
        Ok(self
            .record_attempt(&request.client_id, &request.path, now)
            .map(|alert| alert.to_detection()))
    }
}

/// Brute force attack alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BruteForceAlert {
    pub client_id: String,
    /// Authentication endpoint being attacked
    pub endpoint: String,
    /// Number of attempts inside the window, including this one
    pub attempt_count: usize,
    pub window_secs: u64,
}

impl BruteForceAlert {
    pub fn to_detection(&self) -> Detection {
        Detection::new(
            SecurityEventType::BruteForce,
            "brute_force",
            format!(
                "{} attempts in {}s on {}",
                self.attempt_count, self.window_secs, self.endpoint
            ),
        )
        .with_detail("endpoint", self.endpoint.clone())
        .with_detail("attemptCount", self.attempt_count)
        .with_detail("windowSecs", self.window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MINUTE_MS;

    fn tracker(threshold: usize) -> BruteForceTracker {
        let config = BruteForceConfig {
            threshold,
            ..BruteForceConfig::default()
        };
        BruteForceTracker::with_config(config, vec!["/api/auth/login".to_string()])
    }

    #[test]
    fn test_eleventh_attempt_fires() {
        let tracker = tracker(10);

        for i in 0..10 {
            let alert = tracker.record_attempt("10.0.0.5", "/api/auth/login", i * 1_000);
            assert!(alert.is_none(), "attempt {} fired early", i + 1);
        }

        let alert = tracker
            .record_attempt("10.0.0.5", "/api/auth/login", 10_000)
            .unwrap();
        assert_eq!(alert.attempt_count, 11);
        assert_eq!(alert.window_secs, 900);
        assert_eq!(tracker.total_alerts(), 1);
    }

    #[test]
    fn test_attempts_outside_window_do_not_count() {
        let tracker = tracker(2);
        tracker.record_attempt("a", "/api/auth/login", 0);
        tracker.record_attempt("a", "/api/auth/login", 1_000);

        // both slid out of the 15 minute window
        let later = 16 * MINUTE_MS;
        assert!(tracker.record_attempt("a", "/api/auth/login", later).is_none());
        assert_eq!(tracker.attempts("a", "/api/auth/login", later), 1);
    }

    #[test]
    fn test_non_auth_route_ignored() {
        let tracker = tracker(1);
        for t in 0..20 {
            assert!(tracker.record_attempt("a", "/api/tasks", t).is_none());
        }
        assert_eq!(tracker.tracked_targets(), 0);
    }

    #[test]
    fn test_targets_are_independent() {
        let tracker = tracker(1);
        tracker.record_attempt("a", "/api/auth/login", 0);
        assert!(tracker.record_attempt("b", "/api/auth/login", 1).is_none());
        assert!(tracker.record_attempt("a", "/api/auth/login", 2).is_some());
    }

    #[test]
    fn test_cleanup_expired() {
        let tracker = tracker(10);
        tracker.record_attempt("a", "/api/auth/login", 0);
        tracker.record_attempt("b", "/api/auth/login", 20 * MINUTE_MS);

        assert_eq!(tracker.cleanup_expired(20 * MINUTE_MS), 1);
        assert_eq!(tracker.tracked_targets(), 1);
    }

    #[test]
    fn test_failed_only_counts_reported_failures() {
        let config = BruteForceConfig {
            threshold: 2,
            failed_only: true,
            ..BruteForceConfig::default()
        };
        let tracker = BruteForceTracker::with_config(config, vec!["/api/auth/login".to_string()]);

        // successful logins pass through the detector uncounted
        for t in 0..10 {
            assert!(tracker.record_attempt("a", "/api/auth/login", t).is_none());
        }
        assert_eq!(tracker.attempts("a", "/api/auth/login", 10), 0);

        assert!(tracker.record_failure("a", "/api/auth/login", 20).is_none());
        assert!(tracker.record_failure("a", "/api/auth/login", 30).is_none());
        let alert = tracker.record_failure("a", "/api/auth/login", 40).unwrap();
        assert_eq!(alert.attempt_count, 3);
        assert!(tracker.record_failure("a", "/api/tasks", 50).is_none());
    }

    #[test]
    fn test_detection_shape() {
        let tracker = tracker(0);
        let req = RequestView::new("a", "POST", "/api/auth/login");
        let hit = tracker.inspect(&req, 0).unwrap().unwrap();
        assert_eq!(hit.event_type, SecurityEventType::BruteForce);
        assert_eq!(hit.details["attemptCount"], 1);
    }
}
