//! Per-request security pipeline
//!
//! `evaluate` moves each request through
//! `UNCHECKED -> Blocked | Detected | RateLimited | Allowed`:
//!
//! 1. an active block rejects immediately
//! 2. detectors run in order; the first hit is logged, tallied and promoted
//!    to a block
//! 3. the route's rate tier is charged
//!
//! A detector that errors or panics is recorded as an operational error and
//! treated as a clean pass, so steps 1 and 3 still protect the request.

use dashmap::DashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::alert::EventSink;
use crate::block::{BlockEntry, BlockReason, BlockRegistry};
use crate::clock::{Clock, Millis, SystemClock};
use crate::config::{BlockingConfig, Config};
use crate::detect::{
    default_detectors, ActivityTracker, BruteForceTracker, Detection, DetectionConfig, Detector,
    ThreatDetector,
};
use crate::error::{DetectorError, OperationalError, OperationalLog, Rejection};
use crate::models::{RequestView, SecurityEvent, SecurityEventType, SecurityStats, TopAttacker};
use crate::rate_limit::{RateDecision, RateLimiter, RateTier};

/// Outcome of one request evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        tier: RateTier,
        remaining: u32,
    },
    Blocked {
        remaining_ms: Millis,
    },
    Detected {
        event_type: SecurityEventType,
        event_id: String,
        block_ms: Millis,
    },
    RateLimited {
        tier: RateTier,
        retry_after_ms: Millis,
        limit: u32,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Client-facing rejection, `None` when the request may proceed
    pub fn into_rejection(self) -> Option<Rejection> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Blocked { .. } => Some(Rejection::blocked()),
            Decision::Detected { .. } => Some(Rejection::violation()),
            Decision::RateLimited { retry_after_ms, .. } => Some(Rejection::rate_limited(retry_after_ms)),
        }
    }
}

/// Entries evicted by one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub blocks: usize,
    pub rate_windows: usize,
    pub brute_force_targets: usize,
    pub idle_clients: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.blocks + self.rate_windows + self.brute_force_targets + self.idle_clients
    }
}

pub struct SecurityMonitor {
    clock: Arc<dyn Clock>,
    blocking: BlockingConfig,
    routes: DetectionConfig,
    top_attackers: usize,

    blocks: BlockRegistry,
    limiter: RateLimiter,
    brute_force: Arc<BruteForceTracker>,
    activity: Arc<ActivityTracker>,
    detectors: Vec<Arc<dyn Detector>>,
    sink: EventSink,

    /// Detections per identifier
    attack_counts: DashMap<String, u64>,
    total_attacks: AtomicU64,
    errors: Arc<OperationalLog>,
}

impl std::fmt::Debug for SecurityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityMonitor")
            .field("detectors", &self.detectors.iter().map(|d| d.name()).collect::<Vec<_>>())
            .field("blocks", &self.blocks.len())
            .field("total_attacks", &self.total_attacks.load(Ordering::Relaxed))
            .finish()
    }
}

impl SecurityMonitor {
    pub fn new(config: &Config) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &Config, clock: Arc<dyn Clock>) -> Self {
        let errors = Arc::new(OperationalLog::default());

        let threats = Arc::new(ThreatDetector::new(&config.detection));
        let brute_force = Arc::new(BruteForceTracker::with_config(
            config.brute_force.clone(),
            config.detection.auth_routes.clone(),
        ));
        let activity = Arc::new(ActivityTracker::new(
            config.anomaly.clone(),
            &config.detection.scanner_agents,
        ));
        let detectors = default_detectors(threats, Arc::clone(&brute_force), Arc::clone(&activity));

        info!(
            detectors = detectors.len(),
            rules = config.detection.sql_patterns.len()
                + config.detection.xss_patterns.len()
                + config.detection.traversal_patterns.len(),
            "Security monitor initialized"
        );

        Self {
            clock,
            blocking: config.blocking.clone(),
            routes: config.detection.clone(),
            top_attackers: config.general.top_attackers,
            blocks: BlockRegistry::new(),
            limiter: RateLimiter::new(config.rate_limits.clone()),
            brute_force,
            activity,
            detectors,
            sink: EventSink::new(config.alert.clone(), &config.redaction, Arc::clone(&errors)),
            attack_counts: DashMap::new(),
            total_attacks: AtomicU64::new(0),
            errors,
        }
    }

    /// Replace the detector chain, keeping evaluation order as given
    pub fn with_detectors(mut self, detectors: Vec<Arc<dyn Detector>>) -> Self {
        self.detectors = detectors;
        self
    }

    pub fn now(&self) -> Millis {
        self.clock.now_ms()
    }

    /// Evaluate against the tier the path maps to
    pub fn check(&self, request: &RequestView) -> Decision {
        let tier = self.classify_tier(&request.path);
        self.evaluate(request, tier)
    }

    pub fn evaluate(&self, request: &RequestView, tier: RateTier) -> Decision {
        let now = self.clock.now_ms();
        let client = request.client_id.as_str();

        if let Some(remaining_ms) = self.blocks.remaining_ms(client, now) {
            debug!(client = %client, path = %request.path, "Rejected blocked client");
            return Decision::Blocked { remaining_ms };
        }

        for detector in &self.detectors {
            if let Some(hit) = self.run_detector(detector.as_ref(), request, now) {
                return self.escalate(request, hit, now);
            }
        }

        match self.limiter.check(client, tier, now) {
            RateDecision::Allowed { remaining } => Decision::Allowed { tier, remaining },
            RateDecision::Limited { retry_after_ms, limit } => Decision::RateLimited {
                tier,
                retry_after_ms,
                limit,
            },
        }
    }

    /// Report rejected credentials for `request`. Returns the detection when
    /// this failure crosses the brute-force threshold and blocks the client.
    pub fn record_failed_login(&self, request: &RequestView) -> Option<Decision> {
        let now = self.clock.now_ms();
        let alert = self
            .brute_force
            .record_failure(&request.client_id, &request.path, now)?;
        Some(self.escalate(request, alert.to_detection(), now))
    }

    fn run_detector(
        &self,
        detector: &dyn Detector,
        request: &RequestView,
        now: Millis,
    ) -> Option<Detection> {
        let name = detector.name();
        match panic::catch_unwind(AssertUnwindSafe(|| detector.inspect(request, now))) {
            Ok(Ok(hit)) => hit,
            Ok(Err(e)) => {
                self.errors.record(OperationalError::detector(name, e.to_string()));
                None
            }
            Err(_) => {
                self.errors
                    .record(OperationalError::detector(name, DetectorError::Panicked(name).to_string()));
                None
            }
        }
    }

    fn escalate(&self, request: &RequestView, hit: Detection, now: Millis) -> Decision {
        let event_type = hit.event_type;
        let block_ms = self.block_duration(event_type);

        let mut event = SecurityEvent::new(event_type, request)
            .with_detail("detector", hit.source)
            .with_detail("matched", hit.matched);
        if let Some(at) = chrono::DateTime::from_timestamp_millis(now as i64) {
            event = event.at(at);
        }
        event.details.extend(hit.details);
        let event_id = event.id.clone();

        self.sink.log_event(event);
        self.total_attacks.fetch_add(1, Ordering::Relaxed);
        *self.attack_counts.entry(request.client_id.clone()).or_insert(0) += 1;

        self.blocks.block(
            &request.client_id,
            block_ms,
            BlockReason::Detection(event_type),
            now,
        );

        Decision::Detected {
            event_type,
            event_id,
            block_ms,
        }
    }

    /// Block lifetime for a detection class
    pub fn block_duration(&self, event_type: SecurityEventType) -> Millis {
        match event_type {
            t if t.is_injection_class() => self.blocking.injection_ms(),
            SecurityEventType::BruteForce => self.blocking.brute_force_ms(),
            _ => self.blocking.anomaly_ms(),
        }
    }

    pub fn classify_tier(&self, path: &str) -> RateTier {
        self.routes.classify_tier(path)
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        self.blocks.is_blocked(id, self.clock.now_ms())
    }

    pub fn block_entry(&self, id: &str) -> Option<BlockEntry> {
        self.blocks.get(id, self.clock.now_ms())
    }

    /// Administrative block
    pub fn block(&self, id: &str, duration_ms: Millis) -> BlockEntry {
        self.blocks
            .block(id, duration_ms, BlockReason::Manual, self.clock.now_ms())
    }

    /// Lift a block and forget the client's recent activity
    pub fn unblock(&self, id: &str) -> bool {
        self.activity.forget(id);
        self.blocks.unblock(id)
    }

    pub fn blocked_ids(&self) -> Vec<String> {
        self.blocks.blocked_ids(self.clock.now_ms())
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(self.clock.now_ms())
    }

    pub fn sweep_at(&self, now: Millis) -> SweepReport {
        let report = SweepReport {
            blocks: self.blocks.sweep(now),
            rate_windows: self.limiter.sweep(now),
            brute_force_targets: self.brute_force.cleanup_expired(now),
            idle_clients: self.activity.sweep(now),
        };
        if report.total() > 0 {
            debug!(
                blocks = report.blocks,
                rate_windows = report.rate_windows,
                brute_force_targets = report.brute_force_targets,
                idle_clients = report.idle_clients,
                "Sweep complete"
            );
        }
        report
    }

    /// Aggregate counters; attackers ranked by count, ties broken by identifier
    pub fn stats(&self, top_n: usize) -> SecurityStats {
        let mut ranked: Vec<TopAttacker> = self
            .attack_counts
            .iter()
            .map(|e| TopAttacker {
                identifier: e.key().clone(),
                attack_count: *e.value(),
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.attack_count
                .cmp(&a.attack_count)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        let suspicious = ranked.len() as u64;
        ranked.truncate(top_n);

        SecurityStats {
            total_attacks: self.total_attacks.load(Ordering::Relaxed),
            blocked_identifier_count: self.blocks.active_count(self.clock.now_ms()) as u64,
            suspicious_identifier_count: suspicious,
            top_attackers: ranked,
        }
    }

    /// Stats with the configured ranking size
    pub fn get_stats(&self) -> SecurityStats {
        self.stats(self.top_attackers)
    }

    pub fn operational_errors(&self) -> Vec<OperationalError> {
        self.errors.snapshot()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        self.sink.recent_events(limit)
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, HOUR_MS, MINUTE_MS};
    use crate::error::RejectionCode;
    use serde_json::json;

    fn monitor() -> (SecurityMonitor, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let monitor = SecurityMonitor::with_clock(&Config::default(), Arc::new(clock.clone()));
        (monitor, clock)
    }

    fn browser(client: &str, method: &str, path: &str) -> RequestView {
        RequestView::new(client, method, path).with_header("user-agent", "Mozilla/5.0")
    }

    struct Failing;

    impl Detector for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn inspect(&self, _: &RequestView, _: Millis) -> Result<Option<Detection>, DetectorError> {
            Err(DetectorError::Failed {
                detector: "failing",
                message: "backing store unavailable".to_string(),
            })
        }
    }

    struct Panicking;

    impl Detector for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn inspect(&self, _: &RequestView, _: Millis) -> Result<Option<Detection>, DetectorError> {
            panic!("detector bug")
        }
    }

    #[test]
    fn test_clean_request_allowed() {
        let (monitor, _) = monitor();
        let decision = monitor.check(&browser("1.1.1.1", "GET", "/api/tasks"));
        assert_eq!(
            decision,
            Decision::Allowed {
                tier: RateTier::General,
                remaining: 999
            }
        );
        assert!(decision.into_rejection().is_none());
    }

    #[test]
    fn test_injection_blocks_for_a_day() {
        let (monitor, clock) = monitor();
        let req = browser("6.6.6.6", "POST", "/api/tasks")
            .with_body(json!({"title": "x' UNION SELECT password FROM users --"}));

        let decision = monitor.check(&req);
        match &decision {
            Decision::Detected { event_type, block_ms, .. } => {
                assert_eq!(*event_type, SecurityEventType::SqlInjection);
                assert_eq!(*block_ms, 24 * HOUR_MS);
            }
            other => panic!("expected detection, got {:?}", other),
        }
        assert_eq!(
            decision.into_rejection().unwrap().code,
            RejectionCode::SecurityViolation
        );

        let events = monitor.recent_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, SecurityEventType::SqlInjection);
        assert_eq!(events[0].details["detector"], "sql_injection");

        // follow-up clean request is refused as blocked
        let next = monitor.check(&browser("6.6.6.6", "GET", "/api/tasks"));
        assert!(matches!(next, Decision::Blocked { .. }));
        assert_eq!(
            next.into_rejection().unwrap().code,
            RejectionCode::IpBlocked
        );

        clock.advance(24 * HOUR_MS - 1);
        assert!(monitor.is_blocked("6.6.6.6"));
        clock.advance(1);
        assert!(!monitor.is_blocked("6.6.6.6"));
    }

    #[test]
    fn test_statement_terminator_body_logs_once_and_blocks_a_day() {
        let (monitor, clock) = monitor();
        let req = browser("6.6.6.7", "POST", "/api/tasks").with_body(json!("'; DROP TABLE users; --"));

        match monitor.check(&req) {
            Decision::Detected { event_type, block_ms, .. } => {
                assert_eq!(event_type, SecurityEventType::SqlInjection);
                assert_eq!(block_ms, 24 * HOUR_MS);
            }
            other => panic!("expected detection, got {:?}", other),
        }

        let events = monitor.recent_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_str(), "sql_injection");
        assert_eq!(events[0].client_id, "6.6.6.7");
        assert_eq!(monitor.stats(10).total_attacks, 1);

        let entry = monitor.block_entry("6.6.6.7").unwrap();
        assert_eq!(entry.expires_at_ms - entry.blocked_at_ms, 24 * HOUR_MS);

        // the repeat is refused as blocked and logs nothing new
        assert!(matches!(monitor.check(&req), Decision::Blocked { .. }));
        assert_eq!(monitor.recent_events(10).len(), 1);

        clock.advance(24 * HOUR_MS);
        assert!(!monitor.is_blocked("6.6.6.7"));
    }

    #[test]
    fn test_failed_only_brute_force_uses_reported_failures() {
        let mut config = Config::default();
        config.brute_force.failed_only = true;
        let clock = ManualClock::new(1_000_000);
        let monitor = SecurityMonitor::with_clock(&config, Arc::new(clock.clone()));
        let login = || browser("7.7.7.8", "POST", "/api/auth/login");

        // successful logins are not attempts
        for _ in 0..15 {
            assert!(monitor.check(&login()).is_allowed());
        }

        for i in 0..10 {
            assert!(monitor.record_failed_login(&login()).is_none(), "failure {} fired early", i + 1);
        }
        match monitor.record_failed_login(&login()) {
            Some(Decision::Detected { event_type, block_ms, .. }) => {
                assert_eq!(event_type, SecurityEventType::BruteForce);
                assert_eq!(block_ms, 24 * HOUR_MS);
            }
            other => panic!("expected brute force, got {:?}", other),
        }
        assert!(matches!(monitor.check(&login()), Decision::Blocked { .. }));
    }

    #[test]
    fn test_blocked_client_skips_detection() {
        let (monitor, _) = monitor();
        monitor.block("9.9.9.9", HOUR_MS);

        let req = browser("9.9.9.9", "GET", "/../../etc/passwd");
        assert!(matches!(monitor.check(&req), Decision::Blocked { .. }));
        assert_eq!(monitor.stats(10).total_attacks, 0);
    }

    #[test]
    fn test_brute_force_eleventh_attempt() {
        let (monitor, clock) = monitor();

        for i in 0..10 {
            let decision = monitor.check(&browser("7.7.7.7", "POST", "/api/auth/login"));
            assert!(decision.is_allowed(), "attempt {} rejected: {:?}", i + 1, decision);
            clock.advance(MINUTE_MS);
        }

        let decision = monitor.check(&browser("7.7.7.7", "POST", "/api/auth/login"));
        match decision {
            Decision::Detected { event_type, block_ms, .. } => {
                assert_eq!(event_type, SecurityEventType::BruteForce);
                assert_eq!(block_ms, 24 * HOUR_MS);
            }
            other => panic!("expected brute force, got {:?}", other),
        }
    }

    #[test]
    fn test_anomaly_block_is_short() {
        let (monitor, _) = monitor();
        let req = RequestView::new("5.5.5.5", "GET", "/").with_header("user-agent", "sqlmap/1.7");
        match monitor.check(&req) {
            Decision::Detected { event_type, block_ms, .. } => {
                assert_eq!(event_type, SecurityEventType::SuspiciousUserAgent);
                assert_eq!(block_ms, HOUR_MS);
            }
            other => panic!("expected detection, got {:?}", other),
        }
    }

    #[test]
    fn test_failing_detectors_fail_open_to_rate_limit() {
        let mut config = Config::default();
        config.rate_limits.general.max_requests = 2;
        let clock = ManualClock::new(0);
        let monitor = SecurityMonitor::with_clock(&config, Arc::new(clock))
            .with_detectors(vec![Arc::new(Failing), Arc::new(Panicking)]);

        let req = browser("8.8.8.8", "GET", "/api/tasks");
        assert!(monitor.check(&req).is_allowed());
        assert!(monitor.check(&req).is_allowed());
        assert!(matches!(monitor.check(&req), Decision::RateLimited { .. }));

        let errors = monitor.operational_errors();
        assert_eq!(errors.len(), 6);
        assert_eq!(errors[0].component, "failing");
        assert_eq!(errors[1].component, "panicking");
    }

    #[test]
    fn test_rate_limited_rejection_has_retry_hint() {
        let mut config = Config::default();
        config.rate_limits.ai.max_requests = 1;
        let monitor = SecurityMonitor::with_clock(&config, Arc::new(ManualClock::new(0)));

        let req = browser("4.4.4.4", "POST", "/api/ai/summarize");
        assert!(monitor.check(&req).is_allowed());
        let rejection = monitor.check(&req).into_rejection().unwrap();
        assert_eq!(rejection.code, RejectionCode::RateLimitExceeded);
        assert_eq!(rejection.retry_after, Some(60));
    }

    #[test]
    fn test_stats_ranking() {
        let (monitor, _) = monitor();
        for client in ["b", "a", "c", "c"] {
            monitor.unblock(client);
            monitor.check(&browser(client, "GET", "/files/../../etc/passwd"));
        }

        let stats = monitor.stats(2);
        assert_eq!(stats.total_attacks, 4);
        assert_eq!(stats.suspicious_identifier_count, 3);
        assert_eq!(stats.blocked_identifier_count, 3);
        assert_eq!(
            stats.top_attackers,
            vec![
                TopAttacker { identifier: "c".into(), attack_count: 2 },
                TopAttacker { identifier: "a".into(), attack_count: 1 },
            ]
        );
    }

    #[test]
    fn test_unblock_and_sweep() {
        let (monitor, clock) = monitor();
        monitor.block("x", MINUTE_MS);
        monitor.block("y", HOUR_MS);
        assert!(monitor.unblock("y"));

        clock.advance(2 * MINUTE_MS);
        let report = monitor.sweep();
        assert_eq!(report.blocks, 1);
        assert!(monitor.blocked_ids().is_empty());
    }
}
