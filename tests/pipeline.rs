use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crguard::clock::{Clock, ManualClock, Millis, HOUR_MS, MINUTE_MS};
use crguard::config::Config;
use crguard::crypto::CryptoCore;
use crguard::detect::{Detection, Detector};
use crguard::error::{DetectorError, OperationalSource};
use crguard::models::{RequestView, SecurityEventType};
use crguard::monitor::{Decision, SecurityMonitor};
use crguard::rate_limit::RateTier;
use crguard::sweeper::Sweeper;

const CONFIG: &str = r#"
[rate_limits.strict]
window_secs = 60
max_requests = 3

[brute_force]
threshold = 2
window_secs = 120

[blocking]
injection_secs = 7200
brute_force_secs = 600
anomaly_secs = 300

[redaction]
fields = ["password", "secret"]

[crypto]
encryption_key = "8f3a0c1d2e4b5a69788796a5b4c3d2e1f00112233445566778899aabbccddeeff"
signing_secret = "integration-secret"
pbkdf2_iterations = 2000
"#;

fn load_config() -> Config {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crguard.toml");
    std::fs::write(&path, CONFIG).unwrap();
    Config::load(&path).unwrap()
}

fn monitor_at(config: &Config, start: Millis) -> (Arc<SecurityMonitor>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start));
    let monitor = Arc::new(SecurityMonitor::with_clock(config, clock.clone()));
    (monitor, clock)
}

#[test]
fn config_file_drives_block_durations_and_thresholds() {
    let config = load_config();
    let (monitor, clock) = monitor_at(&config, 10 * HOUR_MS);

    let injection = RequestView::new("203.0.113.1", "GET", "/api/search").with_query("q=1' OR '1'='1");
    match monitor.check(&injection) {
        Decision::Detected { event_type, block_ms, .. } => {
            assert_eq!(event_type, SecurityEventType::SqlInjection);
            assert_eq!(block_ms, 2 * HOUR_MS);
        }
        other => panic!("expected detection, got {:?}", other),
    }

    let login = || {
        RequestView::new("203.0.113.2", "POST", "/api/auth/login")
            .with_body(json!({"username": "root", "password": "toor"}))
    };
    assert!(monitor.check(&login()).is_allowed());
    assert!(monitor.check(&login()).is_allowed());
    match monitor.check(&login()) {
        Decision::Detected { event_type, block_ms, .. } => {
            assert_eq!(event_type, SecurityEventType::BruteForce);
            assert_eq!(block_ms, 10 * MINUTE_MS);
        }
        other => panic!("expected brute force, got {:?}", other),
    }

    // password values never reach the event log
    let events = monitor.recent_events(10);
    let body = events[0].body.as_ref().unwrap();
    assert_eq!(body["password"], "[REDACTED]");
    assert_eq!(body["username"], "root");

    clock.advance(10 * MINUTE_MS);
    assert!(!monitor.is_blocked("203.0.113.2"));
    assert!(monitor.is_blocked("203.0.113.1"));

    let stats = monitor.get_stats();
    assert_eq!(stats.total_attacks, 2);
    assert_eq!(stats.blocked_identifier_count, 1);
    assert_eq!(stats.suspicious_identifier_count, 2);
}

#[test]
fn form_encoded_login_body_is_redacted_in_stored_events() {
    let config = load_config();
    let (monitor, _) = monitor_at(&config, HOUR_MS);

    let login = RequestView::new("203.0.113.3", "POST", "/api/auth/login")
        .with_header("content-type", "application/x-www-form-urlencoded")
        .with_body(json!("username=admin' OR '1'='1&password=hunter2"));
    match monitor.check(&login) {
        Decision::Detected { event_type, .. } => assert_eq!(event_type, SecurityEventType::SqlInjection),
        other => panic!("expected detection, got {:?}", other),
    }

    let events = monitor.recent_events(10);
    let stored = serde_json::to_string(&events[0]).unwrap();
    assert!(!stored.contains("hunter2"), "password leaked: {}", stored);
    assert_eq!(
        events[0].body.as_ref().unwrap(),
        &json!("username=admin' OR '1'='1&password=[REDACTED]")
    );
}

struct Broken;

impl Detector for Broken {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn inspect(&self, _: &RequestView, _: Millis) -> Result<Option<Detection>, DetectorError> {
        Err(DetectorError::Failed {
            detector: "broken",
            message: "backing store unavailable".to_string(),
        })
    }
}

#[test]
fn failing_detector_still_reaches_the_rate_limiter() {
    let config = load_config();
    let clock = Arc::new(ManualClock::new(HOUR_MS));
    let monitor = SecurityMonitor::with_clock(&config, clock).with_detectors(vec![Arc::new(Broken)]);

    let request = RequestView::new("198.51.100.40", "POST", "/api/admin/users")
        .with_query("id=1 UNION SELECT secret FROM keys");

    for _ in 0..3 {
        assert!(monitor.check(&request).is_allowed(), "broken detector must not reject");
    }
    match monitor.check(&request) {
        Decision::RateLimited { tier, limit, retry_after_ms } => {
            assert_eq!(tier, RateTier::Strict);
            assert_eq!(limit, 3);
            assert_eq!(retry_after_ms, MINUTE_MS);
        }
        other => panic!("expected rate limit, got {:?}", other),
    }

    let errors = monitor.operational_errors();
    assert_eq!(errors.len(), 4);
    assert!(errors.iter().all(|e| e.source == OperationalSource::Detector));
    assert!(errors[0].message.contains("backing store unavailable"));
}

#[tokio::test]
async fn sweeper_releases_expired_state() {
    let config = load_config();
    let (monitor, clock) = monitor_at(&config, HOUR_MS);

    monitor.check(&RequestView::new("203.0.113.9", "GET", "/api/x").with_query("f=../../etc/passwd"));
    monitor.check(&RequestView::new("198.51.100.9", "GET", "/api/items"));
    assert_eq!(monitor.blocked_ids(), vec!["203.0.113.9".to_string()]);

    let mut sweeper = Sweeper::start(monitor.clone(), Duration::from_secs(60));
    let report = sweeper.tick(clock.now_ms() + 3 * HOUR_MS);
    assert_eq!(report.blocks, 1);
    assert!(report.rate_windows >= 1);
    sweeper.stop().await;
    assert!(!sweeper.is_running());
}

#[test]
fn crypto_core_from_config_file() {
    let config = load_config();
    let core = CryptoCore::from_config(&config.crypto).unwrap();

    let payload = core.encrypt_str("card=4111111111111111").unwrap();
    let wire = serde_json::to_string(&payload).unwrap();
    let back = serde_json::from_str(&wire).unwrap();
    assert_eq!(core.decrypt_str(&back).unwrap(), "card=4111111111111111");

    let hash = core.hash_password("correct horse").unwrap();
    assert!(hash.starts_with("pbkdf2-sha256$2000$"));
    assert!(core.verify_password("correct horse", &hash));

    let signature = core.create_signature(b"order=42").unwrap();
    assert!(core.verify_signature(b"order=42", &signature));
    assert!(!core.verify_signature(b"order=43", &signature));
}
