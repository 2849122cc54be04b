use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::error;

/// Errors raised by the crypto core. Every variant fails closed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption key is not configured")]
    KeyUnavailable,

    #[error("signing secret is not configured")]
    SecretUnavailable,

    #[error("integrity check failed")]
    IntegrityFailure,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("system randomness unavailable")]
    RandomnessUnavailable,
}

/// Internal failure of a single detector
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector {detector} failed: {message}")]
    Failed {
        detector: &'static str,
        message: String,
    },

    #[error("detector {0} panicked")]
    Panicked(&'static str),
}

/// Stable machine-readable rejection codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    IpBlocked,
    SecurityViolation,
    RateLimitExceeded,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCode::IpBlocked => "IP_BLOCKED",
            RejectionCode::SecurityViolation => "SECURITY_VIOLATION",
            RejectionCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            RejectionCode::IpBlocked | RejectionCode::SecurityViolation => 403,
            RejectionCode::RateLimitExceeded => 429,
        }
    }
}

impl std::fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-facing rejection body.
///
/// Carries only the stable code, a fixed human message and, for rate
/// limiting, a retry hint. Never include detector output or internal ids here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub success: bool,
    pub message: String,
    pub code: RejectionCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl Rejection {
    pub fn blocked() -> Self {
        Self {
            success: false,
            message: "Access denied".to_string(),
            code: RejectionCode::IpBlocked,
            retry_after: None,
        }
    }

    pub fn violation() -> Self {
        Self {
            success: false,
            message: "Request rejected by security policy".to_string(),
            code: RejectionCode::SecurityViolation,
            retry_after: None,
        }
    }

    /// `retry_after_ms` is rounded up to whole seconds
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self {
            success: false,
            message: "Too many requests, please try again later".to_string(),
            code: RejectionCode::RateLimitExceeded,
            retry_after: Some(retry_after_ms.div_ceil(1000).max(1)),
        }
    }

    pub fn status(&self) -> u16 {
        self.code.status()
    }
}

/// Where an operational error originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalSource {
    Detector,
    AlertDispatch,
}

/// A failure inside the security layer itself. Logged server-side, never
/// surfaced to clients and never aborts a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationalError {
    pub source: OperationalSource,
    pub component: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl OperationalError {
    pub fn detector(name: &str, message: impl Into<String>) -> Self {
        Self {
            source: OperationalSource::Detector,
            component: name.to_string(),
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn alert(target: &str, message: impl Into<String>) -> Self {
        Self {
            source: OperationalSource::AlertDispatch,
            component: target.to_string(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Bounded record of operational errors, oldest dropped first
#[derive(Debug)]
pub struct OperationalLog {
    entries: Mutex<VecDeque<OperationalError>>,
    capacity: usize,
}

impl OperationalLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, err: OperationalError) {
        error!(
            source = ?err.source,
            component = %err.component,
            "Operational error: {}",
            err.message
        );

        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(err);
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<OperationalError> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for OperationalLog {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_body_shape() {
        let body = serde_json::to_value(Rejection::rate_limited(1_500)).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["retryAfter"], 2);

        let body = serde_json::to_value(Rejection::blocked()).unwrap();
        assert_eq!(body["code"], "IP_BLOCKED");
        assert!(body.get("retryAfter").is_none());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Rejection::blocked().status(), 403);
        assert_eq!(Rejection::violation().status(), 403);
        assert_eq!(Rejection::rate_limited(10).status(), 429);
    }

    #[test]
    fn test_operational_log_is_bounded() {
        let log = OperationalLog::new(2);
        log.record(OperationalError::detector("a", "first"));
        log.record(OperationalError::detector("b", "second"));
        log.record(OperationalError::alert("hook", "third"));

        let entries = log.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].component, "b");
        assert_eq!(entries[1].source, OperationalSource::AlertDispatch);
    }
}
