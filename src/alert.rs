//! Security event sink and alerting
//!
//! Every event is redacted, logged, kept in a bounded in-memory ring and,
//! when alerting is enabled, delivered to webhooks in the background.
//!
//! Output formats:
//! - JSON (default)
//! - CEF (Common Event Format)
//!
//! Delivery never blocks or fails the request that produced the event:
//! failures are recorded as operational errors and dropped.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RedactionConfig;
use crate::crypto::Redactor;
use crate::error::{OperationalError, OperationalLog};
use crate::models::{SecurityEvent, Severity};

/// Alert payload format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlertFormat {
    /// Common Event Format (ArcSight)
    Cef,
    /// Plain JSON
    #[default]
    Json,
}

impl AlertFormat {
    fn content_type(&self) -> &'static str {
        match self {
            AlertFormat::Cef => "text/plain",
            AlertFormat::Json => "application/json",
        }
    }
}

/// HTTP webhook receiving alert payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Enable outbound alerting (events are always logged)
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub format: AlertFormat,

    #[serde(default)]
    pub webhooks: Vec<WebhookTarget>,

    /// Address recorded for out-of-band notification
    #[serde(default)]
    pub notify_email: Option<String>,

    /// Events below this severity are logged but not alerted
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,

    /// Per-webhook delivery timeout (seconds)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Recent events kept in memory
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Device vendor (for CEF)
    #[serde(default = "default_vendor")]
    pub vendor: String,

    /// Device product (for CEF)
    #[serde(default = "default_product")]
    pub product: String,
}

fn default_min_severity() -> Severity {
    Severity::Low
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_max_events() -> usize {
    1000
}

fn default_vendor() -> String {
    "crguard".to_string()
}

fn default_product() -> String {
    "API Guard".to_string()
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            format: AlertFormat::Json,
            webhooks: vec![],
            notify_email: None,
            min_severity: default_min_severity(),
            timeout_secs: default_timeout_secs(),
            max_events: default_max_events(),
            vendor: default_vendor(),
            product: default_product(),
        }
    }
}

pub struct EventSink {
    config: AlertConfig,
    redactor: Redactor,
    recent: Mutex<VecDeque<SecurityEvent>>,
    total: AtomicU64,
    http_client: Option<reqwest::Client>,
    errors: Arc<OperationalLog>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("config", &self.config)
            .field("total", &self.total.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventSink {
    pub fn new(config: AlertConfig, redaction: &RedactionConfig, errors: Arc<OperationalLog>) -> Self {
        let http_client = if config.webhooks.is_empty() {
            None
        } else {
            match reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
            {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!("Failed to build webhook client, alerts disabled: {}", e);
                    None
                }
            }
        };

        Self {
            redactor: Redactor::new(&redaction.fields, redaction.marker.clone()),
            recent: Mutex::new(VecDeque::with_capacity(config.max_events.min(1024))),
            total: AtomicU64::new(0),
            http_client,
            errors,
            config,
        }
    }

    pub fn is_alerting_enabled(&self) -> bool {
        self.config.enabled && (!self.config.webhooks.is_empty() || self.config.notify_email.is_some())
    }

    /// Redact, log, retain and (optionally) alert. Never fails.
    pub fn log_event(&self, event: SecurityEvent) {
        let event = self.redact(event);

        warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            severity = %event.severity,
            client = %event.client_id,
            method = %event.method,
            path = %event.path,
            user_agent = %event.user_agent,
            details = %serde_json::to_string(&event.details).unwrap_or_default(),
            "Security event"
        );

        self.total.fetch_add(1, Ordering::Relaxed);
        {
            let mut recent = self.recent.lock();
            if self.config.max_events > 0 {
                if recent.len() >= self.config.max_events {
                    recent.pop_front();
                }
                recent.push_back(event.clone());
            }
        }

        if self.is_alerting_enabled() && event.severity >= self.config.min_severity {
            self.dispatch(&event);
        }
    }

    /// Strip sensitive values from the body snapshot and details
    pub fn redact(&self, mut event: SecurityEvent) -> SecurityEvent {
        event.body = event.body.as_ref().map(|body| self.redactor.redact(body));
        event.details = event
            .details
            .into_iter()
            .map(|(k, v)| {
                let v = if self.redactor.is_sensitive(&k) {
                    serde_json::Value::String(self.redactor.marker().to_string())
                } else {
                    self.redactor.redact(&v)
                };
                (k, v)
            })
            .collect();
        event
    }

    fn dispatch(&self, event: &SecurityEvent) {
        if let Some(email) = &self.config.notify_email {
            info!(
                recipient = %email,
                event_id = %event.id,
                event_type = %event.event_type,
                "Security alert notification recorded"
            );
        }

        let Some(client) = self.http_client.clone() else {
            return;
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!(event_id = %event.id, "No async runtime, webhook delivery skipped");
                return;
            }
        };

        let payload = self.format_event(event);
        let content_type = self.config.format.content_type();
        let targets = self.config.webhooks.clone();
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let errors = Arc::clone(&self.errors);

        handle.spawn(async move {
            for target in targets {
                let send = send_to_webhook(&client, &target, content_type, &payload);
                match tokio::time::timeout(timeout, send).await {
                    Ok(Ok(())) => debug!(url = %target.url, "Alert delivered"),
                    Ok(Err(e)) => errors.record(OperationalError::alert(&target.url, e.to_string())),
                    Err(_) => errors.record(OperationalError::alert(&target.url, "delivery timed out")),
                }
            }
        });
    }

    /// Format an event according to the configured format
    pub fn format_event(&self, event: &SecurityEvent) -> String {
        match self.config.format {
            AlertFormat::Cef => self.format_cef(event),
            AlertFormat::Json => format_json(event),
        }
    }

    fn format_cef(&self, event: &SecurityEvent) -> String {
        let extension = format!(
            "rt={} src={} requestMethod={} request={} requestClientApplication={} eventId={}",
            event.timestamp.timestamp_millis(),
            cef_escape(&event.client_id),
            cef_escape(&event.method),
            cef_escape(&event.path),
            cef_escape(&event.user_agent),
            event.id
        );

        format!(
            "CEF:0|{}|{}|{}|{}|{}|{}|{}",
            cef_header_escape(&self.config.vendor),
            cef_header_escape(&self.config.product),
            env!("CARGO_PKG_VERSION"),
            event.event_type,
            event_title(event),
            event.severity.as_cef(),
            extension
        )
    }

    /// Newest first
    pub fn recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        self.recent.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Events logged since start, including those evicted from the ring
    pub fn event_count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

async fn send_to_webhook(
    client: &reqwest::Client,
    target: &WebhookTarget,
    content_type: &str,
    payload: &str,
) -> anyhow::Result<()> {
    let mut req = client.post(&target.url).body(payload.to_string());

    for (key, value) in &target.headers {
        req = req.header(key.as_str(), value.as_str());
    }
    req = req.header("Content-Type", content_type);

    let resp = req.send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("webhook returned {}", resp.status());
    }
    Ok(())
}

fn format_json(event: &SecurityEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string())
}

fn event_title(event: &SecurityEvent) -> &'static str {
    use crate::models::SecurityEventType::*;
    match event.event_type {
        SqlInjection => "SQL Injection Attempt",
        XssAttempt => "Script Injection Attempt",
        PathTraversal => "Path Traversal Attempt",
        BruteForce => "Brute Force Attack",
        SuspiciousUserAgent => "Scanner User Agent",
        EndpointScanning => "Endpoint Scanning",
        HighFrequencyRequests => "High Request Frequency",
    }
}

/// Escape special characters for CEF extension values
fn cef_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('=', "\\=")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

fn cef_header_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('|', "\\|")
}
