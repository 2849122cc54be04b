//! Anomalous client behaviour
//!
//! Three signals, checked in order:
//! - scanner tool signatures in the User-Agent
//! - endpoint scanning: too many distinct endpoints inside the scan window
//! - high frequency: too many requests inside the frequency window

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use super::{Detection, Detector};
use crate::clock::{Millis, SECOND_MS};
use crate::error::DetectorError;
use crate::models::{RequestView, SecurityEventType};

/// Number of shards for DashMap (power of 2 for efficient hashing)
const NUM_SHARDS: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Treat a missing or blank User-Agent as a scanner signature
    #[serde(default)]
    pub flag_empty_user_agent: bool,

    /// Distinct endpoints allowed per client inside the scan window
    #[serde(default = "default_endpoint_scan_threshold")]
    pub endpoint_scan_threshold: usize,

    #[serde(default = "default_endpoint_scan_window_secs")]
    pub endpoint_scan_window_secs: u64,

    /// Requests allowed per client inside the frequency window
    #[serde(default = "default_high_frequency_threshold")]
    pub high_frequency_threshold: usize,

    #[serde(default = "default_high_frequency_window_secs")]
    pub high_frequency_window_secs: u64,
}

impl AnomalyConfig {
    pub fn scan_window_ms(&self) -> Millis {
        self.endpoint_scan_window_secs * SECOND_MS
    }

    pub fn frequency_window_ms(&self) -> Millis {
        self.high_frequency_window_secs * SECOND_MS
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flag_empty_user_agent: false,
            endpoint_scan_threshold: default_endpoint_scan_threshold(),
            endpoint_scan_window_secs: default_endpoint_scan_window_secs(),
            high_frequency_threshold: default_high_frequency_threshold(),
            high_frequency_window_secs: default_high_frequency_window_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_endpoint_scan_threshold() -> usize {
    50
}

fn default_endpoint_scan_window_secs() -> u64 {
    300
}

fn default_high_frequency_threshold() -> usize {
    100
}

fn default_high_frequency_window_secs() -> u64 {
    60
}

/// Recent activity of one client
#[derive(Debug, Default)]
struct ClientActivity {
    requests: VecDeque<Millis>,
    /// Normalized endpoint -> last visit
    endpoints: HashMap<String, Millis>,
    last_seen: Millis,
}

pub struct ActivityTracker {
    config: AnomalyConfig,
    scanner_ac: Option<AhoCorasick>,
    scanner_patterns: Vec<String>,
    clients: DashMap<String, ClientActivity>,
}

impl std::fmt::Debug for ActivityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTracker")
            .field("config", &self.config)
            .field("scanner_patterns", &self.scanner_patterns.len())
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl ActivityTracker {
    pub fn new(config: AnomalyConfig, scanner_agents: &[String]) -> Self {
        let scanner_patterns: Vec<String> = scanner_agents
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let scanner_ac = if scanner_patterns.is_empty() {
            None
        } else {
            match AhoCorasickBuilder::new()
                .ascii_case_insensitive(true)
                .match_kind(MatchKind::LeftmostFirst)
                .build(&scanner_patterns)
            {
                Ok(ac) => Some(ac),
                Err(e) => {
                    warn!("Failed to build scanner signature automaton: {}", e);
                    None
                }
            }
        };

        Self {
            config,
            scanner_ac,
            scanner_patterns,
            clients: DashMap::with_capacity_and_shard_amount(1024, NUM_SHARDS),
        }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// First scanner signature found in the user agent
    pub fn match_scanner(&self, user_agent: &str) -> Option<&str> {
        let ac = self.scanner_ac.as_ref()?;
        let mat = ac.find(user_agent)?;
        Some(self.scanner_patterns[mat.pattern().as_usize()].as_str())
    }

    /// Record the request and report the first anomaly it exposes
    pub fn detect_anomalous_signature(&self, request: &RequestView, now: Millis) -> Option<Detection> {
        if !self.config.enabled {
            return None;
        }

        let user_agent = request.user_agent();
        if let Some(signature) = self.match_scanner(user_agent) {
            return Some(
                Detection::new(SecurityEventType::SuspiciousUserAgent, self.name(), signature)
                    .with_detail("signature", signature),
            );
        }
        if self.config.flag_empty_user_agent && user_agent.trim().is_empty() {
            return Some(Detection::new(
                SecurityEventType::SuspiciousUserAgent,
                self.name(),
                "empty user agent",
            ));
        }

        let (distinct, recent) = self.record(&request.client_id, &request.path, now);

        if distinct > self.config.endpoint_scan_threshold {
            debug!(client = %request.client_id, distinct, "Endpoint scanning detected");
            return Some(
                Detection::new(
                    SecurityEventType::EndpointScanning,
                    self.name(),
                    format!(
                        "{} distinct endpoints in {}s",
                        distinct, self.config.endpoint_scan_window_secs
                    ),
                )
                .with_detail("distinctEndpoints", distinct)
                .with_detail("windowSecs", self.config.endpoint_scan_window_secs),
            );
        }

        if recent > self.config.high_frequency_threshold {
            debug!(client = %request.client_id, recent, "High request frequency detected");
            return Some(
                Detection::new(
                    SecurityEventType::HighFrequencyRequests,
                    self.name(),
                    format!(
                        "{} requests in {}s",
                        recent, self.config.high_frequency_window_secs
                    ),
                )
                .with_detail("requestCount", recent)
                .with_detail("windowSecs", self.config.high_frequency_window_secs),
            );
        }

        None
    }

    /// Returns (distinct endpoints in scan window, requests in frequency window)
    fn record(&self, client_id: &str, path: &str, now: Millis) -> (usize, usize) {
        let endpoint = normalize_endpoint(path);
        let freq_cutoff = now.saturating_sub(self.config.frequency_window_ms());
        let scan_cutoff = now.saturating_sub(self.config.scan_window_ms());
        // One past the threshold is enough to fire
        let endpoint_cap = self.config.endpoint_scan_threshold.saturating_add(1);

        let mut activity = self.clients.entry(client_id.to_string()).or_default();
        activity.last_seen = activity.last_seen.max(now);

        while let Some(&front) = activity.requests.front() {
            if front < freq_cutoff {
                activity.requests.pop_front();
            } else {
                break;
            }
        }
        activity.requests.push_back(now);

        activity.endpoints.retain(|_, seen| *seen >= scan_cutoff);
        if activity.endpoints.len() < endpoint_cap || activity.endpoints.contains_key(&endpoint) {
            activity.endpoints.insert(endpoint, now);
        }

        (activity.endpoints.len(), activity.requests.len())
    }

    /// Drop clients idle for longer than both windows. Returns removed count.
    pub fn sweep(&self, now: Millis) -> usize {
        let horizon = self
            .config
            .scan_window_ms()
            .max(self.config.frequency_window_ms());
        let cutoff = now.saturating_sub(horizon);
        let before = self.clients.len();
        self.clients.retain(|_, activity| activity.last_seen >= cutoff);
        before.saturating_sub(self.clients.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn forget(&self, client_id: &str) {
        self.clients.remove(client_id);
    }
}

impl Detector for ActivityTracker {
    fn name(&self) -> &'static str {
        "anomalous_signature"
    }

    fn inspect(&self, request: &RequestView, now: Millis) -> Result<Option<Detection>, DetectorError> {
        Ok(self.detect_anomalous_signature(request, now))
    }
}

/// Collapse id-like path segments so `/api/tasks/17` and `/api/tasks/18`
/// count as one endpoint
pub fn normalize_endpoint(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let segments: Vec<&str> = path
        .split('/')
        .map(|segment| if is_id_like(segment) { ":id" } else { segment })
        .collect();
    segments.join("/")
}

fn is_id_like(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }
    segment.len() >= 16 && segment.bytes().all(|b| b.is_ascii_hexdigit() || b == b'-')
}
