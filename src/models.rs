use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Normalized, read-only projection of an inbound request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestView {
    /// Resolved network address (or equivalent stable identifier)
    pub client_id: String,
    pub method: String,
    pub path: String,
    /// Raw query string without the leading `?`
    #[serde(default)]
    pub query: String,
    /// Header names are lower-cased
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Best-effort decoded body
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub content_length: Option<u64>,
}

impl RequestView {
    pub fn new(client_id: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("")
    }

    /// Path plus query string
    pub fn url(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    pub fn serialized_body(&self) -> String {
        match &self.body {
            None | Some(Value::Null) => String::new(),
            Some(value) => serde_json::to_string(value).unwrap_or_default(),
        }
    }

    /// Raw URL, followed by its percent-decoded form when that differs
    pub fn inspection_url(&self) -> String {
        let url = self.url();
        let decoded = url_decode(&url);
        if decoded == url {
            url
        } else {
            format!("{}\n{}", url, decoded)
        }
    }

    /// Text the content detectors run over: URL (raw and decoded) and body
    pub fn inspection_text(&self) -> String {
        let mut text = self.inspection_url();
        text.push('\n');
        text.push_str(&self.serialized_body());
        text
    }
}

/// Single-pass percent decoding; `+` becomes a space and malformed escapes
/// are kept as-is
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("00");
                out.push(u8::from_str_radix(hex, 16).unwrap_or(0));
                i += 3;
                continue;
            }
            b'+' => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Security event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    SqlInjection,
    XssAttempt,
    PathTraversal,
    BruteForce,
    SuspiciousUserAgent,
    EndpointScanning,
    HighFrequencyRequests,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::SqlInjection => "sql_injection",
            SecurityEventType::XssAttempt => "xss_attempt",
            SecurityEventType::PathTraversal => "path_traversal",
            SecurityEventType::BruteForce => "brute_force",
            SecurityEventType::SuspiciousUserAgent => "suspicious_user_agent",
            SecurityEventType::EndpointScanning => "endpoint_scanning",
            SecurityEventType::HighFrequencyRequests => "high_frequency_requests",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            SecurityEventType::SqlInjection
            | SecurityEventType::XssAttempt
            | SecurityEventType::PathTraversal => Severity::Critical,
            SecurityEventType::BruteForce => Severity::High,
            SecurityEventType::EndpointScanning | SecurityEventType::HighFrequencyRequests => {
                Severity::Medium
            }
            SecurityEventType::SuspiciousUserAgent => Severity::Low,
        }
    }

    /// Confirmed attack patterns, as opposed to weak anomaly signals
    pub fn is_injection_class(&self) -> bool {
        matches!(
            self,
            SecurityEventType::SqlInjection
                | SecurityEventType::XssAttempt
                | SecurityEventType::PathTraversal
        )
    }
}

impl std::fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SecurityEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sql_injection" => Ok(SecurityEventType::SqlInjection),
            "xss_attempt" => Ok(SecurityEventType::XssAttempt),
            "path_traversal" => Ok(SecurityEventType::PathTraversal),
            "brute_force" => Ok(SecurityEventType::BruteForce),
            "suspicious_user_agent" => Ok(SecurityEventType::SuspiciousUserAgent),
            "endpoint_scanning" => Ok(SecurityEventType::EndpointScanning),
            "high_frequency_requests" => Ok(SecurityEventType::HighFrequencyRequests),
            _ => Err(format!("Unknown security event type: {}", s)),
        }
    }
}

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    /// CEF severity (0-10)
    pub fn as_cef(&self) -> u8 {
        match self {
            Severity::Low => 3,
            Severity::Medium => 5,
            Severity::High => 7,
            Severity::Critical => 10,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Immutable record of one detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub id: String,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    pub method: String,
    pub path: String,
    pub user_agent: String,
    /// Body snapshot; redacted before it leaves the sink
    pub body: Option<Value>,
    pub details: BTreeMap<String, Value>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, request: &RequestView) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            severity: event_type.severity(),
            timestamp: Utc::now(),
            client_id: request.client_id.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            user_agent: request.user_agent().to_string(),
            body: request.body.clone(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// One row of the attacker ranking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopAttacker {
    pub identifier: String,
    pub attack_count: u64,
}

/// Read-only aggregate for administrative tooling
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityStats {
    pub total_attacks: u64,
    pub blocked_identifier_count: u64,
    pub suspicious_identifier_count: u64,
    pub top_attackers: Vec<TopAttacker>,
}
