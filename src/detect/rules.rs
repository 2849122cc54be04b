// crguard - declarative detection rules
// Pattern lists are plain data: adding a detector pattern is a config change.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::SecurityEventType;
use crate::rate_limit::RateTier;

/// Content categories matched by compiled patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    SqlInjection,
    ScriptInjection,
    PathTraversal,
}

impl ThreatCategory {
    pub const ALL: [ThreatCategory; 3] = [
        ThreatCategory::SqlInjection,
        ThreatCategory::ScriptInjection,
        ThreatCategory::PathTraversal,
    ];

    pub fn event_type(&self) -> SecurityEventType {
        match self {
            ThreatCategory::SqlInjection => SecurityEventType::SqlInjection,
            ThreatCategory::ScriptInjection => SecurityEventType::XssAttempt,
            ThreatCategory::PathTraversal => SecurityEventType::PathTraversal,
        }
    }

    /// Which part of the request the category inspects
    pub fn scope(&self) -> MatchScope {
        match self {
            ThreatCategory::PathTraversal => MatchScope::Url,
            _ => MatchScope::UrlQueryBody,
        }
    }

    pub fn detector_name(&self) -> &'static str {
        match self {
            ThreatCategory::SqlInjection => "sql_injection",
            ThreatCategory::ScriptInjection => "script_injection",
            ThreatCategory::PathTraversal => "path_traversal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchScope {
    /// Path and query string
    Url,
    /// URL, query string and serialized body
    UrlQueryBody,
}

/// Pattern lists and scanner signatures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Master switch for content detectors
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// SQL keyword / operator patterns (regex, case-insensitive)
    #[serde(default = "default_sql_patterns")]
    pub sql_patterns: Vec<String>,

    /// Markup / script patterns (regex, case-insensitive)
    #[serde(default = "default_xss_patterns")]
    pub xss_patterns: Vec<String>,

    /// Directory traversal patterns (regex, case-insensitive)
    #[serde(default = "default_traversal_patterns")]
    pub traversal_patterns: Vec<String>,

    /// User-agent substrings of known scanning tools (case-insensitive)
    #[serde(default = "default_scanner_agents")]
    pub scanner_agents: Vec<String>,

    /// Authentication route prefixes (brute-force tracking, auth tier)
    #[serde(default = "default_auth_routes")]
    pub auth_routes: Vec<String>,

    /// Admin / system route prefixes (strict tier)
    #[serde(default = "default_strict_routes")]
    pub strict_routes: Vec<String>,

    /// File operation route prefixes (upload tier)
    #[serde(default = "default_upload_routes")]
    pub upload_routes: Vec<String>,

    /// AI-backed route prefixes (ai tier)
    #[serde(default = "default_ai_routes")]
    pub ai_routes: Vec<String>,
}

impl DetectionConfig {
    pub fn patterns(&self, category: ThreatCategory) -> &[String] {
        match category {
            ThreatCategory::SqlInjection => &self.sql_patterns,
            ThreatCategory::ScriptInjection => &self.xss_patterns,
            ThreatCategory::PathTraversal => &self.traversal_patterns,
        }
    }

    pub fn is_auth_route(&self, path: &str) -> bool {
        has_prefix(&self.auth_routes, path)
    }

    /// Map a route onto its rate tier. Auth wins over strict so a login
    /// under an admin prefix is still counted as authentication.
    pub fn classify_tier(&self, path: &str) -> RateTier {
        if has_prefix(&self.auth_routes, path) {
            RateTier::Auth
        } else if has_prefix(&self.strict_routes, path) {
            RateTier::Strict
        } else if has_prefix(&self.upload_routes, path) {
            RateTier::Upload
        } else if has_prefix(&self.ai_routes, path) {
            RateTier::Ai
        } else {
            RateTier::General
        }
    }
}

fn has_prefix(prefixes: &[String], path: &str) -> bool {
    prefixes.iter().any(|p| path.starts_with(p.as_str()))
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sql_patterns: default_sql_patterns(),
            xss_patterns: default_xss_patterns(),
            traversal_patterns: default_traversal_patterns(),
            scanner_agents: default_scanner_agents(),
            auth_routes: default_auth_routes(),
            strict_routes: default_strict_routes(),
            upload_routes: default_upload_routes(),
            ai_routes: default_ai_routes(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn to_strings(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_string()).collect()
}

fn default_sql_patterns() -> Vec<String> {
    to_strings(&[
        r"\bunion\b(\s+all)?\s+select\b",
        r"\b(drop|truncate|alter)\s+(table|database)\b",
        r"'\s*(;|--|#|/\*)",
        r";\s*(drop|delete|insert|update|select|truncate|alter|create|exec)\s",
        r"\bor\s+\d+\s*=\s*\d+",
        r"'\s*(or|and)\s+'?[^'\s]*'?\s*=\s*'",
        r"\bexec(\s|\+)+(s|x)p\w+",
        r"\bwaitfor\s+delay\b",
        r"\b(pg_sleep|benchmark)\s*\(",
        r"\binformation_schema\b",
        r"%27(\s|%20|\+)*(or|and|union|--|%2d%2d|%3b)",
    ])
}

fn default_xss_patterns() -> Vec<String> {
    to_strings(&[
        r"<\s*script\b",
        r"%3c\s*script",
        r"javascript\s*:",
        r"vbscript\s*:",
        r"\bon(load|error|click|dblclick|mouseover|mouseout|focus|blur|submit|change|input|keydown|keyup|keypress|abort|unload)\s*=",
        r"<\s*iframe\b",
        r"<\s*(object|embed|applet)\b",
        r"\beval\s*\(",
        r"document\.(cookie|write)",
    ])
}

fn default_traversal_patterns() -> Vec<String> {
    to_strings(&[
        r"\.\./",
        r"\.\.\\",
        r"\.\.(%2f|%5c)",
        r"%2e%2e(%2f|%5c|/|\\)",
        r"%252e%252e",
        r"%c0%ae",
    ])
}

fn default_scanner_agents() -> Vec<String> {
    to_strings(&[
        "sqlmap", "nikto", "nmap", "masscan", "nessus", "openvas", "acunetix",
        "netsparker", "dirbuster", "gobuster", "dirb", "wfuzz", "ffuf", "burpsuite",
        "w3af", "zgrab", "nuclei", "havij", "hydra", "zmeu", "whatweb",
    ])
}

fn default_auth_routes() -> Vec<String> {
    to_strings(&[
        "/api/auth/login",
        "/api/auth/register",
        "/api/auth/forgot-password",
        "/api/auth/reset-password",
        "/api/auth/refresh",
        "/api/login",
    ])
}

fn default_strict_routes() -> Vec<String> {
    to_strings(&["/api/admin", "/api/system", "/api/security"])
}

fn default_upload_routes() -> Vec<String> {
    to_strings(&["/api/upload", "/api/files", "/api/attachments"])
}

fn default_ai_routes() -> Vec<String> {
    to_strings(&["/api/ai", "/api/chat", "/api/assistant"])
}

/// One compiled pattern with its category
#[derive(Debug)]
pub struct CompiledRule {
    pub category: ThreatCategory,
    pub regex: Regex,
}

/// Uniformly evaluated `(category, pattern)` list
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    rejected: usize,
}

impl RuleSet {
    /// Compile every configured pattern. Invalid patterns are logged and
    /// skipped so one bad entry cannot disable a whole category.
    pub fn from_config(config: &DetectionConfig) -> Self {
        let mut set = RuleSet::default();

        for category in ThreatCategory::ALL {
            for pattern in config.patterns(category) {
                if let Err(e) = set.push(category, pattern) {
                    warn!(
                        category = ?category,
                        pattern = %pattern,
                        "Failed to compile detection pattern: {}",
                        e
                    );
                    set.rejected += 1;
                }
            }
        }

        set
    }

    /// Add a pattern at runtime
    pub fn push(&mut self, category: ThreatCategory, pattern: &str) -> Result<(), regex::Error> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .size_limit(1 << 20)
            .build()?;
        self.rules.push(CompiledRule { category, regex });
        Ok(())
    }

    /// First matching rule of `category`, with the matched text
    pub fn first_match<'t>(
        &self,
        category: ThreatCategory,
        text: &'t str,
    ) -> Option<(&CompiledRule, &'t str)> {
        self.rules
            .iter()
            .filter(|r| r.category == category)
            .find_map(|r| r.regex.find(text).map(|m| (r, m.as_str())))
    }

    pub fn count(&self, category: ThreatCategory) -> usize {
        self.rules.iter().filter(|r| r.category == category).count()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Patterns that failed to compile
    pub fn rejected(&self) -> usize {
        self.rejected
    }
}
