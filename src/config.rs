use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::alert::AlertConfig;
use crate::clock::{Millis, SECOND_MS};
use crate::detect::anomaly::AnomalyConfig;
use crate::detect::brute_force::BruteForceConfig;
use crate::detect::rules::DetectionConfig;
use crate::rate_limit::RateLimitConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub brute_force: BruteForceConfig,

    #[serde(default)]
    pub anomaly: AnomalyConfig,

    #[serde(default)]
    pub blocking: BlockingConfig,

    #[serde(default)]
    pub alert: AlertConfig,

    #[serde(default)]
    pub redaction: RedactionConfig,

    #[serde(default)]
    pub crypto: CryptoConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/crguard/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("crguard/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.is_file() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log filter when `RUST_LOG` is unset; `--debug` overrides both
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Address the demo server binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Largest request body buffered for inspection
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Honour X-Forwarded-For / X-Real-IP from any peer. Only safe when every
    /// connection arrives through a proxy that overwrites those headers.
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Proxy addresses whose forwarding headers are honoured
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,

    /// Environment variable holding the admin bearer token for the stats endpoint
    #[serde(default = "default_admin_token_env")]
    pub admin_token_env: String,

    /// Number of attackers returned by the stats query
    #[serde(default = "default_top_attackers")]
    pub top_attackers: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            listen_addr: default_listen_addr(),
            max_body_bytes: default_max_body_bytes(),
            trust_forwarded_for: false,
            trusted_proxies: Vec::new(),
            admin_token_env: default_admin_token_env(),
            top_attackers: default_top_attackers(),
        }
    }
}

/// Block lifetimes per severity class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockingConfig {
    /// SQL injection, script injection and path traversal (seconds)
    #[serde(default = "default_long_block")]
    pub injection_secs: u64,

    /// Brute force on authentication routes (seconds)
    #[serde(default = "default_long_block")]
    pub brute_force_secs: u64,

    /// Scanner agents, endpoint scanning, high frequency (seconds)
    #[serde(default = "default_short_block")]
    pub anomaly_secs: u64,

    /// Background sweep interval (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl BlockingConfig {
    pub fn injection_ms(&self) -> Millis {
        self.injection_secs * SECOND_MS
    }

    pub fn brute_force_ms(&self) -> Millis {
        self.brute_force_secs * SECOND_MS
    }

    pub fn anomaly_ms(&self) -> Millis {
        self.anomaly_secs * SECOND_MS
    }
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            injection_secs: default_long_block(),
            brute_force_secs: default_long_block(),
            anomaly_secs: default_short_block(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionConfig {
    /// Field names (case-insensitive substrings) whose values are replaced
    #[serde(default = "default_sensitive_fields")]
    pub fields: Vec<String>,

    /// Replacement text
    #[serde(default = "default_redaction_marker")]
    pub marker: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            fields: default_sensitive_fields(),
            marker: default_redaction_marker(),
        }
    }
}

/// Key material is always supplied by the host, never generated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Hex-encoded 32 byte AES key (prefer the environment variable)
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Environment variable holding the hex encryption key
    #[serde(default = "default_encryption_key_env")]
    pub encryption_key_env: String,

    /// Signing secret (prefer the environment variable)
    #[serde(default)]
    pub signing_secret: Option<String>,

    /// Environment variable holding the signing secret
    #[serde(default = "default_signing_secret_env")]
    pub signing_secret_env: String,

    /// PBKDF2 iteration count for password hashing
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,
}

impl CryptoConfig {
    /// Configured value first, then the named environment variable
    pub fn resolve_encryption_key(&self) -> Option<String> {
        self.encryption_key
            .clone()
            .or_else(|| std::env::var(&self.encryption_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn resolve_signing_secret(&self) -> Option<String> {
        self.signing_secret
            .clone()
            .or_else(|| std::env::var(&self.signing_secret_env).ok())
            .filter(|s| !s.is_empty())
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            encryption_key: None,
            encryption_key_env: default_encryption_key_env(),
            signing_secret: None,
            signing_secret_env: default_signing_secret_env(),
            pbkdf2_iterations: default_pbkdf2_iterations(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_admin_token_env() -> String {
    "CRGUARD_ADMIN_TOKEN".to_string()
}

fn default_top_attackers() -> usize {
    10
}

fn default_long_block() -> u64 {
    86_400 // 24 hours
}

fn default_short_block() -> u64 {
    3_600 // 1 hour
}

fn default_sweep_interval() -> u64 {
    3_600
}

fn default_sensitive_fields() -> Vec<String> {
    [
        "password",
        "passwd",
        "token",
        "secret",
        "authorization",
        "api_key",
        "apikey",
        "credential",
        "cookie",
        "session",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_redaction_marker() -> String {
    "[REDACTED]".to_string()
}

fn default_encryption_key_env() -> String {
    "CRGUARD_ENCRYPTION_KEY".to_string()
}

fn default_signing_secret_env() -> String {
    "CRGUARD_SIGNING_SECRET".to_string()
}

fn default_pbkdf2_iterations() -> u32 {
    100_000
}
