//! Tiered fixed-quota rate limiting
//!
//! Independent of attack detection. Each route class declares a
//! `(window, max_requests)` policy; requests are counted per `client|tier`
//! in a sliding window. Rejected requests are not counted, so a compliant
//! client that waits for the retry hint gets through.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{Millis, HOUR_MS, MINUTE_MS, SECOND_MS};
use crate::window::WindowCounter;

/// Named rate-limit bucket applied to a class of routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateTier {
    /// Sensitive admin and system operations
    Strict,
    /// Authentication
    Auth,
    /// Default API traffic
    General,
    /// File operations
    Upload,
    /// Externally metered AI-backed operations
    Ai,
}

impl RateTier {
    pub const ALL: [RateTier; 5] = [
        RateTier::Strict,
        RateTier::Auth,
        RateTier::General,
        RateTier::Upload,
        RateTier::Ai,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RateTier::Strict => "strict",
            RateTier::Auth => "auth",
            RateTier::General => "general",
            RateTier::Upload => "upload",
            RateTier::Ai => "ai",
        }
    }
}

impl std::fmt::Display for RateTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RateTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(RateTier::Strict),
            "auth" | "moderate" => Ok(RateTier::Auth),
            "general" => Ok(RateTier::General),
            "upload" => Ok(RateTier::Upload),
            "ai" => Ok(RateTier::Ai),
            _ => Err(format!("Unknown rate tier: {}", s)),
        }
    }
}

/// Quota per window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub window_secs: u64,
    pub max_requests: u32,
}

impl TierPolicy {
    pub const fn new(window_ms: Millis, max_requests: u32) -> Self {
        Self {
            window_secs: window_ms / SECOND_MS,
            max_requests,
        }
    }

    pub fn window_ms(&self) -> Millis {
        self.window_secs * SECOND_MS
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_strict")]
    pub strict: TierPolicy,

    #[serde(default = "default_auth")]
    pub auth: TierPolicy,

    #[serde(default = "default_general")]
    pub general: TierPolicy,

    #[serde(default = "default_upload")]
    pub upload: TierPolicy,

    #[serde(default = "default_ai")]
    pub ai: TierPolicy,
}

impl RateLimitConfig {
    pub fn policy(&self, tier: RateTier) -> TierPolicy {
        match tier {
            RateTier::Strict => self.strict,
            RateTier::Auth => self.auth,
            RateTier::General => self.general,
            RateTier::Upload => self.upload,
            RateTier::Ai => self.ai,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strict: default_strict(),
            auth: default_auth(),
            general: default_general(),
            upload: default_upload(),
            ai: default_ai(),
        }
    }
}

fn default_strict() -> TierPolicy {
    TierPolicy::new(15 * MINUTE_MS, 10)
}

fn default_auth() -> TierPolicy {
    TierPolicy::new(15 * MINUTE_MS, 20)
}

fn default_general() -> TierPolicy {
    TierPolicy::new(15 * MINUTE_MS, 1000)
}

fn default_upload() -> TierPolicy {
    TierPolicy::new(HOUR_MS, 50)
}

fn default_ai() -> TierPolicy {
    TierPolicy::new(MINUTE_MS, 20)
}

/// Outcome of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after_ms: Millis, limit: u32 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    counter: WindowCounter,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            counter: WindowCounter::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count this request against `tier` unless the quota is already spent
    pub fn check(&self, client: &str, tier: RateTier, now: Millis) -> RateDecision {
        let policy = self.config.policy(tier);
        let window_ms = policy.window_ms();
        let key = WindowCounter::key(client, tier.as_str());

        match self
            .counter
            .record_within(&key, now, window_ms, policy.max_requests as usize)
        {
            Ok(used) => RateDecision::Allowed {
                remaining: policy.max_requests.saturating_sub(used as u32),
            },
            Err(oldest) => {
                let retry_after_ms = (oldest + window_ms).saturating_sub(now).max(1);

                debug!(
                    client = %client,
                    tier = %tier,
                    limit = policy.max_requests,
                    retry_after_ms,
                    "Rate limit exceeded"
                );
                RateDecision::Limited {
                    retry_after_ms,
                    limit: policy.max_requests,
                }
            }
        }
    }

    /// Evict windows with no recent requests
    pub fn sweep(&self, now: Millis) -> usize {
        let longest = RateTier::ALL
            .iter()
            .map(|t| self.config.policy(*t).window_ms())
            .max()
            .unwrap_or(HOUR_MS);
        self.counter.sweep(now, longest)
    }

    pub fn tracked_keys(&self) -> usize {
        self.counter.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: Millis) -> RateLimiter {
        let mut config = RateLimitConfig::default();
        config.general = TierPolicy::new(window_ms, max);
        RateLimiter::new(config)
    }

    #[test]
    fn test_default_tiers() {
        let config = RateLimitConfig::default();
        assert!(config.strict.max_requests < config.general.max_requests);
        assert_eq!(config.ai.window_ms(), MINUTE_MS);
        assert_eq!(config.upload.window_ms(), HOUR_MS);
    }

    #[test]
    fn test_quota_then_limited_with_retry_hint() {
        let limiter = limiter(3, 10_000);

        assert_eq!(
            limiter.check("c", RateTier::General, 0),
            RateDecision::Allowed { remaining: 2 }
        );
        limiter.check("c", RateTier::General, 1_000);
        limiter.check("c", RateTier::General, 2_000);

        match limiter.check("c", RateTier::General, 4_000) {
            RateDecision::Limited { retry_after_ms, limit } => {
                assert_eq!(limit, 3);
                // oldest at 0 leaves the window at 10_000
                assert_eq!(retry_after_ms, 6_000);
            }
            other => panic!("expected limit, got {:?}", other),
        }

        // first request slid out
        assert!(limiter.check("c", RateTier::General, 10_001).is_allowed());
    }

    #[test]
    fn test_tiers_and_clients_are_independent() {
        let limiter = limiter(1, 10_000);
        assert!(limiter.check("a", RateTier::General, 0).is_allowed());
        assert!(!limiter.check("a", RateTier::General, 1).is_allowed());
        assert!(limiter.check("b", RateTier::General, 1).is_allowed());
        assert!(limiter.check("a", RateTier::Upload, 1).is_allowed());
    }

    #[test]
    fn test_rejected_requests_do_not_extend_the_window() {
        let limiter = limiter(1, 1_000);
        limiter.check("a", RateTier::General, 0);
        for t in 1..10 {
            assert!(!limiter.check("a", RateTier::General, t * 50).is_allowed());
        }
        assert!(limiter.check("a", RateTier::General, 1_001).is_allowed());
    }

    #[test]
    fn test_retry_at_exactly_the_hint_is_allowed() {
        let mut config = RateLimitConfig::default();
        config.ai = TierPolicy::new(MINUTE_MS, 1);
        let limiter = RateLimiter::new(config);

        assert!(limiter.check("c", RateTier::Ai, 4_000).is_allowed());
        let retry_after_ms = match limiter.check("c", RateTier::Ai, 8_000) {
            RateDecision::Limited { retry_after_ms, .. } => retry_after_ms,
            other => panic!("expected limit, got {:?}", other),
        };
        assert_eq!(retry_after_ms, 56_000);

        // one millisecond early is still inside the window
        assert!(!limiter.check("c", RateTier::Ai, 8_000 + retry_after_ms - 1).is_allowed());
        assert_eq!(
            limiter.check("c", RateTier::Ai, 8_000 + retry_after_ms),
            RateDecision::Allowed { remaining: 0 }
        );
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("moderate".parse::<RateTier>().unwrap(), RateTier::Auth);
        assert_eq!("AI".parse::<RateTier>().unwrap(), RateTier::Ai);
        assert!("bogus".parse::<RateTier>().is_err());
    }
}
