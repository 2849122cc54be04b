//! Request-level threat detection
//!
//! Every detector sits behind the [`Detector`] trait so the monitor can run
//! them uniformly, in a fixed order, and isolate failures:
//!
//! 1. SQL injection ([`patterns::ThreatDetector::detect_injection_attempt`])
//! 2. Script injection ([`patterns::ThreatDetector::detect_script_injection`])
//! 3. Path traversal ([`patterns::ThreatDetector::detect_path_traversal`])
//! 4. Brute force on authentication routes ([`brute_force::BruteForceTracker`])
//! 5. Anomalous signatures ([`anomaly::ActivityTracker`])

pub mod anomaly;
pub mod brute_force;
pub mod patterns;
pub mod rules;

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clock::Millis;
use crate::error::DetectorError;
use crate::models::{RequestView, SecurityEventType};

pub use anomaly::{ActivityTracker, AnomalyConfig};
pub use brute_force::{BruteForceConfig, BruteForceTracker};
pub use patterns::{PatternDetector, ThreatDetector};
pub use rules::{DetectionConfig, RuleSet, ThreatCategory};

/// Positive detector result
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub event_type: SecurityEventType,
    /// Matched text, signature or counter that triggered the hit
    pub matched: String,
    /// Name of the detector that fired
    pub source: &'static str,
    pub details: BTreeMap<String, Value>,
}

impl Detection {
    pub fn new(event_type: SecurityEventType, source: &'static str, matched: impl Into<String>) -> Self {
        Self {
            event_type,
            matched: matched.into(),
            source,
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// A single request inspection step
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` is a clean pass. Errors are treated as a non-match by the
    /// caller and reported as operational errors.
    fn inspect(&self, request: &RequestView, now: Millis) -> Result<Option<Detection>, DetectorError>;
}

/// Built-in detectors in evaluation order
pub fn default_detectors(
    threats: Arc<ThreatDetector>,
    brute_force: Arc<BruteForceTracker>,
    activity: Arc<ActivityTracker>,
) -> Vec<Arc<dyn Detector>> {
    let mut detectors: Vec<Arc<dyn Detector>> = ThreatCategory::ALL
        .iter()
        .map(|category| {
            Arc::new(PatternDetector::new(*category, Arc::clone(&threats))) as Arc<dyn Detector>
        })
        .collect();
    detectors.push(brute_force);
    detectors.push(activity);
    detectors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_order() {
        let config = DetectionConfig::default();
        let detectors = default_detectors(
            Arc::new(ThreatDetector::new(&config)),
            Arc::new(BruteForceTracker::with_config(
                BruteForceConfig::default(),
                config.auth_routes.clone(),
            )),
            Arc::new(ActivityTracker::new(AnomalyConfig::default(), &config.scanner_agents)),
        );

        let names: Vec<_> = detectors.iter().map(|d| d.name()).collect();
        assert_eq!(
            names,
            vec![
                "sql_injection",
                "script_injection",
                "path_traversal",
                "brute_force",
                "anomalous_signature",
            ]
        );
    }
}
