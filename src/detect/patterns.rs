//! Stateless content matchers
//!
//! Each matcher runs the compiled rules of one [`ThreatCategory`] over the
//! part of the request that category inspects. Matching is a linear scan
//! over the whole text; the size bound is the body limit enforced before
//! evaluation, so nothing past a prefix goes unmatched.

use std::sync::Arc;
use tracing::trace;

use super::rules::{DetectionConfig, MatchScope, RuleSet, ThreatCategory};
use super::{Detection, Detector};
use crate::clock::Millis;
use crate::error::DetectorError;
use crate::models::RequestView;

/// Longest matched excerpt carried into event details
const MAX_EXCERPT: usize = 128;

#[derive(Debug)]
pub struct ThreatDetector {
    rules: RuleSet,
    enabled: bool,
}

impl ThreatDetector {
    pub fn new(config: &DetectionConfig) -> Self {
        Self::with_rules(RuleSet::from_config(config), config)
    }

    pub fn with_rules(rules: RuleSet, config: &DetectionConfig) -> Self {
        Self {
            rules,
            enabled: config.enabled,
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// SQL keyword and operator patterns over URL, query and body
    pub fn detect_injection_attempt(&self, request: &RequestView) -> Option<Detection> {
        self.scan(ThreatCategory::SqlInjection, request)
    }

    /// Markup and script patterns over URL, query and body
    pub fn detect_script_injection(&self, request: &RequestView) -> Option<Detection> {
        self.scan(ThreatCategory::ScriptInjection, request)
    }

    /// Traversal sequences over the URL only
    pub fn detect_path_traversal(&self, request: &RequestView) -> Option<Detection> {
        self.scan(ThreatCategory::PathTraversal, request)
    }

    pub fn scan(&self, category: ThreatCategory, request: &RequestView) -> Option<Detection> {
        if !self.enabled {
            return None;
        }

        let text = match category.scope() {
            MatchScope::Url => request.inspection_url(),
            MatchScope::UrlQueryBody => request.inspection_text(),
        };
        let (_, matched) = self.rules.first_match(category, &text)?;
        trace!(
            client = %request.client_id,
            category = ?category,
            matched = %matched,
            "Pattern matched"
        );

        Some(
            Detection::new(
                category.event_type(),
                category.detector_name(),
                truncate_at_boundary(matched, MAX_EXCERPT),
            )
            .with_detail("pattern", truncate_at_boundary(matched, MAX_EXCERPT)),
        )
    }
}

/// One category of [`ThreatDetector`] exposed as a [`Detector`]
#[derive(Debug)]
pub struct PatternDetector {
    category: ThreatCategory,
    threats: Arc<ThreatDetector>,
}

impl PatternDetector {
    pub fn new(category: ThreatCategory, threats: Arc<ThreatDetector>) -> Self {
        Self { category, threats }
    }
}

impl Detector for PatternDetector {
    fn name(&self) -> &'static str {
        self.category.detector_name()
    }

    fn inspect(&self, request: &RequestView, _now: Millis) -> Result<Option<Detection>, DetectorError> {
        Ok(self.threats.scan(self.category, request))
    }
}

fn truncate_at_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
