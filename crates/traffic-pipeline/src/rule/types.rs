//! Detection rule data types
//!
//! Rules come from the `detection_rules` table or from YAML files; both
//! deserialize into [`DetectionRule`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use promptwatch_core::types::Severity;

use crate::error::TrafficError;

pub const MAX_RULE_ID_LEN: usize = 256;
pub const MAX_POINTS: i32 = 100;
pub const MAX_PRIORITY: i32 = 1000;

/// Categories the dashboard knows about. Others are accepted with a warning.
pub const KNOWN_CATEGORIES: &[&str] = &["data_privacy", "security", "compliance"];

/// A detection rule as stored.
///
/// # YAML schema
/// ```yaml
/// id: critical-keywords
/// name: Critical Keywords
/// description: Credentials pasted into prompts
/// rule_type: keyword
/// pattern: "password,secret,api_key"
/// points: 50
/// priority: 100
/// stop_on_match: false
/// category: data_privacy
/// severity: high
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub rule_type: RuleType,
    /// Comma-separated keywords, a regex, a comma-separated model list, or
    /// a `field op number` expression, depending on `rule_type`.
    pub pattern: String,
    pub points: i32,
    /// Higher evaluates first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub stop_on_match: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub severity: Severity,
}

fn default_active() -> bool {
    true
}

fn default_category() -> String {
    "security".to_owned()
}

impl DetectionRule {
    pub fn validate(&self) -> Result<(), TrafficError> {
        if self.id.trim().is_empty() {
            return Err(TrafficError::RuleValidation {
                rule_id: "(empty)".to_owned(),
                reason: "rule id must not be empty".to_owned(),
            });
        }

        if self.id.len() > MAX_RULE_ID_LEN {
            return Err(self.invalid(format!(
                "rule id must not exceed {MAX_RULE_ID_LEN} characters"
            )));
        }

        if self.name.trim().is_empty() {
            return Err(self.invalid("rule name must not be empty"));
        }

        if self.pattern.trim().is_empty() {
            return Err(self.invalid("pattern must not be empty"));
        }

        if !(0..=MAX_POINTS).contains(&self.points) {
            return Err(self.invalid(format!("points must be 0-{MAX_POINTS}")));
        }

        if !(0..=MAX_PRIORITY).contains(&self.priority) {
            return Err(self.invalid(format!("priority must be 0-{MAX_PRIORITY}")));
        }

        Ok(())
    }

    pub fn has_known_category(&self) -> bool {
        KNOWN_CATEGORIES.contains(&self.category.as_str())
    }

    fn invalid(&self, reason: impl Into<String>) -> TrafficError {
        TrafficError::RuleValidation {
            rule_id: self.id.clone(),
            reason: reason.into(),
        }
    }
}

/// How a rule's pattern is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Keyword,
    Regex,
    ModelRestriction,
    CustomScoring,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Regex => "regex",
            Self::ModelRestriction => "model_restriction",
            Self::CustomScoring => "custom_scoring",
        }
    }
}

impl FromStr for RuleType {
    type Err = TrafficError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "keyword" => Ok(Self::Keyword),
            "regex" => Ok(Self::Regex),
            "model_restriction" => Ok(Self::ModelRestriction),
            "custom_scoring" => Ok(Self::CustomScoring),
            other => Err(TrafficError::RuleValidation {
                rule_id: "(unknown)".to_owned(),
                reason: format!("unknown rule_type '{other}'"),
            }),
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
