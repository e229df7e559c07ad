//! Compiled rules -- patterns are prepared once per refresh, not per record.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};

use promptwatch_core::types::{Severity, TrafficRecord};

use super::expr::ScoreExpr;
use super::types::{DetectionRule, RuleType};
use crate::error::TrafficError;

/// Compiled regex program size cap.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Prepared matcher, one variant per rule type.
#[derive(Debug, Clone)]
pub enum RuleMatcher {
    /// Lower-cased, trimmed, non-empty keywords.
    Keyword(Vec<String>),
    /// Case-insensitive.
    Regex(Regex),
    /// Lower-cased blocked model names.
    ModelRestriction(HashSet<String>),
    CustomScoring(ScoreExpr),
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: String,
    pub name: String,
    pub points: u8,
    pub priority: i32,
    pub stop_on_match: bool,
    pub category: String,
    pub severity: Severity,
    pub matcher: RuleMatcher,
}

impl CompiledRule {
    /// Validates and compiles a stored rule.
    pub fn compile(rule: &DetectionRule) -> Result<Self, TrafficError> {
        rule.validate()?;

        let compile_error = |reason: String| TrafficError::RuleCompile {
            rule_id: rule.id.clone(),
            reason,
        };

        let matcher = match rule.rule_type {
            RuleType::Keyword => {
                let keywords = split_list(&rule.pattern);
                if keywords.is_empty() {
                    return Err(compile_error("no keywords in pattern".to_owned()));
                }
                RuleMatcher::Keyword(keywords)
            }
            RuleType::Regex => {
                let regex = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .size_limit(REGEX_SIZE_LIMIT)
                    .build()
                    .map_err(|e| compile_error(format!("invalid regex: {e}")))?;
                RuleMatcher::Regex(regex)
            }
            RuleType::ModelRestriction => {
                let models: HashSet<String> = split_list(&rule.pattern).into_iter().collect();
                if models.is_empty() {
                    return Err(compile_error("no models in pattern".to_owned()));
                }
                RuleMatcher::ModelRestriction(models)
            }
            RuleType::CustomScoring => {
                RuleMatcher::CustomScoring(ScoreExpr::parse(&rule.pattern).map_err(compile_error)?)
            }
        };

        // validate() bounds points to 0..=100
        let points = u8::try_from(rule.points).unwrap_or(0);

        Ok(Self {
            id: rule.id.clone(),
            name: rule.name.clone(),
            points,
            priority: rule.priority,
            stop_on_match: rule.stop_on_match,
            category: rule.category.clone(),
            severity: rule.severity,
            matcher,
        })
    }

    /// `prompt_lower` is the record's prompt, lower-cased once by the caller.
    pub fn matches(&self, record: &TrafficRecord, prompt_lower: &str) -> bool {
        match &self.matcher {
            RuleMatcher::Keyword(keywords) => keywords
                .iter()
                .any(|keyword| prompt_lower.contains(keyword.as_str())),
            RuleMatcher::Regex(regex) => regex.is_match(&record.prompt),
            RuleMatcher::ModelRestriction(models) => models.contains(&record.model.to_lowercase()),
            RuleMatcher::CustomScoring(expr) => expr.evaluate(record),
        }
    }

    pub fn rule_type(&self) -> RuleType {
        match self.matcher {
            RuleMatcher::Keyword(_) => RuleType::Keyword,
            RuleMatcher::Regex(_) => RuleType::Regex,
            RuleMatcher::ModelRestriction(_) => RuleType::ModelRestriction,
            RuleMatcher::CustomScoring(_) => RuleType::CustomScoring,
        }
    }
}

fn split_list(pattern: &str) -> Vec<String> {
    pattern
        .split(',')
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}
