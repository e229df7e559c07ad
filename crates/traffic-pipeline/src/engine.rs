//! Detection engine -- scores a record against a rule snapshot.
//!
//! [`score`] is pure: same record and snapshot, same result. Statistics
//! are kept separately in [`DetectionStats`] and updated by the consumer.
//!
//! Scoring walks the snapshot in order (highest priority first). Each match
//! adds the rule's points, the running total is clamped to `0..=100` after
//! every addition, and a matching `stop_on_match` rule ends evaluation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use promptwatch_core::types::TrafficRecord;

use crate::rule::RuleSnapshot;

pub const MAX_SCORE: u8 = 100;

/// Outcome of scoring one record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScoreResult {
    /// `0..=100`
    pub score: u8,
    /// `score > 0`
    pub flagged: bool,
    /// Names of matched rules, in evaluation order.
    pub reasons: Vec<String>,
    /// Id of the `stop_on_match` rule that ended evaluation, if any.
    pub stopped_by: Option<String>,
}

impl ScoreResult {
    /// Value of the `flag_reason` column; `None` when nothing matched.
    pub fn flag_reason(&self) -> Option<String> {
        if self.reasons.is_empty() {
            None
        } else {
            Some(self.reasons.join(", "))
        }
    }
}

pub fn score(record: &TrafficRecord, snapshot: &RuleSnapshot) -> ScoreResult {
    let prompt_lower = record.prompt.to_lowercase();
    let mut result = ScoreResult::default();

    for rule in &snapshot.rules {
        if !rule.matches(record, &prompt_lower) {
            continue;
        }
        result.score = result.score.saturating_add(rule.points).min(MAX_SCORE);
        result.reasons.push(rule.name.clone());
        if rule.stop_on_match {
            result.stopped_by = Some(rule.id.clone());
            break;
        }
    }

    result.flagged = result.score > 0;
    result
}

/// Scores every record against the same snapshot.
pub fn score_batch(records: &[TrafficRecord], snapshot: &RuleSnapshot) -> Vec<ScoreResult> {
    records.iter().map(|record| score(record, snapshot)).collect()
}

/// Running detection counters, shared by all workers.
#[derive(Debug, Default)]
pub struct DetectionStats {
    processed: AtomicU64,
    flagged: AtomicU64,
    rule_hits: Mutex<HashMap<String, u64>>,
}

impl DetectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: &ScoreResult) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if !result.flagged {
            return;
        }
        self.flagged.fetch_add(1, Ordering::Relaxed);

        let mut hits = self
            .rule_hits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for name in &result.reasons {
            *hits.entry(name.clone()).or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self) -> DetectionStatsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let flagged = self.flagged.load(Ordering::Relaxed);
        let rule_hits = self
            .rule_hits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(name, count)| (name.clone(), *count))
            .collect();

        DetectionStatsSnapshot {
            processed,
            flagged,
            flag_rate: if processed == 0 {
                0.0
            } else {
                flagged as f64 / processed as f64
            },
            rule_hits,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionStatsSnapshot {
    pub processed: u64,
    pub flagged: u64,
    /// `flagged / processed`, 0 when nothing was processed.
    pub flag_rate: f64,
    /// Matches per rule name.
    pub rule_hits: BTreeMap<String, u64>,
}
