//! Rule cache -- compiled, versioned rule snapshots behind an atomic pointer.
//!
//! Workers call [`RuleCache::current`] once per micro-batch and score the
//! whole batch against that snapshot. A refresh builds a complete new
//! snapshot off to the side and publishes it with a single pointer swap, so
//! readers never wait on the store and never see a half-built rule list.
//!
//! ```text
//! RuleStore::load_active -> compile (drop failures) -> sort -> ArcSwap::store
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use promptwatch_core::metrics as m;

use super::compiled::CompiledRule;
use super::store::RuleStore;
use super::types::DetectionRule;
use crate::error::TrafficError;

/// A snapshot is stale once this many refresh intervals pass without a
/// successful refresh.
const STALE_INTERVALS: u32 = 3;

/// A rule that was loaded but left out of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedRule {
    pub id: String,
    pub name: String,
    pub reason: String,
}

/// Immutable, ordered set of compiled rules.
#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    /// Descending priority, ties by rule id ascending.
    pub rules: Vec<CompiledRule>,
    pub dropped: Vec<DroppedRule>,
}

impl RuleSnapshot {
    /// Version 0, no rules. Scores everything as 0.
    pub fn empty() -> Self {
        Self {
            version: 0,
            loaded_at: Utc::now(),
            rules: Vec::new(),
            dropped: Vec::new(),
        }
    }

    /// Compiles `rules` into a snapshot. Rules that fail to compile are
    /// dropped with a warning; the rest are kept.
    pub fn from_rules(version: u64, rules: &[DetectionRule]) -> Self {
        let mut compiled = Vec::with_capacity(rules.len());
        let mut dropped = Vec::new();

        for rule in rules {
            if !rule.has_known_category() {
                warn!(rule_id = %rule.id, category = %rule.category, "unknown rule category");
            }
            match CompiledRule::compile(rule) {
                Ok(c) => compiled.push(c),
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "dropping rule that failed to compile");
                    dropped.push(DroppedRule {
                        id: rule.id.clone(),
                        name: rule.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        compiled.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        Self {
            version,
            loaded_at: Utc::now(),
            rules: compiled,
            dropped,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Holds the active [`RuleSnapshot`] and refreshes it from a [`RuleStore`].
pub struct RuleCache<R: RuleStore> {
    store: Arc<R>,
    snapshot: ArcSwap<RuleSnapshot>,
    refresh_timeout: Duration,
    refresh_interval: Duration,
    last_success: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,
    /// Serializes refreshes so versions are assigned in publish order.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl<R: RuleStore> RuleCache<R> {
    pub fn new(store: Arc<R>, refresh_interval: Duration, refresh_timeout: Duration) -> Self {
        Self {
            store,
            snapshot: ArcSwap::from_pointee(RuleSnapshot::empty()),
            refresh_timeout,
            refresh_interval,
            last_success: Mutex::new(None),
            last_error: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Active snapshot. Never blocks on an in-progress refresh.
    pub fn current(&self) -> Arc<RuleSnapshot> {
        self.snapshot.load_full()
    }

    /// Loads, compiles and publishes a new snapshot.
    ///
    /// On a store failure or timeout the previous snapshot stays active and
    /// the error is returned.
    pub async fn refresh(&self) -> Result<Arc<RuleSnapshot>, TrafficError> {
        let _guard = self.refresh_lock.lock().await;

        let loaded = match tokio::time::timeout(self.refresh_timeout, self.store.load_active()).await
        {
            Ok(Ok(rules)) => rules,
            Ok(Err(e)) => return Err(self.refresh_failed(e)),
            Err(_) => {
                let timeout_ms = u64::try_from(self.refresh_timeout.as_millis()).unwrap_or(u64::MAX);
                return Err(self.refresh_failed(TrafficError::RefreshTimeout { timeout_ms }));
            }
        };

        let version = self.snapshot.load().version + 1;
        let snapshot = Arc::new(RuleSnapshot::from_rules(version, &loaded));
        self.snapshot.store(Arc::clone(&snapshot));

        *lock(&self.last_success) = Some(Instant::now());
        *lock(&self.last_error) = None;

        metrics::counter!(m::RULES_REFRESH_TOTAL, m::LABEL_RESULT => "success").increment(1);
        metrics::gauge!(m::RULES_LOADED).set(snapshot.len() as f64);
        metrics::gauge!(m::RULES_SNAPSHOT_VERSION).set(version as f64);

        debug!(
            version,
            rules = snapshot.len(),
            dropped = snapshot.dropped.len(),
            "published rule snapshot"
        );
        Ok(snapshot)
    }

    /// Refreshes immediately and logs the outcome at info level.
    pub async fn force_refresh(&self) -> Result<Arc<RuleSnapshot>, TrafficError> {
        let snapshot = self.refresh().await?;
        info!(
            version = snapshot.version,
            rules = snapshot.len(),
            dropped = snapshot.dropped.len(),
            "rule cache refreshed"
        );
        Ok(snapshot)
    }

    /// Spawns the periodic refresher. The first tick fires one `interval`
    /// from now; callers load the initial snapshot themselves.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("rule refresher stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = cache.refresh().await {
                            warn!(error = %e, "rule refresh failed, keeping previous snapshot");
                        }
                    }
                }
            }
        })
    }

    /// Rules in the current snapshot.
    pub fn rule_count(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Version of the current snapshot; bumped by every successful refresh.
    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    /// Error of the most recent failed refresh, kept until the next success.
    pub fn last_refresh_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// Whether any refresh has ever succeeded.
    pub fn has_loaded(&self) -> bool {
        lock(&self.last_success).is_some()
    }

    /// Loaded, but no successful refresh for more than three intervals.
    pub fn is_stale(&self) -> bool {
        match *lock(&self.last_success) {
            Some(at) => at.elapsed() > self.refresh_interval * STALE_INTERVALS,
            None => false,
        }
    }

    /// Period of the background refresher.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    fn refresh_failed(&self, err: TrafficError) -> TrafficError {
        *lock(&self.last_error) = Some(err.to_string());
        metrics::counter!(m::RULES_REFRESH_TOTAL, m::LABEL_RESULT => "failure").increment(1);
        err
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::store::MemoryRuleStore;
    use crate::rule::types::RuleType;
    use promptwatch_core::types::Severity;

    fn rule(id: &str, priority: i32, pattern: &str) -> DetectionRule {
        DetectionRule {
            id: id.to_owned(),
            name: format!("Rule {id}"),
            description: String::new(),
            rule_type: RuleType::Regex,
            pattern: pattern.to_owned(),
            points: 10,
            priority,
            stop_on_match: false,
            is_active: true,
            category: "security".to_owned(),
            severity: Severity::Medium,
        }
    }

    fn cache(store: Arc<MemoryRuleStore>) -> RuleCache<MemoryRuleStore> {
        RuleCache::new(store, Duration::from_secs(60), Duration::from_secs(1))
    }

    #[test]
    fn snapshot_orders_by_priority_then_id() {
        let snapshot = RuleSnapshot::from_rules(
            1,
            &[rule("b", 10, "x"), rule("c", 50, "x"), rule("a", 10, "x")],
        );
        let ids: Vec<_> = snapshot.rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn snapshot_drops_rules_that_fail_to_compile() {
        let snapshot = RuleSnapshot::from_rules(1, &[rule("ok", 1, "x"), rule("bad", 1, "([")]);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.dropped.len(), 1);
        assert_eq!(snapshot.dropped[0].id, "bad");
    }

    #[tokio::test]
    async fn refresh_increments_version() {
        let store = Arc::new(MemoryRuleStore::with_rules([rule("a", 1, "x")]));
        let cache = cache(Arc::clone(&store));
        assert_eq!(cache.version(), 0);
        assert!(!cache.has_loaded());

        cache.refresh().await.unwrap();
        assert_eq!(cache.version(), 1);
        assert_eq!(cache.rule_count(), 1);
        assert!(cache.has_loaded());

        store.upsert(rule("b", 1, "y"));
        cache.force_refresh().await.unwrap();
        assert_eq!(cache.version(), 2);
        assert_eq!(cache.rule_count(), 2);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let store = Arc::new(MemoryRuleStore::with_rules([rule("a", 1, "x")]));
        let cache = cache(Arc::clone(&store));
        cache.refresh().await.unwrap();

        store.set_failure(Some("db down"));
        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.version(), 1);
        assert_eq!(cache.rule_count(), 1);
        assert!(cache.last_refresh_error().unwrap().contains("db down"));

        store.set_failure(None);
        cache.refresh().await.unwrap();
        assert!(cache.last_refresh_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out() {
        let store = Arc::new(MemoryRuleStore::with_rules([rule("a", 1, "x")]));
        store.set_delay(Some(Duration::from_secs(30)));
        let cache = cache(Arc::clone(&store));

        let err = cache.refresh().await.unwrap_err();
        assert!(matches!(err, TrafficError::RefreshTimeout { timeout_ms: 1000 }));
        assert_eq!(cache.version(), 0);
    }

    #[tokio::test]
    async fn held_snapshot_is_unaffected_by_refresh() {
        let store = Arc::new(MemoryRuleStore::with_rules([rule("a", 1, "x")]));
        let cache = cache(Arc::clone(&store));
        cache.refresh().await.unwrap();

        let held = cache.current();
        store.remove("a");
        cache.refresh().await.unwrap();

        assert_eq!(held.len(), 1);
        assert_eq!(cache.current().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refresher_runs_on_interval_and_stops_on_cancel() {
        let store = Arc::new(MemoryRuleStore::with_rules([rule("a", 1, "x")]));
        let cache = Arc::new(cache(Arc::clone(&store)));
        let cancel = CancellationToken::new();
        let handle = cache.spawn_refresher(Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.version(), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(cache.version(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_after_three_missed_intervals() {
        let store = Arc::new(MemoryRuleStore::with_rules([rule("a", 1, "x")]));
        let cache = cache(Arc::clone(&store));
        assert!(!cache.is_stale());

        cache.refresh().await.unwrap();
        tokio::time::advance(Duration::from_secs(179)).await;
        assert!(!cache.is_stale());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.is_stale());
    }
}
