//! Rule store adapters -- where active detection rules are read from.
//!
//! The rule cache only needs [`RuleStore::load_active`]. Implementations:
//!
//! - [`PgRuleStore`]: the `detection_rules` table
//! - [`FileRuleStore`]: a directory of YAML files
//! - [`MemoryRuleStore`]: in-process, used by tests and the `memory` backend

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::types::DetectionRule;
use crate::error::TrafficError;
use crate::storage::postgres::PgRuleStore;

const MAX_RULE_FILE_SIZE: u64 = 10 * 1024 * 1024;
const MAX_RULES_COUNT: usize = 10_000;

/// Source of active detection rules.
pub trait RuleStore: Send + Sync + 'static {
    /// Returns every rule with `is_active = true`. Order is not significant.
    fn load_active(&self) -> impl Future<Output = Result<Vec<DetectionRule>, TrafficError>> + Send;
}

impl<R: RuleStore> RuleStore for std::sync::Arc<R> {
    fn load_active(&self) -> impl Future<Output = Result<Vec<DetectionRule>, TrafficError>> + Send {
        (**self).load_active()
    }
}

// --- YAML directory ---

/// A rule file holds one rule or a list of rules.
#[derive(Deserialize)]
#[serde(untagged)]
enum RuleFile {
    Many(Vec<DetectionRule>),
    One(Box<DetectionRule>),
}

/// Loads `*.yml` / `*.yaml` files from a directory on every refresh.
///
/// Unreadable or invalid files are skipped with a warning; duplicate ids
/// keep the first occurrence.
#[derive(Debug, Clone)]
pub struct FileRuleStore {
    dir: PathBuf,
}

impl FileRuleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads all rules in the directory, active or not.
    pub async fn load_all(&self) -> Result<Vec<DetectionRule>, TrafficError> {
        let dir = self.dir.as_path();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| TrafficError::RuleLoad {
                path: dir.display().to_string(),
                reason: format!("failed to read directory: {e}"),
            })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TrafficError::RuleLoad {
                path: dir.display().to_string(),
                reason: format!("failed to read directory entry: {e}"),
            })?
        {
            let path = entry.path();
            if path
                .extension()
                .is_some_and(|ext| ext == "yml" || ext == "yaml")
            {
                paths.push(path);
            }
        }
        // deterministic duplicate resolution
        paths.sort();

        let mut rules = Vec::new();
        let mut seen_ids = HashSet::new();
        for path in paths {
            let loaded = match Self::load_file(&path).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load rule file, skipping");
                    continue;
                }
            };

            for rule in loaded {
                if !seen_ids.insert(rule.id.clone()) {
                    warn!(rule_id = %rule.id, path = %path.display(), "duplicate rule id, skipping");
                    continue;
                }
                rules.push(rule);
            }

            if rules.len() > MAX_RULES_COUNT {
                return Err(TrafficError::RuleLoad {
                    path: dir.display().to_string(),
                    reason: format!("too many rules: max {MAX_RULES_COUNT}"),
                });
            }
        }

        debug!(dir = %dir.display(), count = rules.len(), "read rule files");
        Ok(rules)
    }

    pub async fn load_file(path: impl AsRef<Path>) -> Result<Vec<DetectionRule>, TrafficError> {
        let path = path.as_ref();
        let load_error = |reason: String| TrafficError::RuleLoad {
            path: path.display().to_string(),
            reason,
        };

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| load_error(format!("failed to read file metadata: {e}")))?;
        if metadata.len() > MAX_RULE_FILE_SIZE {
            return Err(load_error(format!(
                "file too large: {} bytes (max: {MAX_RULE_FILE_SIZE})",
                metadata.len()
            )));
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| load_error(format!("failed to read file: {e}")))?;

        Self::parse_yaml(&content, &path.display().to_string())
    }

    pub fn parse_yaml(yaml: &str, source: &str) -> Result<Vec<DetectionRule>, TrafficError> {
        let file: RuleFile = serde_yaml::from_str(yaml).map_err(|e| TrafficError::RuleLoad {
            path: source.to_owned(),
            reason: format!("YAML parse error: {e}"),
        })?;
        Ok(match file {
            RuleFile::Many(rules) => rules,
            RuleFile::One(rule) => vec![*rule],
        })
    }
}

impl RuleStore for FileRuleStore {
    async fn load_active(&self) -> Result<Vec<DetectionRule>, TrafficError> {
        let mut rules = self.load_all().await?;
        rules.retain(|rule| rule.is_active);
        Ok(rules)
    }
}

// --- in-memory ---

/// In-process rule table.
///
/// Stands in for the administrative interface in tests: rules can be
/// added, edited, deactivated, and loads can be made to fail or stall.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: Mutex<BTreeMap<String, DetectionRule>>,
    failure: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
    loads: AtomicU64,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = DetectionRule>) -> Self {
        let store = Self::new();
        for rule in rules {
            store.upsert(rule);
        }
        store
    }

    /// Inserts or replaces a rule by id.
    pub fn upsert(&self, rule: DetectionRule) {
        lock(&self.rules).insert(rule.id.clone(), rule);
    }

    pub fn remove(&self, rule_id: &str) -> Option<DetectionRule> {
        lock(&self.rules).remove(rule_id)
    }

    /// Returns false when the rule does not exist.
    pub fn set_active(&self, rule_id: &str, active: bool) -> bool {
        match lock(&self.rules).get_mut(rule_id) {
            Some(rule) => {
                rule.is_active = active;
                true
            }
            None => false,
        }
    }

    /// Makes every subsequent load fail with `reason` until cleared with `None`.
    pub fn set_failure(&self, reason: Option<&str>) {
        *lock(&self.failure) = reason.map(str::to_owned);
    }

    /// Delays every subsequent load.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    pub fn len(&self) -> usize {
        lock(&self.rules).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `load_active` calls so far.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

impl RuleStore for MemoryRuleStore {
    async fn load_active(&self) -> Result<Vec<DetectionRule>, TrafficError> {
        self.loads.fetch_add(1, Ordering::Relaxed);

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = lock(&self.failure).clone() {
            return Err(TrafficError::RuleStore(reason));
        }

        Ok(lock(&self.rules)
            .values()
            .filter(|rule| rule.is_active)
            .cloned()
            .collect())
    }
}

// --- backend selection ---

/// Rule source chosen from `detection.rule_source`.
pub enum RuleSource {
    Database(PgRuleStore),
    Directory(FileRuleStore),
    Memory(std::sync::Arc<MemoryRuleStore>),
}

impl RuleSource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Directory(_) => "directory",
            Self::Memory(_) => "memory",
        }
    }
}

impl RuleStore for RuleSource {
    async fn load_active(&self) -> Result<Vec<DetectionRule>, TrafficError> {
        let rules = match self {
            Self::Database(store) => store.load_active().await?,
            Self::Directory(store) => store.load_active().await?,
            Self::Memory(store) => store.load_active().await?,
        };
        info!(source = self.kind(), count = rules.len(), "loaded active rules");
        Ok(rules)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::types::RuleType;
    use promptwatch_core::types::Severity;

    fn rule(id: &str, active: bool) -> DetectionRule {
        DetectionRule {
            id: id.to_owned(),
            name: format!("Rule {id}"),
            description: String::new(),
            rule_type: RuleType::Keyword,
            pattern: "secret".to_owned(),
            points: 10,
            priority: 0,
            stop_on_match: false,
            is_active: active,
            category: "security".to_owned(),
            severity: Severity::Low,
        }
    }

    #[test]
    fn parse_single_rule_and_list() {
        let one = r#"
id: a
name: A
rule_type: keyword
pattern: x
points: 5
"#;
        assert_eq!(FileRuleStore::parse_yaml(one, "one.yml").unwrap().len(), 1);

        let many = r#"
- id: a
  name: A
  rule_type: keyword
  pattern: x
  points: 5
- id: b
  name: B
  rule_type: model_restriction
  pattern: gpt-4
  points: 20
"#;
        let rules = FileRuleStore::parse_yaml(many, "many.yml").unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1].rule_type, RuleType::ModelRestriction);
    }

    #[test]
    fn parse_invalid_yaml_returns_error() {
        let err = FileRuleStore::parse_yaml("not: [valid: {{{", "bad.yml").unwrap_err();
        assert!(matches!(err, TrafficError::RuleLoad { .. }));
    }

    #[tokio::test]
    async fn directory_skips_bad_files_duplicates_and_inactive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.yml"),
            "id: keys\nname: Keys\nrule_type: keyword\npattern: secret\npoints: 50\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.yaml"),
            "- id: keys\n  name: Dup\n  rule_type: keyword\n  pattern: x\n  points: 1\n\
             - id: off\n  name: Off\n  rule_type: keyword\n  pattern: x\n  points: 1\n  is_active: false\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("c.yml"), "{{{ broken").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = FileRuleStore::new(dir.path());
        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "Keys");

        let active = store.load_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "keys");
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let store = FileRuleStore::new("/nonexistent/promptwatch/rules");
        assert!(store.load_active().await.is_err());
    }

    #[tokio::test]
    async fn memory_store_filters_inactive() {
        let store = MemoryRuleStore::with_rules([rule("a", true), rule("b", false)]);
        assert_eq!(store.load_active().await.unwrap().len(), 1);

        assert!(store.set_active("b", true));
        assert_eq!(store.load_active().await.unwrap().len(), 2);

        store.remove("a");
        assert_eq!(store.load_active().await.unwrap().len(), 1);
        assert!(!store.set_active("missing", true));
        assert_eq!(store.load_count(), 3);
    }

    #[tokio::test]
    async fn memory_store_fault_injection() {
        let store = MemoryRuleStore::with_rules([rule("a", true)]);
        store.set_failure(Some("connection refused"));
        let err = store.load_active().await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));

        store.set_failure(None);
        assert!(store.load_active().await.is_ok());
    }

    #[tokio::test]
    async fn rule_source_delegates() {
        let memory = std::sync::Arc::new(MemoryRuleStore::with_rules([rule("a", true)]));
        let source = RuleSource::Memory(std::sync::Arc::clone(&memory));
        assert_eq!(source.kind(), "memory");
        assert_eq!(source.load_active().await.unwrap().len(), 1);
    }
}
