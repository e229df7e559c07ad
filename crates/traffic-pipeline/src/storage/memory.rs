//! In-process store with fault injection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::alert::{AlertAuditSink, AlertRecord};
use crate::error::TrafficError;

use super::{ScoredRecord, TrafficStore};

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<String, ScoredRecord>,
    /// Insertion order of `records`.
    order: Vec<String>,
    alerts: HashMap<String, AlertRecord>,
    alert_order: Vec<String>,
}

/// Keeps rows in memory with the same idempotency as the Postgres store.
///
/// Writes can be made to fail (`fail_next_inserts`, `set_fail_always`) or
/// stall (`set_delay`).
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_next: AtomicU32,
    fail_always: AtomicBool,
    delay: Mutex<Option<Duration>>,
    insert_attempts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` `insert_batch` calls fail.
    pub fn fail_next_inserts(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Every insert and alert write fails until cleared.
    pub fn set_fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Every insert sleeps this long before doing anything.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    /// `insert_batch` calls so far, failed ones included.
    pub fn insert_attempts(&self) -> u64 {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    pub fn record_count(&self) -> usize {
        self.tables().records.len()
    }

    /// Stored records in insertion order.
    pub fn records(&self) -> Vec<ScoredRecord> {
        let tables = self.tables();
        tables
            .order
            .iter()
            .filter_map(|id| tables.records.get(id).cloned())
            .collect()
    }

    pub fn get(&self, request_id: &str) -> Option<ScoredRecord> {
        self.tables().records.get(request_id).cloned()
    }

    /// Alert rows in insertion order.
    pub fn alerts(&self) -> Vec<AlertRecord> {
        let tables = self.tables();
        tables
            .alert_order
            .iter()
            .filter_map(|id| tables.alerts.get(id).cloned())
            .collect()
    }

    pub fn alert(&self, request_id: &str) -> Option<AlertRecord> {
        self.tables().alerts.get(request_id).cloned()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        lock(&self.tables)
    }
}

impl TrafficStore for MemoryStore {
    async fn insert_batch(&self, records: &[ScoredRecord]) -> Result<u64, TrafficError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_always.load(Ordering::SeqCst) {
            return Err(TrafficError::Storage("store unavailable".to_owned()));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TrafficError::Storage("injected insert failure".to_owned()));
        }

        let mut tables = self.tables();
        let mut inserted = 0;
        for scored in records {
            let id = scored.record.request_id.clone();
            if tables.records.contains_key(&id) {
                continue;
            }
            tables.records.insert(id.clone(), scored.clone());
            tables.order.push(id);
            inserted += 1;
        }
        Ok(inserted)
    }
}

impl AlertAuditSink for MemoryStore {
    async fn record_alert(&self, alert: &AlertRecord) -> Result<bool, TrafficError> {
        if self.fail_always.load(Ordering::SeqCst) {
            return Err(TrafficError::Storage("store unavailable".to_owned()));
        }

        let mut tables = self.tables();
        if tables.alerts.contains_key(&alert.request_id) {
            return Ok(false);
        }
        tables
            .alerts
            .insert(alert.request_id.clone(), alert.clone());
        tables.alert_order.push(alert.request_id.clone());
        Ok(true)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScoreResult;
    use chrono::Utc;
    use promptwatch_core::types::{AlertOutcome, TrafficRecord};
    use uuid::Uuid;

    fn scored(id: &str) -> ScoredRecord {
        ScoredRecord::new(
            TrafficRecord {
                request_id: id.to_owned(),
                timestamp: Utc::now(),
                src_ip: "10.0.0.1".to_owned(),
                provider: "openai".to_owned(),
                model: "gpt-4".to_owned(),
                prompt: "hi".to_owned(),
                response: None,
                metadata: serde_json::Map::new(),
                headers: serde_json::Map::new(),
                endpoint: None,
                method: "POST".to_owned(),
                duration_ms: None,
                status_code: None,
            },
            ScoreResult::default(),
        )
    }

    fn alert(id: &str, outcome: AlertOutcome) -> AlertRecord {
        AlertRecord {
            id: Uuid::new_v4(),
            request_id: id.to_owned(),
            alert_type: "slack".to_owned(),
            recipient: "slack_webhook".to_owned(),
            risk_score: 70,
            src_ip: "10.0.0.1".to_owned(),
            prompt_preview: "hi".to_owned(),
            outcome,
            error_message: None,
            created_at: Utc::now(),
            sent_at: None,
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_on_request_id() {
        let store = MemoryStore::new();
        assert_eq!(store.insert_batch(&[scored("a"), scored("b")]).await.unwrap(), 2);
        assert_eq!(store.insert_batch(&[scored("b"), scored("c")]).await.unwrap(), 1);
        assert_eq!(store.record_count(), 3);

        let ids: Vec<_> = store
            .records()
            .iter()
            .map(|r| r.request_id().to_owned())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn fail_next_inserts_then_recovers() {
        let store = MemoryStore::new();
        store.fail_next_inserts(2);
        assert!(store.insert_batch(&[scored("a")]).await.is_err());
        assert!(store.insert_batch(&[scored("a")]).await.is_err());
        assert_eq!(store.insert_batch(&[scored("a")]).await.unwrap(), 1);
        assert_eq!(store.insert_attempts(), 3);
    }

    #[tokio::test]
    async fn alerts_are_idempotent() {
        let store = MemoryStore::new();
        assert!(store.record_alert(&alert("a", AlertOutcome::Sent)).await.unwrap());
        assert!(!store.record_alert(&alert("a", AlertOutcome::Failed)).await.unwrap());
        assert_eq!(store.alerts().len(), 1);
        assert_eq!(store.alert("a").unwrap().outcome, AlertOutcome::Sent);
    }

    #[tokio::test]
    async fn fail_always_blocks_both_tables() {
        let store = MemoryStore::new();
        store.set_fail_always(true);
        assert!(store.insert_batch(&[scored("a")]).await.is_err());
        assert!(store.record_alert(&alert("a", AlertOutcome::Sent)).await.is_err());
        store.set_fail_always(false);
        assert!(store.insert_batch(&[scored("a")]).await.is_ok());
    }
}
