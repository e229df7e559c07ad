//! Durable storage for scored traffic and alert audit rows.
//!
//! - [`PgStore`](postgres::PgStore): `llm_requests` / `alerts` in Postgres
//! - [`MemoryStore`](memory::MemoryStore): in-process, with fault injection
//!
//! Both are idempotent on `request_id`: writing a record or an alert twice
//! leaves one row. [`cipher`] seals the sensitive Postgres columns.

pub mod cipher;
pub mod memory;
pub mod postgres;

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;

use promptwatch_core::types::TrafficRecord;

use crate::alert::{AlertAuditSink, AlertRecord};
use crate::engine::ScoreResult;
use crate::error::TrafficError;

pub use cipher::{FieldCipher, StoredFields};
pub use memory::MemoryStore;
pub use postgres::{PgRuleStore, PgStore};

/// A traffic record with its scoring outcome, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRecord {
    pub record: TrafficRecord,
    pub score: ScoreResult,
}

impl ScoredRecord {
    pub fn new(record: TrafficRecord, score: ScoreResult) -> Self {
        Self { record, score }
    }

    pub fn request_id(&self) -> &str {
        &self.record.request_id
    }
}

/// Bulk writer for scored records.
pub trait TrafficStore: Send + Sync + 'static {
    /// Inserts the batch in one round trip where possible. Rows whose
    /// `request_id` already exists are skipped. Returns rows actually inserted.
    fn insert_batch(
        &self,
        records: &[ScoredRecord],
    ) -> impl Future<Output = Result<u64, TrafficError>> + Send;
}

impl<S: TrafficStore> TrafficStore for Arc<S> {
    fn insert_batch(
        &self,
        records: &[ScoredRecord],
    ) -> impl Future<Output = Result<u64, TrafficError>> + Send {
        (**self).insert_batch(records)
    }
}

/// Store chosen from `storage.backend`.
#[derive(Clone)]
pub enum StorageBackend {
    Postgres(PgStore),
    Memory(Arc<MemoryStore>),
}

impl StorageBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    pub async fn record_count(&self) -> Result<u64, TrafficError> {
        match self {
            Self::Postgres(store) => store.record_count().await,
            Self::Memory(store) => Ok(store.record_count() as u64),
        }
    }

    pub async fn ping(&self) -> Result<(), TrafficError> {
        match self {
            Self::Postgres(store) => store.ping().await,
            Self::Memory(_) => Ok(()),
        }
    }

    /// Closes the connection pool; no-op for the memory store.
    pub async fn close(&self) {
        if let Self::Postgres(store) = self {
            store.close().await;
        }
    }
}

impl TrafficStore for StorageBackend {
    async fn insert_batch(&self, records: &[ScoredRecord]) -> Result<u64, TrafficError> {
        match self {
            Self::Postgres(store) => store.insert_batch(records).await,
            Self::Memory(store) => store.insert_batch(records).await,
        }
    }
}

impl AlertAuditSink for StorageBackend {
    async fn record_alert(&self, alert: &AlertRecord) -> Result<bool, TrafficError> {
        match self {
            Self::Postgres(store) => store.record_alert(alert).await,
            Self::Memory(store) => store.record_alert(alert).await,
        }
    }
}
