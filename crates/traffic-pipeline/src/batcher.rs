//! Persistence batching -- buffers scored records and writes them in bulk.
//!
//! [`PersistenceBatcher`] is owned by a single worker. It collects scored
//! records together with the stream positions they came from, and flushes
//! when either trigger fires:
//!
//! - size: `batch_size` records buffered (default 500)
//! - time: `flush_interval` since the first buffered entry (default 1 s)
//!
//! A successful flush hands back every buffered position for commit. A
//! failed flush hands back nothing; the caller calls [`discard`] and rewinds
//! the stream so the same records are delivered again.
//!
//! [`discard`]: PersistenceBatcher::discard

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use promptwatch_core::metrics as m;

use crate::config::TrafficPipelineConfig;
use crate::error::TrafficError;
use crate::storage::{ScoredRecord, TrafficStore};
use crate::stream::StreamPosition;

/// Largest backoff shift; keeps `base * 2^n` from overflowing.
const MAX_BACKOFF_SHIFT: u32 = 20;

/// Result of a successful flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Positions now safe to commit.
    pub positions: Vec<StreamPosition>,
    /// Records written after dedup.
    pub records: usize,
    /// Rows the store actually inserted (redelivered rows are not counted).
    pub inserted: u64,
}

pub struct PersistenceBatcher<S: TrafficStore> {
    store: Arc<S>,
    batch_size: usize,
    flush_interval: Duration,
    write_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    max_retry_backoff: Duration,
    buffer: Vec<ScoredRecord>,
    positions: Vec<StreamPosition>,
    first_buffered_at: Option<Instant>,
}

impl<S: TrafficStore> PersistenceBatcher<S> {
    pub fn new(store: Arc<S>, config: &TrafficPipelineConfig) -> Self {
        Self {
            store,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            write_timeout: config.write_timeout(),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
            max_retry_backoff: config.max_retry_backoff(),
            buffer: Vec::with_capacity(config.batch_size.min(10_000)),
            positions: Vec::new(),
            first_buffered_at: None,
        }
    }

    /// Buffers a scored record. Returns true when the size trigger fired.
    pub fn push(&mut self, scored: ScoredRecord, position: StreamPosition) -> bool {
        self.mark_first();
        self.buffer.push(scored);
        self.positions.push(position);
        metrics::gauge!(m::STORAGE_BUFFER_SIZE).increment(1.0);
        self.is_full()
    }

    /// Buffers a position with no record (a skipped malformed message), so
    /// it is committed with the next successful flush.
    pub fn push_position(&mut self, position: StreamPosition) {
        self.mark_first();
        self.positions.push(position);
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.batch_size
    }

    /// Whether the time trigger fired.
    pub fn is_due(&self) -> bool {
        self.first_buffered_at
            .is_some_and(|at| at.elapsed() >= self.flush_interval)
    }

    /// Time left before the time trigger fires; `None` when nothing is buffered.
    pub fn time_until_due(&self) -> Option<Duration> {
        self.first_buffered_at
            .map(|at| self.flush_interval.saturating_sub(at.elapsed()))
    }

    pub fn has_pending(&self) -> bool {
        !self.positions.is_empty()
    }

    /// Buffered records.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Buffered positions, records and skipped messages together.
    pub fn pending_positions(&self) -> &[StreamPosition] {
        &self.positions
    }

    /// Writes the buffer with bounded retries.
    ///
    /// The buffer is deduplicated by `request_id` first (first occurrence
    /// wins). Each attempt is bounded by `write_timeout`; attempt `n` is
    /// preceded by a `retry_backoff * 2^(n-1)` sleep, capped at
    /// `max_retry_backoff`. On exhaustion the buffer is left in place and
    /// [`TrafficError::PersistenceExhausted`] is returned.
    pub async fn flush(&mut self) -> Result<FlushOutcome, TrafficError> {
        if !self.has_pending() {
            return Ok(FlushOutcome::default());
        }

        let before = self.buffer.len();
        let mut seen = HashSet::with_capacity(before);
        self.buffer
            .retain(|scored| seen.insert(scored.record.request_id.clone()));
        let duplicates = before - self.buffer.len();
        if duplicates > 0 {
            metrics::gauge!(m::STORAGE_BUFFER_SIZE).decrement(duplicates as f64);
            debug!(duplicates, "dropped duplicate request ids from batch");
        }

        if self.buffer.is_empty() {
            return Ok(self.take(0));
        }

        let started = Instant::now();
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.backoff_for(attempt);
                metrics::counter!(m::STORAGE_FLUSH_RETRIES_TOTAL).increment(1);
                warn!(
                    attempt,
                    max_retries = self.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %last_error,
                    "retrying batch write"
                );
                tokio::time::sleep(backoff).await;
            }

            match tokio::time::timeout(self.write_timeout, self.store.insert_batch(&self.buffer))
                .await
            {
                Ok(Ok(inserted)) => {
                    metrics::histogram!(m::STORAGE_FLUSH_DURATION_SECONDS)
                        .record(started.elapsed().as_secs_f64());
                    metrics::counter!(m::STORAGE_RECORDS_PERSISTED_TOTAL).increment(inserted);
                    debug!(
                        records = self.buffer.len(),
                        inserted,
                        attempts = attempt + 1,
                        "batch persisted"
                    );
                    return Ok(self.take(inserted));
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "write timed out after {}ms",
                        self.write_timeout.as_millis()
                    );
                }
            }
        }

        metrics::counter!(m::STORAGE_FLUSH_FAILURES_TOTAL).increment(1);
        let attempts = self.max_retries + 1;
        error!(
            attempts,
            records = self.buffer.len(),
            error = %last_error,
            "batch write failed, offsets will not be committed"
        );
        Err(TrafficError::PersistenceExhausted {
            attempts,
            records: self.buffer.len(),
            reason: last_error,
        })
    }

    /// Drops everything buffered and returns the positions, for rewinding.
    pub fn discard(&mut self) -> Vec<StreamPosition> {
        metrics::gauge!(m::STORAGE_BUFFER_SIZE).decrement(self.buffer.len() as f64);
        self.buffer.clear();
        self.first_buffered_at = None;
        std::mem::take(&mut self.positions)
    }

    /// Sleep before retry `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.retry_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_retry_backoff)
    }

    fn take(&mut self, inserted: u64) -> FlushOutcome {
        let records = self.buffer.len();
        metrics::gauge!(m::STORAGE_BUFFER_SIZE).decrement(records as f64);
        self.buffer.clear();
        self.first_buffered_at = None;
        FlushOutcome {
            positions: std::mem::take(&mut self.positions),
            records,
            inserted,
        }
    }

    fn mark_first(&mut self) {
        if self.first_buffered_at.is_none() {
            self.first_buffered_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrafficPipelineConfigBuilder;
    use crate::engine::ScoreResult;
    use crate::storage::MemoryStore;
    use chrono::Utc;
    use promptwatch_core::types::TrafficRecord;

    fn scored(id: &str) -> ScoredRecord {
        ScoredRecord::new(
            TrafficRecord {
                request_id: id.to_owned(),
                timestamp: Utc::now(),
                src_ip: "10.0.0.1".to_owned(),
                provider: "openai".to_owned(),
                model: "gpt-4".to_owned(),
                prompt: "hello".to_owned(),
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

    fn batcher(batch_size: usize, max_retries: u32) -> (PersistenceBatcher<MemoryStore>, Arc<MemoryStore>) {
        let config = TrafficPipelineConfigBuilder::new()
            .batch_size(batch_size)
            .flush_interval_ms(1000)
            .max_retries(max_retries)
            .retry_backoff_ms(100)
            .build()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        (PersistenceBatcher::new(Arc::clone(&store), &config), store)
    }

    #[tokio::test]
    async fn size_trigger_fires_at_batch_size() {
        let (mut batcher, _store) = batcher(3, 0);
        assert!(!batcher.push(scored("a"), StreamPosition::new(0, 0)));
        assert!(!batcher.push(scored("b"), StreamPosition::new(0, 1)));
        assert!(batcher.push(scored("c"), StreamPosition::new(0, 2)));
    }

    #[tokio::test(start_paused = true)]
    async fn time_trigger_fires_after_interval() {
        let (mut batcher, _store) = batcher(500, 0);
        assert!(!batcher.is_due());
        assert!(batcher.time_until_due().is_none());

        batcher.push(scored("a"), StreamPosition::new(0, 0));
        assert!(!batcher.is_due());
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(batcher.time_until_due(), Some(Duration::from_millis(600)));
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(batcher.is_due());
    }

    #[tokio::test]
    async fn flush_returns_positions_and_clears() {
        let (mut batcher, store) = batcher(10, 0);
        batcher.push(scored("a"), StreamPosition::new(0, 0));
        batcher.push_position(StreamPosition::new(0, 1));
        batcher.push(scored("b"), StreamPosition::new(0, 2));

        let outcome = batcher.flush().await.unwrap();
        assert_eq!(outcome.records, 2);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.positions.len(), 3);
        assert!(!batcher.has_pending());
        assert_eq!(store.record_count(), 2);
    }

    #[tokio::test]
    async fn flush_dedupes_by_request_id() {
        let (mut batcher, store) = batcher(10, 0);
        batcher.push(scored("a"), StreamPosition::new(0, 0));
        batcher.push(scored("a"), StreamPosition::new(0, 1));
        let outcome = batcher.flush().await.unwrap();
        assert_eq!(outcome.records, 1);
        assert_eq!(outcome.positions.len(), 2);
        assert_eq!(store.insert_attempts(), 1);
    }

    #[test]
    fn buffer_gauge_returns_to_zero_after_deduped_flush() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let (mut batcher, _store) = batcher(10, 0);
                batcher.push(scored("a"), StreamPosition::new(0, 0));
                batcher.push(scored("a"), StreamPosition::new(0, 1));
                batcher.push(scored("b"), StreamPosition::new(0, 2));
                let outcome = batcher.flush().await.unwrap();
                assert_eq!(outcome.records, 2);
            });
        });

        let rendered = handle.render();
        let line = rendered
            .lines()
            .find(|l| l.starts_with(m::STORAGE_BUFFER_SIZE))
            .expect("buffer gauge rendered");
        let value: f64 = line.rsplit(' ').next().unwrap().parse().unwrap();
        assert_eq!(value, 0.0);
    }

    #[tokio::test]
    async fn only_skipped_positions_skip_the_store() {
        let (mut batcher, store) = batcher(10, 0);
        batcher.push_position(StreamPosition::new(0, 0));
        let outcome = batcher.flush().await.unwrap();
        assert_eq!(outcome.positions.len(), 1);
        assert_eq!(store.insert_attempts(), 0);
    }

    #[tokio::test]
    async fn empty_flush_is_a_no_op() {
        let (mut batcher, store) = batcher(10, 0);
        assert_eq!(batcher.flush().await.unwrap(), FlushOutcome::default());
        assert_eq!(store.insert_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let (mut batcher, store) = batcher(10, 3);
        store.fail_next_inserts(2);
        batcher.push(scored("a"), StreamPosition::new(0, 0));

        let started = Instant::now();
        let outcome = batcher.flush().await.unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(store.insert_attempts(), 3);
        // 100ms + 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_keep_the_buffer() {
        let (mut batcher, store) = batcher(10, 2);
        store.set_fail_always(true);
        batcher.push(scored("a"), StreamPosition::new(0, 0));
        batcher.push(scored("b"), StreamPosition::new(0, 1));

        let err = batcher.flush().await.unwrap_err();
        assert!(matches!(
            err,
            TrafficError::PersistenceExhausted {
                attempts: 3,
                records: 2,
                ..
            }
        ));
        assert_eq!(store.insert_attempts(), 3);
        assert_eq!(batcher.len(), 2);

        let positions = batcher.discard();
        assert_eq!(positions.len(), 2);
        assert!(!batcher.has_pending());
        assert!(batcher.time_until_due().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_counts_as_failed_attempt() {
        let (mut batcher, store) = batcher(10, 0);
        store.set_delay(Some(Duration::from_secs(30)));
        batcher.push(scored("a"), StreamPosition::new(0, 0));
        let err = batcher.flush().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = TrafficPipelineConfig {
            retry_backoff_ms: 100,
            max_retry_backoff_ms: 1000,
            ..Default::default()
        };
        let batcher = PersistenceBatcher::new(Arc::new(MemoryStore::new()), &config);
        assert_eq!(batcher.backoff_for(1), Duration::from_millis(100));
        assert_eq!(batcher.backoff_for(2), Duration::from_millis(200));
        assert_eq!(batcher.backoff_for(4), Duration::from_millis(800));
        assert_eq!(batcher.backoff_for(5), Duration::from_millis(1000));
        assert_eq!(batcher.backoff_for(60), Duration::from_millis(1000));
    }
}
