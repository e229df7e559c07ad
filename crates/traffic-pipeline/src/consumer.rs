//! Stream consumer -- the worker loop and the pipeline lifecycle.
//!
//! [`TrafficPipeline`] implements core's [`Pipeline`] trait so the daemon
//! drives it like any other component.
//!
//! # Worker loop
//! ```text
//! poll (<= micro_batch_size, <= poll_timeout)
//!   -> parse (malformed: log + skip, position still committed)
//!   -> score against RuleCache::current()
//!   -> AlertDispatcher::dispatch_background (qualifying records)
//!   -> PersistenceBatcher::push
//!   -> flush on size/time trigger -> commit returned positions
//! ```
//!
//! A failed flush commits nothing: the buffer is discarded and the source
//! rewound to the first uncommitted position, so the records are delivered
//! again. Every worker owns its source and its batcher; workers share the
//! rule cache, the dispatcher and the statistics.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use promptwatch_core::error::{PipelineError, PromptwatchError};
use promptwatch_core::metrics as m;
use promptwatch_core::pipeline::{HealthStatus, Pipeline};

use crate::alert::{AlertAuditSink, AlertDispatcher, AlertDispatcherConfig, AlertStats, Notifier};
use crate::batcher::PersistenceBatcher;
use crate::config::TrafficPipelineConfig;
use crate::engine::{self, DetectionStats};
use crate::error::TrafficError;
use crate::record::{parse_record, payload_preview};
use crate::rule::{RuleCache, RuleStore};
use crate::storage::{ScoredRecord, TrafficStore};
use crate::stream::{StreamMessage, StreamPosition, StreamSource};

/// Characters of a malformed payload included in the dead-letter log line.
const DEAD_LETTER_PREVIEW_CHARS: usize = 200;

/// Pause after a failed poll before polling again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Shortest poll wait, so a due batch never turns the loop into a spin.
const MIN_POLL_WAIT: Duration = Duration::from_millis(1);

/// Alert failures younger than this degrade health.
const ALERT_FAILURE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
enum PipelineState {
    Initialized,
    Running,
    Stopped,
}

/// Counters shared by every worker; read by [`TrafficPipeline::stats`].
#[derive(Debug, Default)]
struct PipelineCounters {
    /// Messages polled, malformed ones included.
    consumed: AtomicU64,
    /// Payloads that failed to parse and were skipped.
    malformed: AtomicU64,
    /// Rows actually inserted; redelivered duplicates do not count.
    persisted: AtomicU64,
    /// Flushes that exhausted their retries.
    persistence_failures: AtomicU64,
    /// Successful offset commits.
    commits: AtomicU64,
    commit_failures: AtomicU64,
    /// Set when the latest flush on any worker failed; cleared by the next
    /// success. Drives the degraded health state.
    last_flush_failed: AtomicBool,
}

/// Point-in-time pipeline statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    /// Messages pulled from the stream, malformed ones included.
    pub consumed: u64,
    /// Records scored.
    pub processed: u64,
    pub malformed: u64,
    pub flagged: u64,
    pub flag_rate: f64,
    /// Rows inserted by successful flushes.
    pub persisted: u64,
    pub persistence_failures: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub rule_hits: BTreeMap<String, u64>,
    pub active_rules: usize,
    pub snapshot_version: u64,
    /// `None` when alerting is disabled.
    pub alerts: Option<AlertStats>,
}

/// LLM traffic pipeline: N stream workers plus the rule refresher.
///
/// # Example
/// ```ignore
/// use promptwatch_pipeline::{TrafficPipeline, TrafficPipelineBuilder};
///
/// let mut pipeline = TrafficPipelineBuilder::new()
///     .config(config)
///     .source(topic.consumer_all("shadow-ai-detection"))
///     .store(Arc::new(MemoryStore::new()))
///     .rule_store(Arc::new(rules))
///     .notifier(notifier)
///     .build()?;
///
/// pipeline.start().await?;
/// ```
pub struct TrafficPipeline<Src, S, R, N>
where
    Src: StreamSource,
    S: TrafficStore + AlertAuditSink,
    R: RuleStore,
    N: Notifier,
{
    config: TrafficPipelineConfig,
    state: PipelineState,
    /// Consumed by `start()`; a stopped pipeline cannot be restarted.
    sources: Vec<Src>,
    store: Arc<S>,
    cache: Arc<RuleCache<R>>,
    dispatcher: Option<AlertDispatcher<N, Arc<S>>>,
    detection: Arc<DetectionStats>,
    counters: Arc<PipelineCounters>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    worker_count: usize,
}

impl<Src, S, R, N> TrafficPipeline<Src, S, R, N>
where
    Src: StreamSource,
    S: TrafficStore + AlertAuditSink,
    R: RuleStore,
    N: Notifier,
{
    pub fn state_name(&self) -> &str {
        match self.state {
            PipelineState::Initialized => "initialized",
            PipelineState::Running => "running",
            PipelineState::Stopped => "stopped",
        }
    }

    pub fn config(&self) -> &TrafficPipelineConfig {
        &self.config
    }

    pub fn rule_cache(&self) -> &Arc<RuleCache<R>> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn dispatcher(&self) -> Option<&AlertDispatcher<N, Arc<S>>> {
        self.dispatcher.as_ref()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn stats(&self) -> PipelineStats {
        let detection = self.detection.snapshot();
        let c = &self.counters;
        let snapshot = self.cache.current();
        PipelineStats {
            consumed: c.consumed.load(Ordering::Relaxed),
            processed: detection.processed,
            malformed: c.malformed.load(Ordering::Relaxed),
            flagged: detection.flagged,
            flag_rate: detection.flag_rate,
            persisted: c.persisted.load(Ordering::Relaxed),
            persistence_failures: c.persistence_failures.load(Ordering::Relaxed),
            commits: c.commits.load(Ordering::Relaxed),
            commit_failures: c.commit_failures.load(Ordering::Relaxed),
            rule_hits: detection.rule_hits,
            active_rules: snapshot.len(),
            snapshot_version: snapshot.version,
            alerts: self.dispatcher.as_ref().map(AlertDispatcher::stats),
        }
    }
}

impl<Src, S, R, N> Pipeline for TrafficPipeline<Src, S, R, N>
where
    Src: StreamSource,
    S: TrafficStore + AlertAuditSink,
    R: RuleStore,
    N: Notifier,
{
    async fn start(&mut self) -> Result<(), PromptwatchError> {
        if self.state == PipelineState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }
        if self.sources.is_empty() {
            return Err(PipelineError::InitFailed(
                "stream sources already consumed; build a new pipeline to restart".to_owned(),
            )
            .into());
        }

        info!(workers = self.sources.len(), "starting traffic pipeline");

        if !self.cache.has_loaded() {
            match self.cache.force_refresh().await {
                Ok(snapshot) => {
                    info!(rules = snapshot.len(), "initial rule snapshot loaded");
                }
                Err(e) => {
                    warn!(error = %e, "initial rule load failed, scoring with an empty rule set until refresh succeeds");
                }
            }
        }

        self.cancel = CancellationToken::new();
        self.tasks
            .push(self.cache.spawn_refresher(self.config.refresh_interval(), self.cancel.clone()));

        for (id, source) in self.sources.drain(..).enumerate() {
            let worker = Worker {
                id,
                source,
                batcher: PersistenceBatcher::new(Arc::clone(&self.store), &self.config),
                cache: Arc::clone(&self.cache),
                dispatcher: self.dispatcher.clone(),
                detection: Arc::clone(&self.detection),
                counters: Arc::clone(&self.counters),
                micro_batch_size: self.config.micro_batch_size,
                poll_timeout: self.config.poll_timeout(),
                cancel: self.cancel.clone(),
            };
            self.tasks.push(tokio::spawn(worker.run()));
        }

        self.state = PipelineState::Running;
        info!("traffic pipeline started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), PromptwatchError> {
        if self.state != PipelineState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        info!("stopping traffic pipeline");

        // workers flush and commit what they hold before exiting
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "pipeline task ended abnormally");
            }
        }

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.shutdown().await;
        }

        self.state = PipelineState::Stopped;
        info!("traffic pipeline stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            PipelineState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            PipelineState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
            PipelineState::Running => {
                if !self.cache.has_loaded() {
                    return HealthStatus::Unhealthy("rule cache never loaded".to_owned());
                }

                let mut problems = Vec::new();
                if self.counters.last_flush_failed.load(Ordering::Relaxed) {
                    problems.push("last flush failed".to_owned());
                }
                if self
                    .dispatcher
                    .as_ref()
                    .is_some_and(|d| d.recent_failure(ALERT_FAILURE_WINDOW))
                {
                    problems.push("alert delivery failed in the last minute".to_owned());
                }
                if self.cache.is_stale() {
                    problems.push(format!(
                        "rule snapshot v{} is stale",
                        self.cache.version()
                    ));
                }

                if problems.is_empty() {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded(problems.join("; "))
                }
            }
        }
    }
}

/// One stream source with its own batcher.
struct Worker<Src, S, R, N>
where
    Src: StreamSource,
    S: TrafficStore + AlertAuditSink,
    R: RuleStore,
    N: Notifier,
{
    id: usize,
    source: Src,
    batcher: PersistenceBatcher<S>,
    cache: Arc<RuleCache<R>>,
    dispatcher: Option<AlertDispatcher<N, Arc<S>>>,
    detection: Arc<DetectionStats>,
    counters: Arc<PipelineCounters>,
    micro_batch_size: usize,
    poll_timeout: Duration,
    cancel: CancellationToken,
}

impl<Src, S, R, N> Worker<Src, S, R, N>
where
    Src: StreamSource,
    S: TrafficStore + AlertAuditSink,
    R: RuleStore,
    N: Notifier,
{
    async fn run(mut self) {
        info!(worker = self.id, source = %self.source.describe(), "worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if self.batcher.is_full() || self.batcher.is_due() {
                self.flush_and_commit(&[]).await;
            }

            let wait = self
                .batcher
                .time_until_due()
                .map_or(self.poll_timeout, |due| due.min(self.poll_timeout))
                .max(MIN_POLL_WAIT);

            let polled = tokio::select! {
                _ = self.cancel.cancelled() => break,
                polled = self.source.poll_batch(self.micro_batch_size, wait) => polled,
            };

            match polled {
                Ok(messages) => self.process(messages).await,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "stream poll failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        if self.batcher.has_pending() {
            info!(
                worker = self.id,
                records = self.batcher.len(),
                "draining buffered records before shutdown"
            );
            self.flush_and_commit(&[]).await;
        }
        info!(worker = self.id, "worker stopped");
    }

    async fn process(&mut self, messages: Vec<StreamMessage>) {
        if messages.is_empty() {
            return;
        }

        let count = messages.len() as u64;
        self.counters.consumed.fetch_add(count, Ordering::Relaxed);
        metrics::counter!(m::STREAM_RECORDS_CONSUMED_TOTAL).increment(count);

        // one snapshot per micro-batch
        let snapshot = self.cache.current();
        let started = Instant::now();

        let mut pending = messages.into_iter();
        while let Some(message) = pending.next() {
            let record = match parse_record(&message.payload) {
                Ok(record) => record,
                Err(e) => {
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(m::STREAM_RECORDS_MALFORMED_TOTAL).increment(1);
                    warn!(
                        worker = self.id,
                        position = %message.position,
                        error = %e,
                        payload = %payload_preview(&message.payload, DEAD_LETTER_PREVIEW_CHARS),
                        "dead-lettering malformed record"
                    );
                    self.batcher.push_position(message.position);
                    continue;
                }
            };

            let result = engine::score(&record, &snapshot);
            self.detection.record(&result);
            metrics::counter!(m::DETECTION_RECORDS_SCORED_TOTAL).increment(1);
            if result.flagged {
                metrics::counter!(m::DETECTION_RECORDS_FLAGGED_TOTAL).increment(1);
                debug!(
                    worker = self.id,
                    request_id = %record.request_id,
                    score = result.score,
                    reasons = ?result.reasons,
                    "record flagged"
                );
            }
            for name in &result.reasons {
                metrics::counter!(m::DETECTION_RULE_MATCHES_TOTAL, m::LABEL_RULE => name.clone())
                    .increment(1);
            }

            if let Some(dispatcher) = &self.dispatcher {
                dispatcher.dispatch_background(&record, &result);
            }

            if self
                .batcher
                .push(ScoredRecord::new(record, result), message.position)
            {
                let unprocessed: Vec<StreamPosition> =
                    pending.as_slice().iter().map(|m| m.position).collect();
                if !self.flush_and_commit(&unprocessed).await {
                    // the rest of the micro-batch was rewound with the buffer
                    break;
                }
            }
        }

        metrics::histogram!(m::DETECTION_BATCH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
    }

    /// Flushes the batcher and commits on success.
    ///
    /// On failure the buffer is discarded and the source rewound to the
    /// lowest of the buffered positions and `unprocessed`. Returns whether
    /// the flush succeeded.
    async fn flush_and_commit(&mut self, unprocessed: &[StreamPosition]) -> bool {
        match self.batcher.flush().await {
            Ok(outcome) => {
                self.counters
                    .persisted
                    .fetch_add(outcome.inserted, Ordering::Relaxed);
                self.counters.last_flush_failed.store(false, Ordering::Relaxed);

                if outcome.positions.is_empty() {
                    return true;
                }
                match self.source.commit(&outcome.positions).await {
                    Ok(()) => {
                        self.counters.commits.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!(m::STREAM_COMMITS_TOTAL, m::LABEL_RESULT => "success")
                            .increment(1);
                        debug!(
                            worker = self.id,
                            records = outcome.records,
                            positions = outcome.positions.len(),
                            "batch committed"
                        );
                    }
                    Err(e) => {
                        self.counters.commit_failures.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!(m::STREAM_COMMITS_TOTAL, m::LABEL_RESULT => "failure")
                            .increment(1);
                        warn!(
                            worker = self.id,
                            error = %e,
                            "offset commit failed, batch may be redelivered"
                        );
                    }
                }
                true
            }
            Err(e) => {
                self.counters
                    .persistence_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.counters.last_flush_failed.store(true, Ordering::Relaxed);

                let mut positions = self.batcher.discard();
                positions.extend_from_slice(unprocessed);
                error!(
                    worker = self.id,
                    error = %e,
                    positions = positions.len(),
                    "persistence failed, rewinding stream for redelivery"
                );
                if let Err(e) = self.source.rewind(&positions).await {
                    error!(worker = self.id, error = %e, "stream rewind failed");
                }
                false
            }
        }
    }
}

/// Builder for [`TrafficPipeline`].
pub struct TrafficPipelineBuilder<Src, S, R, N>
where
    Src: StreamSource,
    S: TrafficStore + AlertAuditSink,
    R: RuleStore,
    N: Notifier,
{
    config: TrafficPipelineConfig,
    sources: Vec<Src>,
    store: Option<Arc<S>>,
    rule_store: Option<Arc<R>>,
    notifier: Option<N>,
}

impl<Src, S, R, N> TrafficPipelineBuilder<Src, S, R, N>
where
    Src: StreamSource,
    S: TrafficStore + AlertAuditSink,
    R: RuleStore,
    N: Notifier,
{
    pub fn new() -> Self {
        Self {
            config: TrafficPipelineConfig::default(),
            sources: Vec::new(),
            store: None,
            rule_store: None,
            notifier: None,
        }
    }

    pub fn config(mut self, config: TrafficPipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a stream source; each source gets its own worker.
    pub fn source(mut self, source: Src) -> Self {
        self.sources.push(source);
        self
    }

    pub fn sources(mut self, sources: impl IntoIterator<Item = Src>) -> Self {
        self.sources.extend(sources);
        self
    }

    /// Traffic store, also used for alert audit rows.
    pub fn store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn rule_store(mut self, rule_store: Arc<R>) -> Self {
        self.rule_store = Some(rule_store);
        self
    }

    /// Enables alerting through `notifier`. Without one no alerts are sent
    /// and no audit rows are written.
    pub fn notifier(mut self, notifier: N) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> Result<TrafficPipeline<Src, S, R, N>, TrafficError> {
        self.config.validate()?;

        if self.sources.is_empty() {
            return Err(TrafficError::Config {
                field: "sources".to_owned(),
                reason: "at least one stream source must be provided".to_owned(),
            });
        }
        let store = self.store.ok_or_else(|| TrafficError::Config {
            field: "store".to_owned(),
            reason: "traffic store must be provided".to_owned(),
        })?;
        let rule_store = self.rule_store.ok_or_else(|| TrafficError::Config {
            field: "rule_store".to_owned(),
            reason: "rule store must be provided".to_owned(),
        })?;

        let cache = Arc::new(RuleCache::new(
            rule_store,
            self.config.refresh_interval(),
            self.config.refresh_timeout(),
        ));
        let dispatcher = self.notifier.map(|notifier| {
            AlertDispatcher::new(
                notifier,
                Arc::clone(&store),
                AlertDispatcherConfig::from_pipeline(&self.config),
            )
        });
        if dispatcher.is_none() {
            info!("no notifier configured, alerting disabled");
        }

        let worker_count = self.sources.len();
        Ok(TrafficPipeline {
            config: self.config,
            state: PipelineState::Initialized,
            sources: self.sources,
            store,
            cache,
            dispatcher,
            detection: Arc::new(DetectionStats::new()),
            counters: Arc::new(PipelineCounters::default()),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            worker_count,
        })
    }
}

impl<Src, S, R, N> Default for TrafficPipelineBuilder<Src, S, R, N>
where
    Src: StreamSource,
    S: TrafficStore + AlertAuditSink,
    R: RuleStore,
    N: Notifier,
{
    fn default() -> Self {
        Self::new()
    }
}
