//! Alert dispatcher -- decides, sends and audits alerts off the ingest path.
//!
//! For each scored record the dispatcher:
//!
//! 1. ignores it unless `flagged && score >= threshold`
//! 2. ignores a `request_id` it already handled within the dedup window
//! 3. takes a rate-limit slot (consumed before the send is attempted)
//! 4. sends, or marks the alert `rate_limited` when no slot was free
//! 5. writes exactly one audit row with the final outcome
//!
//! Steps 1-3 run synchronously in [`AlertDispatcher::dispatch_background`],
//! so slots are handed out in consumption order. Steps 4-5 run on a
//! [`TaskTracker`] and never block the worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use promptwatch_core::metrics as m;
use promptwatch_core::types::{AlertOutcome, TrafficRecord};

use super::notifier::{AlertMessage, Notifier, dashboard_link};
use super::rate_limiter::SlidingWindowLimiter;
use super::{AlertAuditSink, AlertRecord};
use crate::config::TrafficPipelineConfig;
use crate::engine::ScoreResult;
use crate::record::prompt_preview;

/// Dedup entries are pruned once the map grows past this.
const DEDUP_CLEANUP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone)]
pub struct AlertDispatcherConfig {
    pub threshold: u8,
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub send_timeout: Duration,
    pub dedup_window: Duration,
    pub dashboard_base_url: String,
    pub prompt_preview_chars: usize,
}

impl Default for AlertDispatcherConfig {
    fn default() -> Self {
        Self::from_pipeline(&TrafficPipelineConfig::default())
    }
}

impl AlertDispatcherConfig {
    pub fn from_pipeline(config: &TrafficPipelineConfig) -> Self {
        Self {
            threshold: config.alert_threshold,
            rate_limit: config.alert_rate_limit,
            rate_window: config.alert_rate_window(),
            send_timeout: config.alert_send_timeout(),
            dedup_window: config.alert_dedup_window(),
            dashboard_base_url: config.dashboard_base_url.clone(),
            prompt_preview_chars: config.prompt_preview_chars,
        }
    }
}

/// Alert counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertStats {
    pub sent: u64,
    pub rate_limited: u64,
    pub failed: u64,
    pub audit_failures: u64,
    /// Qualifying records skipped because their request id was already handled.
    pub deduplicated: u64,
    /// Sends still running.
    pub in_flight: usize,
}

/// Result of the synchronous part of dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Send,
    RateLimited,
}

/// State shared between the dispatcher handle and its send tasks.
struct Inner<N, A> {
    notifier: N,
    /// Receives one row per qualifying record, whatever the outcome.
    audit: A,
    /// Admission for sends; consulted only for records at or above threshold.
    limiter: SlidingWindowLimiter,
    config: AlertDispatcherConfig,
    /// request_id -> when it was handled
    recent: Mutex<HashMap<String, Instant>>,
    /// Time of the most recent failed send, for health reporting.
    last_failure: Mutex<Option<Instant>>,
    sent: AtomicU64,
    rate_limited: AtomicU64,
    failed: AtomicU64,
    /// Audit rows that could not be written.
    audit_failures: AtomicU64,
    deduplicated: AtomicU64,
    /// Send tasks, awaited on shutdown.
    tracker: TaskTracker,
}

/// Shared alert dispatcher. Cloning is cheap; all clones share one limiter.
pub struct AlertDispatcher<N: Notifier, A: AlertAuditSink> {
    inner: Arc<Inner<N, A>>,
}

impl<N: Notifier, A: AlertAuditSink> Clone for AlertDispatcher<N, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<N: Notifier, A: AlertAuditSink> AlertDispatcher<N, A> {
    pub fn new(notifier: N, audit: A, config: AlertDispatcherConfig) -> Self {
        let limiter = SlidingWindowLimiter::new(config.rate_limit, config.rate_window);
        Self {
            inner: Arc::new(Inner {
                notifier,
                audit,
                limiter,
                config,
                recent: Mutex::new(HashMap::new()),
                last_failure: Mutex::new(None),
                sent: AtomicU64::new(0),
                rate_limited: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                audit_failures: AtomicU64::new(0),
                deduplicated: AtomicU64::new(0),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Whether a score is high enough to alert on.
    pub fn qualifies(&self, score: &ScoreResult) -> bool {
        score.flagged && score.score >= self.inner.config.threshold
    }

    /// Handles one scored record inline and returns the alert outcome, or
    /// `None` when the record does not qualify (no audit row is written).
    pub async fn maybe_alert(
        &self,
        record: &TrafficRecord,
        score: &ScoreResult,
    ) -> Option<AlertOutcome> {
        let decision = self.decide(record, score)?;
        Some(self.deliver(decision, record, score).await)
    }

    /// Like [`maybe_alert`](Self::maybe_alert), but the send and the audit
    /// write run in the background. Returns whether an alert was scheduled.
    pub fn dispatch_background(&self, record: &TrafficRecord, score: &ScoreResult) -> bool {
        let Some(decision) = self.decide(record, score) else {
            return false;
        };

        let this = self.clone();
        let record = record.clone();
        let score = score.clone();
        self.inner.tracker.spawn(async move {
            this.deliver(decision, &record, &score).await;
        });
        true
    }

    /// Waits for every in-flight send and audit write.
    pub async fn shutdown(&self) {
        self.inner.tracker.close();
        let in_flight = self.inner.tracker.len();
        if in_flight > 0 {
            info!(in_flight, "waiting for in-flight alerts");
        }
        self.inner.tracker.wait().await;
    }

    pub fn stats(&self) -> AlertStats {
        let inner = &self.inner;
        AlertStats {
            sent: inner.sent.load(Ordering::Relaxed),
            rate_limited: inner.rate_limited.load(Ordering::Relaxed),
            failed: inner.failed.load(Ordering::Relaxed),
            audit_failures: inner.audit_failures.load(Ordering::Relaxed),
            deduplicated: inner.deduplicated.load(Ordering::Relaxed),
            in_flight: inner.tracker.len(),
        }
    }

    /// Whether a send failed within the last `within`.
    pub fn recent_failure(&self, within: Duration) -> bool {
        lock(&self.inner.last_failure).is_some_and(|at| at.elapsed() < within)
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.inner.limiter
    }

    pub fn config(&self) -> &AlertDispatcherConfig {
        &self.inner.config
    }

    fn decide(&self, record: &TrafficRecord, score: &ScoreResult) -> Option<Decision> {
        if !self.qualifies(score) {
            return None;
        }

        let now = Instant::now();
        {
            let mut recent = lock(&self.inner.recent);
            let window = self.inner.config.dedup_window;
            if recent
                .get(&record.request_id)
                .is_some_and(|at| now.saturating_duration_since(*at) < window)
            {
                self.inner.deduplicated.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %record.request_id, "alert already handled, skipping");
                return None;
            }
            if recent.len() >= DEDUP_CLEANUP_THRESHOLD {
                recent.retain(|_, at| now.saturating_duration_since(*at) < window);
            }
            recent.insert(record.request_id.clone(), now);
        }

        if self.inner.limiter.try_acquire() {
            Some(Decision::Send)
        } else {
            Some(Decision::RateLimited)
        }
    }

    async fn deliver(
        &self,
        decision: Decision,
        record: &TrafficRecord,
        score: &ScoreResult,
    ) -> AlertOutcome {
        let inner = &self.inner;
        let preview = prompt_preview(&record.prompt, inner.config.prompt_preview_chars);

        let (outcome, error_message) = match decision {
            Decision::RateLimited => {
                warn!(
                    request_id = %record.request_id,
                    risk_score = score.score,
                    limit = inner.config.rate_limit,
                    "alert rate limit reached, not sending"
                );
                (AlertOutcome::RateLimited, None)
            }
            Decision::Send => {
                let message = AlertMessage {
                    request_id: record.request_id.clone(),
                    risk_score: score.score,
                    src_ip: record.src_ip.clone(),
                    provider: record.provider.clone(),
                    model: record.model.clone(),
                    reasons: score.reasons.clone(),
                    prompt_preview: preview.clone(),
                    timestamp: record.timestamp,
                    dashboard_url: dashboard_link(
                        &inner.config.dashboard_base_url,
                        &record.request_id,
                    ),
                };

                let started = Instant::now();
                let result =
                    tokio::time::timeout(inner.config.send_timeout, inner.notifier.notify(&message))
                        .await;
                metrics::histogram!(m::ALERTS_SEND_DURATION_SECONDS)
                    .record(started.elapsed().as_secs_f64());

                match result {
                    Ok(Ok(())) => {
                        info!(
                            request_id = %record.request_id,
                            risk_score = score.score,
                            channel = inner.notifier.channel(),
                            "alert sent"
                        );
                        (AlertOutcome::Sent, None)
                    }
                    Ok(Err(e)) => {
                        error!(request_id = %record.request_id, error = %e, "alert send failed");
                        (AlertOutcome::Failed, Some(e.to_string()))
                    }
                    Err(_) => {
                        let reason = format!(
                            "send timed out after {}ms",
                            inner.config.send_timeout.as_millis()
                        );
                        error!(request_id = %record.request_id, error = %reason, "alert send failed");
                        (AlertOutcome::Failed, Some(reason))
                    }
                }
            }
        };

        match outcome {
            AlertOutcome::Sent => inner.sent.fetch_add(1, Ordering::Relaxed),
            AlertOutcome::RateLimited => inner.rate_limited.fetch_add(1, Ordering::Relaxed),
            AlertOutcome::Failed => {
                *lock(&inner.last_failure) = Some(Instant::now());
                inner.failed.fetch_add(1, Ordering::Relaxed)
            }
        };
        metrics::counter!(m::ALERTS_TOTAL, m::LABEL_OUTCOME => outcome.as_str()).increment(1);

        let now = Utc::now();
        let audit = AlertRecord {
            id: Uuid::new_v4(),
            request_id: record.request_id.clone(),
            alert_type: inner.notifier.channel().to_owned(),
            recipient: inner.notifier.recipient().to_owned(),
            risk_score: score.score,
            src_ip: record.src_ip.clone(),
            prompt_preview: preview,
            outcome,
            error_message,
            created_at: now,
            sent_at: (outcome == AlertOutcome::Sent).then_some(now),
        };

        match inner.audit.record_alert(&audit).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(request_id = %record.request_id, "alert audit row already present");
            }
            Err(e) => {
                inner.audit_failures.fetch_add(1, Ordering::Relaxed);
                warn!(request_id = %record.request_id, error = %e, "failed to write alert audit row");
            }
        }

        outcome
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
