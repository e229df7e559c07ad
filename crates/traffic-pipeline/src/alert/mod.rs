//! Rate-limited alerting for high-risk records.
//!
//! ```text
//! consumer -> AlertDispatcher::dispatch_background
//!     -> threshold -> dedup -> SlidingWindowLimiter -> Notifier
//!     -> AlertAuditSink (one row per qualifying record)
//! ```

pub mod dispatcher;
pub mod notifier;
pub mod rate_limiter;

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use promptwatch_core::types::AlertOutcome;

use crate::error::TrafficError;

pub use dispatcher::{AlertDispatcher, AlertDispatcherConfig, AlertStats};
pub use notifier::{AlertMessage, Notifier, WebhookNotifier};
pub use rate_limiter::SlidingWindowLimiter;

/// Audit row for one qualifying record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub request_id: String,
    /// Channel name, e.g. `slack`.
    pub alert_type: String,
    pub recipient: String,
    pub risk_score: u8,
    pub src_ip: String,
    pub prompt_preview: String,
    pub outcome: AlertOutcome,
    /// Set for `failed` only.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set for `sent` only.
    pub sent_at: Option<DateTime<Utc>>,
}

/// Where alert audit rows go.
pub trait AlertAuditSink: Send + Sync + 'static {
    /// Idempotent on `request_id`. Returns false when a row already existed.
    fn record_alert(
        &self,
        alert: &AlertRecord,
    ) -> impl Future<Output = Result<bool, TrafficError>> + Send;
}

impl<A: AlertAuditSink> AlertAuditSink for std::sync::Arc<A> {
    fn record_alert(
        &self,
        alert: &AlertRecord,
    ) -> impl Future<Output = Result<bool, TrafficError>> + Send {
        (**self).record_alert(alert)
    }
}
