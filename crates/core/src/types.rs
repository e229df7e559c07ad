//! Domain types shared by the pipeline and the daemon.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One intercepted LLM API call, as published on the traffic stream.
///
/// Records are immutable once parsed. `request_id` is the idempotency key:
/// the stream may deliver the same record more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub src_ip: String,
    /// Lower-cased, trimmed provider name (`openai`, `anthropic`, ...).
    pub provider: String,
    /// Lower-cased, trimmed model name.
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// HTTP headers of the intercepted call. Stored encrypted when a
    /// storage key is configured.
    #[serde(default)]
    pub headers: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub method: String,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub status_code: Option<i32>,
}

impl TrafficRecord {
    /// Returns a numeric metadata value, accepting numbers and numeric strings.
    pub fn metadata_number(&self, key: &str) -> Option<f64> {
        match self.metadata.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for TrafficRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}/{}",
            self.request_id, self.src_ip, self.provider, self.model
        )
    }
}

/// Rule severity.
///
/// `Ord` follows urgency: `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Case-insensitive parse accepting common abbreviations.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "med" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" | "crit" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Terminal outcome of an alert for a qualifying record.
///
/// There is no retry transition: every outcome is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertOutcome {
    Sent,
    RateLimited,
    Failed,
}

impl AlertOutcome {
    /// Value stored in the `alerts.status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::RateLimited => "rate_limited",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AlertOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
