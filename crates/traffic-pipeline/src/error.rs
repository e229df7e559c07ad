//! Traffic pipeline error type
//!
//! [`TrafficError`] covers every failure inside the pipeline crate. The
//! `From<TrafficError> for PromptwatchError` conversion lets the daemon
//! propagate it with `?`.

use promptwatch_core::error::{
    ConfigError, PipelineError, PromptwatchError, StorageError, StreamError,
};

#[derive(Debug, thiserror::Error)]
pub enum TrafficError {
    /// Payload could not be turned into a traffic record.
    #[error("malformed record: {reason}")]
    MalformedRecord { reason: String },

    #[error("rule validation error: rule '{rule_id}': {reason}")]
    RuleValidation { rule_id: String, reason: String },

    /// Rule pattern failed to compile (bad regex, unparseable expression).
    #[error("rule compile error: rule '{rule_id}': {reason}")]
    RuleCompile { rule_id: String, reason: String },

    #[error("rule load error: {path}: {reason}")]
    RuleLoad { path: String, reason: String },

    #[error("rule store error: {0}")]
    RuleStore(String),

    #[error("rule refresh timed out after {timeout_ms}ms")]
    RefreshTimeout { timeout_ms: u64 },

    #[error("notification failed: {0}")]
    Notify(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// Every write attempt for a batch failed; its offsets must not be committed.
    #[error("persistence exhausted after {attempts} attempts ({records} records): {reason}")]
    PersistenceExhausted {
        attempts: u32,
        records: usize,
        reason: String,
    },

    #[error("stream error: {0}")]
    Stream(String),

    /// Field encryption key unusable, or a sealed value failed to open.
    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("config error: {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for TrafficError {
    fn from(err: sqlx::Error) -> Self {
        TrafficError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for TrafficError {
    fn from(err: reqwest::Error) -> Self {
        TrafficError::Notify(err.to_string())
    }
}

impl From<TrafficError> for PromptwatchError {
    fn from(err: TrafficError) -> Self {
        match err {
            TrafficError::Config { field, reason } => {
                ConfigError::InvalidValue { field, reason }.into()
            }
            TrafficError::Storage(reason) => StorageError::Query(reason).into(),
            TrafficError::Stream(reason) => StreamError::Poll(reason).into(),
            TrafficError::Io(e) => PromptwatchError::Io(e),
            e @ TrafficError::PersistenceExhausted { .. } => {
                PipelineError::Persistence(e.to_string()).into()
            }
            other => PipelineError::InitFailed(other.to_string()).into(),
        }
    }
}
