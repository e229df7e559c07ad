//! Error types, one enum per area.

/// Top-level promptwatch error.
#[derive(Debug, thiserror::Error)]
pub enum PromptwatchError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Pipeline lifecycle and processing errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline init failed: {0}")]
    InitFailed(String),

    #[error("pipeline is already running")]
    AlreadyRunning,

    #[error("pipeline is not running")]
    NotRunning,

    /// A batch could not be persisted; its stream offsets were not committed.
    #[error("persistence failed: {0}")]
    Persistence(String),
}

/// Durable store errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),
}

/// Message stream errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("poll failed: {0}")]
    Poll(String),

    #[error("offset commit failed: {0}")]
    Commit(String),
}
