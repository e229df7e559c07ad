#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod types;

// --- re-exports ---

pub use error::{ConfigError, PipelineError, PromptwatchError, StorageError, StreamError};

pub use config::PromptwatchConfig;

pub use pipeline::{HealthStatus, Pipeline};

pub use types::{AlertOutcome, Severity, TrafficRecord};
