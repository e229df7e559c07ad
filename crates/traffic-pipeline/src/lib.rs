#![doc = include_str!("../README.md")]
//!
//! # Modules
//!
//! - [`stream`]: stream sources with explicit commit and rewind (memory, JSON Lines, Kafka)
//! - [`record`]: payload parsing into [`TrafficRecord`](promptwatch_core::TrafficRecord)
//! - [`rule`]: rule definitions, stores and the atomically swapped rule cache
//! - [`engine`]: priority-ordered scoring
//! - [`alert`]: rate-limited webhook alerts with audit rows
//! - [`batcher`]: size/time triggered bulk persistence with retry
//! - [`storage`]: traffic stores (PostgreSQL, memory) and at-rest field encryption
//! - [`consumer`]: worker loop and pipeline lifecycle (Pipeline trait)
//! - [`config`]: pipeline settings (derived from core config)
//! - [`error`]: domain error type

pub mod alert;
pub mod batcher;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod record;
pub mod rule;
pub mod storage;
pub mod stream;

// --- re-exports ---

// pipeline
pub use consumer::{PipelineStats, TrafficPipeline, TrafficPipelineBuilder};

// config
pub use config::{TrafficPipelineConfig, TrafficPipelineConfigBuilder};

// errors
pub use error::TrafficError;

// scoring
pub use engine::{DetectionStats, ScoreResult};

// rules
pub use rule::{
    DetectionRule, FileRuleStore, MemoryRuleStore, RuleCache, RuleSnapshot, RuleSource,
    RuleStore, RuleType,
};

// alerts
pub use alert::{
    AlertAuditSink, AlertDispatcher, AlertDispatcherConfig, AlertRecord, AlertStats, Notifier,
    WebhookNotifier,
};

// persistence
pub use batcher::{FlushOutcome, PersistenceBatcher};
pub use storage::{
    FieldCipher, MemoryStore, PgRuleStore, PgStore, ScoredRecord, StorageBackend, TrafficStore,
};

// streams
#[cfg(feature = "kafka")]
pub use stream::KafkaSource;
pub use stream::{
    JsonLinesSource, MemoryStream, MemoryTopic, StreamBackend, StreamMessage, StreamPosition,
    StreamSource,
};
