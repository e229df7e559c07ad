//! Backend wiring and daemon lifecycle.
//!
//! The [`Orchestrator`] turns a `PromptwatchConfig` into a running
//! [`TrafficPipeline`]: it connects storage, picks the rule source and the
//! stream backend, loads the first rule snapshot, and then drives the
//! pipeline from startup to graceful shutdown.
//!
//! # Startup (any failure exits non-zero)
//!
//! 1. Metrics recorder (when enabled)
//! 2. Storage (PostgreSQL connect with retries, schema bootstrap)
//! 3. Rule source and initial snapshot
//! 4. Stream sources (broker metadata check for Kafka)
//! 5. Pipeline start, PID file
//!
//! # Shutdown
//!
//! 1. Background tasks (uptime updater)
//! 2. Pipeline stop: workers flush and commit what they hold
//! 3. Storage pool close, PID file removal

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use promptwatch_core::config::{DetectionConfig, PromptwatchConfig, StorageConfig, StreamConfig};
use promptwatch_core::pipeline::{HealthStatus, Pipeline};
use promptwatch_pipeline::{
    FieldCipher, FileRuleStore, JsonLinesSource, MemoryStore, MemoryTopic, PgStore, PipelineStats, RuleSource,
    StorageBackend, StreamBackend, TrafficPipeline, TrafficPipelineBuilder, TrafficPipelineConfig,
    WebhookNotifier,
};

use crate::health::{ComponentHealth, DaemonHealth, aggregate_status, log_transition};
use crate::metrics_server;

/// Pipeline over the config-selected backends.
pub type DaemonPipeline = TrafficPipeline<StreamBackend, StorageBackend, RuleSource, WebhookNotifier>;

/// Pause between database connection attempts at startup.
const DB_CONNECT_DELAY: Duration = Duration::from_secs(2);

/// How long the Kafka metadata request may take before startup fails.
#[cfg(feature = "kafka")]
const KAFKA_METADATA_TIMEOUT: Duration = Duration::from_secs(10);

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);

const UPTIME_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Owns the pipeline and the storage handle for the life of the process.
pub struct Orchestrator {
    config: PromptwatchConfig,
    pipeline: DaemonPipeline,
    storage: StorageBackend,
    /// Set for the `memory` stream backend, so records can be published in-process.
    topic: Option<MemoryTopic>,
    shutdown_tx: broadcast::Sender<()>,
    background: Vec<JoinHandle<()>>,
    start_time: Instant,
    last_health: HealthStatus,
    started: bool,
}

impl Orchestrator {
    /// Loads `promptwatch.toml` (with environment overrides) and builds.
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = PromptwatchConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config).await
    }

    /// Builds from an already-loaded configuration.
    pub async fn build_from_config(config: PromptwatchConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
        }

        let storage = connect_storage(&config.storage).await?;
        let rules = build_rule_source(&config.detection, &storage)?;
        let (sources, topic) = build_stream_sources(&config.stream).await?;

        let mut builder = TrafficPipelineBuilder::new()
            .config(TrafficPipelineConfig::from_core(&config))
            .sources(sources)
            .store(Arc::new(storage.clone()))
            .rule_store(Arc::new(rules));

        if config.alerting.is_enabled() {
            let notifier = WebhookNotifier::new(
                config.alerting.webhook_url.clone(),
                Duration::from_secs(config.alerting.send_timeout_secs),
            )
            .map_err(|e| anyhow::anyhow!("failed to create webhook notifier: {}", e))?;
            builder = builder.notifier(notifier);
            tracing::info!(
                threshold = config.alerting.min_risk_score,
                rate_limit = config.alerting.rate_limit,
                rate_window_secs = config.alerting.rate_window_secs,
                "webhook alerting enabled"
            );
        } else {
            tracing::info!("alerting.webhook_url is empty, alerting disabled");
        }

        let pipeline = builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build traffic pipeline: {}", e))?;

        let snapshot = pipeline
            .rule_cache()
            .force_refresh()
            .await
            .map_err(|e| anyhow::anyhow!("failed to load detection rules: {}", e))?;
        if snapshot.is_empty() {
            tracing::warn!(
                source = %config.detection.rule_source,
                "no active detection rules, every record will score 0"
            );
        }

        if config.metrics.enabled {
            record_daemon_metrics();
        }

        tracing::info!(
            stream = %config.stream.backend,
            storage = storage.kind(),
            rules = %config.detection.rule_source,
            workers = pipeline.worker_count(),
            "orchestrator initialized"
        );

        let (shutdown_tx, _) = broadcast::channel(4);
        Ok(Self {
            config,
            pipeline,
            storage,
            topic,
            shutdown_tx,
            background: Vec::new(),
            start_time: Instant::now(),
            last_health: HealthStatus::Healthy,
            started: false,
        })
    }

    /// Starts the pipeline, runs until SIGTERM/SIGINT, then shuts down.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut health_tick = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let signal = {
            let shutdown = wait_for_shutdown_signal();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    signal = &mut shutdown => break signal,
                    _ = health_tick.tick() => self.check_health().await,
                }
            }
        };
        match signal {
            Ok(name) => tracing::info!(signal = name, "shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "signal handling failed, shutting down"),
        }

        self.shutdown().await
    }

    /// Writes the PID file and starts the pipeline.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(path) = self.pid_file() {
            write_pid_file(path)?;
        }

        if let Err(e) = self.pipeline.start().await {
            tracing::error!(error = %e, "traffic pipeline failed to start");
            if let Some(path) = self.pid_file() {
                remove_pid_file(path);
            }
            return Err(anyhow::anyhow!("failed to start traffic pipeline: {}", e));
        }
        self.started = true;

        if self.config.metrics.enabled {
            self.background.push(spawn_uptime_updater(
                self.start_time,
                self.shutdown_tx.subscribe(),
            ));
        }

        tracing::info!("promptwatch-daemon running");
        Ok(())
    }

    /// Stops background tasks, drains the pipeline and releases storage.
    pub async fn shutdown(&mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        for task in self.background.drain(..) {
            let _ = task.await;
        }

        let result = if self.started {
            tracing::info!("stopping traffic pipeline");
            self.started = false;
            self.pipeline
                .stop()
                .await
                .map_err(|e| anyhow::anyhow!("failed to stop traffic pipeline: {}", e))
        } else {
            Ok(())
        };

        let stats = self.pipeline.stats();
        tracing::info!(
            processed = stats.processed,
            flagged = stats.flagged,
            persisted = stats.persisted,
            malformed = stats.malformed,
            persistence_failures = stats.persistence_failures,
            "final pipeline statistics"
        );

        self.storage.close().await;
        if let Some(path) = self.pid_file() {
            remove_pid_file(path);
        }
        result
    }

    /// Current aggregated health.
    pub async fn health(&self) -> DaemonHealth {
        let storage_status = match self.storage.ping().await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unhealthy(e.to_string()),
        };
        let components = vec![
            ComponentHealth::new("traffic-pipeline", self.pipeline.health_check().await),
            ComponentHealth::new("storage", storage_status),
        ];

        DaemonHealth {
            status: aggregate_status(&components),
            uptime_secs: self.start_time.elapsed().as_secs(),
            components,
            stats: self.pipeline.stats(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    pub fn config(&self) -> &PromptwatchConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &DaemonPipeline {
        &self.pipeline
    }

    pub fn storage(&self) -> &StorageBackend {
        &self.storage
    }

    /// The in-process topic when `stream.backend = "memory"`.
    pub fn memory_topic(&self) -> Option<&MemoryTopic> {
        self.topic.as_ref()
    }

    async fn check_health(&mut self) {
        let health = self.health().await;
        if log_transition(&self.last_health, &health.status) {
            self.last_health = health.status;
        }
    }

    fn pid_file(&self) -> Option<&Path> {
        let pid_file = self.config.general.pid_file.as_str();
        (!pid_file.is_empty()).then(|| Path::new(pid_file))
    }
}

/// Field cipher from `storage.encryption_key`; `None` when the key is empty.
/// A key that does not decode to 32 bytes is a startup error.
fn field_cipher(config: &StorageConfig) -> Result<Option<FieldCipher>> {
    if config.encryption_key.trim().is_empty() {
        return Ok(None);
    }
    FieldCipher::from_base64(&config.encryption_key)
        .map(Some)
        .map_err(|e| anyhow::anyhow!("invalid storage.encryption_key: {}", e))
}

async fn connect_storage(config: &StorageConfig) -> Result<StorageBackend> {
    let cipher = field_cipher(config)?;
    match config.backend.as_str() {
        "postgres" => {
            let store = PgStore::connect(
                &config.database_url,
                config.max_connections,
                config.connect_retries,
                DB_CONNECT_DELAY,
            )
            .await
            .map_err(|e| anyhow::anyhow!("failed to connect to database: {}", e))?;
            if config.ensure_schema {
                store
                    .ensure_schema()
                    .await
                    .map_err(|e| anyhow::anyhow!("failed to bootstrap database schema: {}", e))?;
            }
            let store = match cipher {
                Some(cipher) => {
                    tracing::info!("prompt, response and headers are encrypted at rest");
                    store.with_cipher(cipher)
                }
                None => {
                    tracing::error!(
                        "storage.encryption_key is not set, prompts will be stored unencrypted"
                    );
                    store
                }
            };
            Ok(StorageBackend::Postgres(store))
        }
        "memory" => {
            tracing::warn!("memory storage backend: records are not durable");
            Ok(StorageBackend::Memory(Arc::new(MemoryStore::new())))
        }
        other => Err(anyhow::anyhow!("unknown storage backend '{}'", other)),
    }
}

fn build_rule_source(config: &DetectionConfig, storage: &StorageBackend) -> Result<RuleSource> {
    match (config.rule_source.as_str(), storage) {
        ("database", StorageBackend::Postgres(store)) => Ok(RuleSource::Database(store.rule_store())),
        ("database", _) => Err(anyhow::anyhow!(
            "detection.rule_source = 'database' requires storage.backend = 'postgres'"
        )),
        ("directory", _) => Ok(RuleSource::Directory(FileRuleStore::new(&config.rule_dir))),
        (other, _) => Err(anyhow::anyhow!("unknown rule source '{}'", other)),
    }
}

async fn build_stream_sources(
    config: &StreamConfig,
) -> Result<(Vec<StreamBackend>, Option<MemoryTopic>)> {
    match config.backend.as_str() {
        "jsonl" => {
            if config.workers > 1 {
                tracing::warn!(
                    workers = config.workers,
                    "jsonl backend replays a single file, using one worker"
                );
            }
            let source = JsonLinesSource::open(&config.jsonl_path)
                .await
                .map_err(|e| anyhow::anyhow!("failed to open replay file: {}", e))?;
            Ok((vec![StreamBackend::JsonLines(source)], None))
        }
        "memory" => {
            let topic = MemoryTopic::new(config.workers);
            let sources = (0..topic.partition_count() as i32)
                .map(|p| StreamBackend::Memory(topic.consumer(&config.group_id, vec![p])))
                .collect();
            Ok((sources, Some(topic)))
        }
        "kafka" => Ok((kafka_sources(config).await?, None)),
        other => Err(anyhow::anyhow!("unknown stream backend '{}'", other)),
    }
}

/// One group member per worker; the broker assigns partitions among them.
#[cfg(feature = "kafka")]
async fn kafka_sources(config: &StreamConfig) -> Result<Vec<StreamBackend>> {
    let mut sources = Vec::with_capacity(config.workers);
    for _ in 0..config.workers {
        let source = promptwatch_pipeline::KafkaSource::connect(
            &config.brokers,
            &config.topic,
            &config.group_id,
            &config.auto_offset_reset,
            KAFKA_METADATA_TIMEOUT,
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to stream brokers: {}", e))?;
        sources.push(StreamBackend::Kafka(source));
    }
    Ok(sources)
}

#[cfg(not(feature = "kafka"))]
async fn kafka_sources(_config: &StreamConfig) -> Result<Vec<StreamBackend>> {
    Err(anyhow::anyhow!(
        "stream.backend = 'kafka' needs a build with the `kafka` feature"
    ))
}

/// Resolves with the name of the first SIGTERM/SIGINT received.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Creates the PID file, refusing to overwrite one left by another instance.
///
/// The file is created with `create_new` and mode 0600; a path that turns
/// out not to be a regular file is removed and rejected.
fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs::{self, OpenOptions};
    use std::io::{ErrorKind, Write};

    if let Some(parent) = path.parent() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new()
                .mode(0o700)
                .recursive(true)
                .create(parent)?;
        }
        #[cfg(not(unix))]
        fs::create_dir_all(parent)?;
    }

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_owned());
            return Err(anyhow::anyhow!(
                "PID file {} already exists with PID: {}. Is another instance running?",
                path.display(),
                existing.trim()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    if !file.metadata()?.is_file() {
        let _ = fs::remove_file(path);
        return Err(anyhow::anyhow!(
            "PID file {} is not a regular file",
            path.display()
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    let pid = std::process::id();
    writeln!(file, "{}", pid)?;
    tracing::info!(pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Best effort; a missing file only logs a warning.
fn remove_pid_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!(path = %path.display(), "PID file removed"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file"),
    }
}

fn record_daemon_metrics() {
    use promptwatch_core::metrics as m;

    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "daemon metrics recorded");
}

fn spawn_uptime_updater(
    start_time: Instant,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    use promptwatch_core::metrics as m;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPTIME_UPDATE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS)
                        .set(start_time.elapsed().as_secs() as f64);
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("uptime updater shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn pid_file_is_written_with_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("run").join("promptwatch.pid");

        write_pid_file(&pid_file).unwrap();

        let content = fs::read_to_string(&pid_file).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn existing_pid_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("promptwatch.pid");
        fs::write(&pid_file, "12345").unwrap();

        let err = write_pid_file(&pid_file).unwrap_err().to_string();
        assert!(err.contains("already exists"));
        assert!(err.contains("12345"));
    }

    #[test]
    fn pid_file_removal_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("promptwatch.pid");
        fs::write(&pid_file, "1").unwrap();

        remove_pid_file(&pid_file);
        assert!(!pid_file.exists());
        remove_pid_file(&pid_file);
    }

    #[test]
    fn database_rules_need_postgres_storage() {
        let detection = DetectionConfig {
            rule_source: "database".to_owned(),
            ..Default::default()
        };
        let storage = StorageBackend::Memory(Arc::new(MemoryStore::new()));
        assert!(build_rule_source(&detection, &storage).is_err());

        let detection = DetectionConfig {
            rule_source: "directory".to_owned(),
            rule_dir: "/etc/promptwatch/rules".to_owned(),
            ..Default::default()
        };
        let source = build_rule_source(&detection, &storage).unwrap();
        assert_eq!(source.kind(), "directory");
    }

    #[test]
    fn empty_encryption_key_disables_sealing() {
        let config = StorageConfig::default();
        assert!(field_cipher(&config).unwrap().is_none());

        let config = StorageConfig {
            encryption_key: "   ".to_owned(),
            ..Default::default()
        };
        assert!(field_cipher(&config).unwrap().is_none());
    }

    #[test]
    fn valid_encryption_key_builds_a_cipher() {
        let config = StorageConfig {
            encryption_key: "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=".to_owned(),
            ..Default::default()
        };
        let cipher = field_cipher(&config).unwrap().unwrap();
        let sealed = cipher.seal("prompt").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), "prompt");
    }

    #[tokio::test]
    async fn invalid_encryption_key_fails_startup() {
        let config = StorageConfig {
            backend: "memory".to_owned(),
            encryption_key: "c2hvcnQ=".to_owned(),
            ..Default::default()
        };
        let Err(err) = connect_storage(&config).await else {
            panic!("a 5-byte key should be rejected");
        };
        assert!(err.to_string().contains("encryption_key"));
    }

    #[tokio::test]
    async fn memory_stream_gets_one_source_per_worker() {
        let config = StreamConfig {
            backend: "memory".to_owned(),
            workers: 3,
            ..Default::default()
        };
        let (sources, topic) = build_stream_sources(&config).await.unwrap();
        assert_eq!(sources.len(), 3);
        assert_eq!(topic.unwrap().partition_count(), 3);
    }

    #[tokio::test]
    async fn missing_replay_file_fails_startup() {
        let config = StreamConfig {
            backend: "jsonl".to_owned(),
            jsonl_path: "/nonexistent/traffic.jsonl".to_owned(),
            ..Default::default()
        };
        assert!(build_stream_sources(&config).await.is_err());
    }

    #[tokio::test]
    async fn default_stream_backend_builds_without_kafka() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llm-traffic.jsonl");
        std::fs::write(&path, "").unwrap();
        let config = StreamConfig {
            jsonl_path: path.display().to_string(),
            ..Default::default()
        };
        let (sources, topic) = build_stream_sources(&config).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert!(topic.is_none());
    }

    #[cfg(not(feature = "kafka"))]
    #[tokio::test]
    async fn kafka_backend_requires_feature() {
        let config = StreamConfig {
            backend: "kafka".to_owned(),
            ..Default::default()
        };
        let Err(err) = build_stream_sources(&config).await else {
            panic!("kafka backend should be rejected without the feature");
        };
        assert!(err.to_string().contains("kafka"));
    }

    #[tokio::test]
    async fn uptime_updater_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = spawn_uptime_updater(Instant::now(), shutdown_rx);
        let _ = shutdown_tx.send(());
        let result = tokio::time::timeout(Duration::from_millis(500), task).await;
        assert!(result.is_ok());
    }
}
