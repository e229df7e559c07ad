//! Traffic pipeline configuration
//!
//! [`TrafficPipelineConfig`] flattens the `stream`, `storage`, `detection`
//! and `alerting` sections of [`PromptwatchConfig`] into the values the
//! pipeline actually uses.
//!
//! ```ignore
//! use promptwatch_core::config::PromptwatchConfig;
//! use promptwatch_pipeline::config::TrafficPipelineConfig;
//!
//! let core = PromptwatchConfig::default();
//! let config = TrafficPipelineConfig::from_core(&core);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use promptwatch_core::config::PromptwatchConfig;

use crate::error::TrafficError;

const MAX_MICRO_BATCH_SIZE: usize = 10_000;
const MAX_BATCH_SIZE: usize = 100_000;
const MAX_WORKERS: usize = 256;
const MAX_FLUSH_INTERVAL_MS: u64 = 60_000;
const MAX_RETRIES: u32 = 20;
const MAX_REFRESH_INTERVAL_SECS: u64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficPipelineConfig {
    /// Records pulled per poll.
    pub micro_batch_size: usize,
    pub poll_timeout_ms: u64,
    /// Parallel workers; each owns one stream source.
    pub workers: usize,

    /// Buffered records that trigger a flush.
    pub batch_size: usize,
    /// Age of the oldest buffered record that triggers a flush.
    pub flush_interval_ms: u64,
    pub write_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Upper bound for a single backoff sleep.
    pub max_retry_backoff_ms: u64,

    pub refresh_interval_secs: u64,
    pub refresh_timeout_secs: u64,

    pub alert_threshold: u8,
    pub alert_rate_limit: u32,
    pub alert_rate_window_secs: u64,
    pub alert_send_timeout_secs: u64,
    /// How long a request id is remembered so redelivery does not alert twice.
    pub alert_dedup_window_secs: u64,
    pub dashboard_base_url: String,
    pub prompt_preview_chars: usize,
}

impl Default for TrafficPipelineConfig {
    fn default() -> Self {
        Self {
            micro_batch_size: 100,
            poll_timeout_ms: 1000,
            workers: 1,
            batch_size: 500,
            flush_interval_ms: 1000,
            write_timeout_ms: 5000,
            max_retries: 5,
            retry_backoff_ms: 100,
            max_retry_backoff_ms: 5000,
            refresh_interval_secs: 60,
            refresh_timeout_secs: 10,
            alert_threshold: 50,
            alert_rate_limit: 5,
            alert_rate_window_secs: 60,
            alert_send_timeout_secs: 10,
            alert_dedup_window_secs: 600,
            dashboard_base_url: "http://localhost:3000".to_owned(),
            prompt_preview_chars: 150,
        }
    }
}

impl TrafficPipelineConfig {
    /// Builds the pipeline config from the daemon config.
    ///
    /// Fields with no counterpart in `promptwatch.toml` keep their defaults.
    pub fn from_core(core: &PromptwatchConfig) -> Self {
        Self {
            micro_batch_size: core.stream.micro_batch_size,
            poll_timeout_ms: core.stream.poll_timeout_ms,
            workers: core.stream.workers,
            batch_size: core.storage.batch_size,
            flush_interval_ms: core.storage.flush_interval_ms,
            write_timeout_ms: core.storage.write_timeout_ms,
            max_retries: core.storage.max_retries,
            retry_backoff_ms: core.storage.retry_backoff_ms,
            refresh_interval_secs: core.detection.refresh_interval_secs,
            refresh_timeout_secs: core.detection.refresh_timeout_secs,
            alert_threshold: core.alerting.min_risk_score,
            alert_rate_limit: core.alerting.rate_limit,
            alert_rate_window_secs: core.alerting.rate_window_secs,
            alert_send_timeout_secs: core.alerting.send_timeout_secs,
            dashboard_base_url: core.alerting.dashboard_base_url.clone(),
            prompt_preview_chars: core.alerting.prompt_preview_chars,
            ..Self::default()
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn alert_rate_window(&self) -> Duration {
        Duration::from_secs(self.alert_rate_window_secs)
    }

    pub fn alert_send_timeout(&self) -> Duration {
        Duration::from_secs(self.alert_send_timeout_secs)
    }

    pub fn alert_dedup_window(&self) -> Duration {
        Duration::from_secs(self.alert_dedup_window_secs)
    }

    pub fn validate(&self) -> Result<(), TrafficError> {
        if self.micro_batch_size == 0 || self.micro_batch_size > MAX_MICRO_BATCH_SIZE {
            return Err(config_error(
                "micro_batch_size",
                format!("must be 1-{MAX_MICRO_BATCH_SIZE}"),
            ));
        }
        if self.poll_timeout_ms == 0 {
            return Err(config_error("poll_timeout_ms", "must be greater than 0"));
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(config_error("workers", format!("must be 1-{MAX_WORKERS}")));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(config_error(
                "batch_size",
                format!("must be 1-{MAX_BATCH_SIZE}"),
            ));
        }
        if self.flush_interval_ms == 0 || self.flush_interval_ms > MAX_FLUSH_INTERVAL_MS {
            return Err(config_error(
                "flush_interval_ms",
                format!("must be 1-{MAX_FLUSH_INTERVAL_MS}"),
            ));
        }
        if self.write_timeout_ms == 0 {
            return Err(config_error("write_timeout_ms", "must be greater than 0"));
        }
        if self.max_retries > MAX_RETRIES {
            return Err(config_error(
                "max_retries",
                format!("must be at most {MAX_RETRIES}"),
            ));
        }
        if self.max_retry_backoff_ms < self.retry_backoff_ms {
            return Err(config_error(
                "max_retry_backoff_ms",
                "must not be smaller than retry_backoff_ms",
            ));
        }
        if self.refresh_interval_secs == 0
            || self.refresh_interval_secs > MAX_REFRESH_INTERVAL_SECS
        {
            return Err(config_error(
                "refresh_interval_secs",
                format!("must be 1-{MAX_REFRESH_INTERVAL_SECS}"),
            ));
        }
        if self.refresh_timeout_secs == 0 {
            return Err(config_error("refresh_timeout_secs", "must be greater than 0"));
        }
        if self.alert_threshold > 100 {
            return Err(config_error("alert_threshold", "must be 0-100"));
        }
        if self.alert_rate_limit == 0 {
            return Err(config_error("alert_rate_limit", "must be greater than 0"));
        }
        if self.alert_rate_window_secs == 0 {
            return Err(config_error(
                "alert_rate_window_secs",
                "must be greater than 0",
            ));
        }
        if self.alert_send_timeout_secs == 0 {
            return Err(config_error(
                "alert_send_timeout_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

fn config_error(field: &str, reason: impl Into<String>) -> TrafficError {
    TrafficError::Config {
        field: field.to_owned(),
        reason: reason.into(),
    }
}

/// Builder for [`TrafficPipelineConfig`], validated on `build()`.
#[derive(Default)]
pub struct TrafficPipelineConfigBuilder {
    config: TrafficPipelineConfig,
}

impl TrafficPipelineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn micro_batch_size(mut self, size: usize) -> Self {
        self.config.micro_batch_size = size;
        self
    }

    pub fn poll_timeout_ms(mut self, ms: u64) -> Self {
        self.config.poll_timeout_ms = ms;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn flush_interval_ms(mut self, ms: u64) -> Self {
        self.config.flush_interval_ms = ms;
        self
    }

    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn refresh_interval_secs(mut self, secs: u64) -> Self {
        self.config.refresh_interval_secs = secs;
        self
    }

    pub fn refresh_timeout_secs(mut self, secs: u64) -> Self {
        self.config.refresh_timeout_secs = secs;
        self
    }

    pub fn alert_threshold(mut self, threshold: u8) -> Self {
        self.config.alert_threshold = threshold;
        self
    }

    pub fn alert_rate_limit(mut self, limit: u32, window_secs: u64) -> Self {
        self.config.alert_rate_limit = limit;
        self.config.alert_rate_window_secs = window_secs;
        self
    }

    pub fn dashboard_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.dashboard_base_url = url.into();
        self
    }

    pub fn build(self) -> Result<TrafficPipelineConfig, TrafficError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
