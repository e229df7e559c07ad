//! Tracing setup for promptwatch-daemon.
//!
//! Driven by `[general]` in `PromptwatchConfig`:
//!
//! - `log_format = "json"`: one JSON object per line with event fields
//!   flattened to the top level, so `request_id`, `worker`, `partition` and
//!   `offset` can be filtered on directly by the log shipper.
//! - `log_format = "pretty"`: multi-line human output for local runs.
//!
//! `RUST_LOG` replaces the computed filter entirely. Otherwise the filter is
//! `log_level` for promptwatch crates, with the database driver, HTTP stack
//! and Kafka client capped at `warn` so a `debug` level stays readable.

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use promptwatch_core::config::GeneralConfig;

/// Targets capped at `warn` unless `RUST_LOG` says otherwise.
const QUIET_TARGETS: &[&str] = &["sqlx", "hyper", "hyper_util", "reqwest", "rustls", "rdkafka"];

/// Installs the global subscriber. Call once, before the first event.
pub fn init_tracing(config: &GeneralConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directives(&config.log_level))
            .map_err(|e| anyhow::anyhow!("invalid log level '{}': {}", config.log_level, e))?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let initialized = match config.log_format.as_str() {
        "json" => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .try_init(),
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
        other => {
            return Err(anyhow::anyhow!(
                "unknown log format '{}', expected 'json' or 'pretty'",
                other
            ));
        }
    };

    initialized.map_err(|e| {
        anyhow::anyhow!(
            "failed to initialize {} tracing subscriber: {}",
            config.log_format,
            e
        )
    })
}

/// `level` as the default directive plus a `warn` cap per quiet target.
/// A quiet target is never raised above `level`.
fn filter_directives(level: &str) -> String {
    let level = level.trim().to_lowercase();
    let cap = match level.as_str() {
        "error" => "error",
        _ => "warn",
    };
    let mut directives = vec![level.clone()];
    directives.extend(QUIET_TARGETS.iter().map(|t| format!("{t}={cap}")));
    directives.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_level_keeps_dependencies_at_warn() {
        let directives = filter_directives("debug");
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("sqlx=warn"));
        assert!(directives.contains("rdkafka=warn"));
        EnvFilter::try_new(&directives).unwrap();
    }

    #[test]
    fn error_level_does_not_raise_dependencies() {
        let directives = filter_directives(" ERROR ");
        assert!(directives.starts_with("error,"));
        assert!(directives.contains("hyper=error"));
        assert!(!directives.contains("=warn"));
    }

    #[test]
    fn unknown_format_is_rejected() {
        let config = GeneralConfig {
            log_format: "xml".to_owned(),
            ..Default::default()
        };
        let err = init_tracing(&config).unwrap_err();
        assert!(err.to_string().contains("xml"));
    }
}
