//! Prometheus metrics HTTP server.
//!
//! Uses the built-in HTTP listener from `metrics-exporter-prometheus`
//! to expose the scrape endpoint.
//!
//! ```ignore
//! install_metrics_recorder(&config.metrics)?;
//! // every metrics::counter!/gauge!/histogram! call is now recorded
//! ```

use std::net::SocketAddr;

use anyhow::Result;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

use promptwatch_core::config::MetricsConfig;
use promptwatch_core::metrics as m;

/// Install the global metrics recorder and start the HTTP listener.
///
/// Call once per process.
///
/// # Errors
///
/// - Unsupported endpoint path or unparseable listen address
/// - Socket binding fails
/// - Global recorder is already installed
pub fn install_metrics_recorder(config: &MetricsConfig) -> Result<()> {
    let addr = listen_addr(config)?;

    if addr.ip().is_unspecified() {
        tracing::warn!(
            listen_addr = %addr,
            "metrics endpoint is exposed on all interfaces; restrict listen_addr in untrusted networks"
        );
    }

    tracing::info!(listen_addr = %addr, "installing Prometheus metrics recorder");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(m::DETECTION_BATCH_DURATION_SECONDS.to_owned()),
            &m::PROCESSING_DURATION_BUCKETS,
        )
        .and_then(|b| {
            b.set_buckets_for_metric(
                Matcher::Full(m::ALERTS_SEND_DURATION_SECONDS.to_owned()),
                &m::PROCESSING_DURATION_BUCKETS,
            )
        })
        .and_then(|b| {
            b.set_buckets_for_metric(
                Matcher::Full(m::STORAGE_FLUSH_DURATION_SECONDS.to_owned()),
                &m::FLUSH_DURATION_BUCKETS,
            )
        })
        .map_err(|e| anyhow::anyhow!("invalid histogram buckets: {}", e))?
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {}", e))?;

    m::describe_all();

    tracing::info!(listen_addr = %addr, "Prometheus metrics endpoint active");
    Ok(())
}

/// Socket address the exporter binds to.
pub fn listen_addr(config: &MetricsConfig) -> Result<SocketAddr> {
    if config.endpoint != "/metrics" {
        return Err(anyhow::anyhow!(
            "unsupported metrics endpoint '{}': only '/metrics' is currently supported",
            config.endpoint
        ));
    }

    format!("{}:{}", config.listen_addr, config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics listen address: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_localhost() {
        let addr = listen_addr(&MetricsConfig::default()).unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), MetricsConfig::default().port);
    }

    #[test]
    fn custom_endpoint_is_rejected() {
        let config = MetricsConfig {
            endpoint: "/prom".to_owned(),
            ..Default::default()
        };
        let err = listen_addr(&config).unwrap_err();
        assert!(err.to_string().contains("unsupported metrics endpoint"));
    }

    #[test]
    fn bad_address_is_rejected() {
        let config = MetricsConfig {
            listen_addr: "not an address".to_owned(),
            ..Default::default()
        };
        assert!(listen_addr(&config).is_err());
    }
}
