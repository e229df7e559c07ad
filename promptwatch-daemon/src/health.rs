//! Aggregated health reporting.
//!
//! The daemon's status is the worst status among its components
//! (traffic pipeline, storage).
//!
//! # Aggregation Rule
//!
//! - All Healthy -> Healthy
//! - Any Degraded, none Unhealthy -> Degraded(reason)
//! - Any Unhealthy -> Unhealthy(reason)

use serde::Serialize;

use promptwatch_core::pipeline::HealthStatus;
use promptwatch_pipeline::PipelineStats;

/// Aggregated health report for the daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonHealth {
    /// Worst status of all components.
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub components: Vec<ComponentHealth>,
    pub stats: PipelineStats,
}

/// Health of one component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// Component name (e.g., "traffic-pipeline", "storage").
    pub name: String,
    pub enabled: bool,
    pub status: HealthStatus,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            status,
        }
    }
}

/// Returns the worst status among enabled components, with every
/// non-healthy reason prefixed by its component name.
pub fn aggregate_status(components: &[ComponentHealth]) -> HealthStatus {
    let mut worst = HealthStatus::Healthy;
    let mut reasons = Vec::new();

    for component in components.iter().filter(|c| c.enabled) {
        match &component.status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded(reason) => {
                reasons.push(format!("{}: {}", component.name, reason));
                if !worst.is_unhealthy() {
                    worst = HealthStatus::Degraded(String::new());
                }
            }
            HealthStatus::Unhealthy(reason) => {
                reasons.push(format!("{}: {}", component.name, reason));
                worst = HealthStatus::Unhealthy(String::new());
            }
        }
    }

    match worst {
        HealthStatus::Healthy => HealthStatus::Healthy,
        HealthStatus::Degraded(_) => HealthStatus::Degraded(reasons.join("; ")),
        HealthStatus::Unhealthy(_) => HealthStatus::Unhealthy(reasons.join("; ")),
    }
}

/// Logs a health change. Returns true when the status differs from
/// `previous`.
pub fn log_transition(previous: &HealthStatus, current: &HealthStatus) -> bool {
    if previous == current {
        return false;
    }
    match current {
        HealthStatus::Healthy => tracing::info!(previous = %previous, "daemon healthy"),
        HealthStatus::Degraded(reason) => {
            tracing::warn!(previous = %previous, reason = %reason, "daemon degraded");
        }
        HealthStatus::Unhealthy(reason) => {
            tracing::error!(previous = %previous, reason = %reason, "daemon unhealthy");
        }
    }
    true
}
