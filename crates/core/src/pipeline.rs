//! Lifecycle trait shared by long-running components.
//!
//! The daemon drives every component through [`Pipeline`]:
//! ```text
//! built -> start() -> running -> stop() -> stopped
//! ```

use std::fmt;
use std::future::Future;

use serde::Serialize;

use crate::error::PromptwatchError;

/// Health of a component as reported by [`Pipeline::health_check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Working, but with reduced guarantees (e.g. a batch failed to persist).
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

/// A component with an explicit start/stop lifecycle.
///
/// `stop()` must let in-flight work finish before returning.
pub trait Pipeline: Send {
    fn start(&mut self) -> impl Future<Output = Result<(), PromptwatchError>> + Send;

    fn stop(&mut self) -> impl Future<Output = Result<(), PromptwatchError>> + Send;

    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}
