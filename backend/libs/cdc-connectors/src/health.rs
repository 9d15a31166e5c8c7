//! Connector health evaluation
//!
//! A check runs the connector's [`PositionProbe`] under a timeout and maps the
//! outcome to a [`HealthStatus`]. Exposure (HTTP, gRPC) is left to the host
//! service.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::connector::{ConnectorKind, PositionProbe};
use crate::position::CdcPosition;

/// Connector health state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Source reachable and position readable
    Healthy,
    /// Probe succeeded but slower than the configured threshold
    Degraded,
    /// Source unreachable, store unavailable, or probe timed out
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Outcome of one health check
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub connector_id: String,
    pub status: HealthStatus,
    /// `["cdc", <provider>]`, used to route readiness checks
    pub tags: Vec<&'static str>,
    pub position: Option<CdcPosition>,
    pub latency: Duration,
    pub detail: Option<String>,
}

impl HealthReport {
    /// Whether the connector can take traffic
    pub fn is_ready(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}

/// Health check for a single connector
pub struct ConnectorHealthCheck {
    probe: Arc<dyn PositionProbe>,
    timeout: Duration,
    degraded_after: Duration,
}

impl ConnectorHealthCheck {
    pub fn new(probe: Arc<dyn PositionProbe>) -> Self {
        Self {
            probe,
            timeout: Duration::from_secs(5),
            degraded_after: Duration::from_secs(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_degraded_after(mut self, threshold: Duration) -> Self {
        self.degraded_after = threshold;
        self
    }

    pub fn tags(kind: ConnectorKind) -> Vec<&'static str> {
        vec!["cdc", kind.as_str()]
    }

    pub async fn check(&self) -> HealthReport {
        let connector_id = self.probe.connector_id().to_string();
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.probe.get_current_position()).await;
        let latency = started.elapsed();

        let (status, position, detail) = match outcome {
            Ok(Ok(position)) if latency > self.degraded_after => {
                warn!(
                    connector_id = %connector_id,
                    latency_ms = latency.as_millis() as u64,
                    "CDC connector probe is slow"
                );
                (
                    HealthStatus::Degraded,
                    Some(position),
                    Some(format!("probe took {:?}", latency)),
                )
            }
            Ok(Ok(position)) => (HealthStatus::Healthy, Some(position), None),
            Ok(Err(e)) => {
                warn!(connector_id = %connector_id, error = %e, "CDC connector probe failed");
                (HealthStatus::Unhealthy, None, Some(e.to_string()))
            }
            Err(_) => {
                warn!(
                    connector_id = %connector_id,
                    timeout = ?self.timeout,
                    "CDC connector probe timed out"
                );
                (
                    HealthStatus::Unhealthy,
                    None,
                    Some(format!("probe timed out after {:?}", self.timeout)),
                )
            }
        };

        debug!(connector_id = %connector_id, status = status.as_str(), "CDC health check complete");

        HealthReport {
            connector_id,
            status,
            tags: Self::tags(self.probe.kind()),
            position,
            latency,
            detail,
        }
    }
}
