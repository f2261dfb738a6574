//! Prometheus export for connection metrics.
//!
//! The server records through the `metrics` facade; this module installs a
//! Prometheus recorder so those values can be rendered.
//!
//! # Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `gracedown_connections_open` | Gauge | Connections not yet closed |
//! | `gracedown_connections_idle` | Gauge | Idle keep-alive connections |
//! | `gracedown_connections_reaped_total` | Counter | Idle connections force-closed by a reaper |
//!
//! The gauges move by increments and decrements, so several servers in one
//! process report their combined counts.
//!
//! # Example
//!
//! ```rust,ignore
//! use gracedown_telemetry::metrics::{init_metrics, MetricsConfig};
//!
//! let registry = init_metrics(&MetricsConfig::default())?.expect("enabled");
//! println!("{}", registry.render());
//! ```

use crate::error::TelemetryError;
use crate::TelemetryResult;
use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Open connections gauge.
pub const CONNECTIONS_OPEN: &str = "gracedown_connections_open";

/// Idle connections gauge.
pub const CONNECTIONS_IDLE: &str = "gracedown_connections_idle";

/// Force-closed idle connections counter.
pub const CONNECTIONS_REAPED: &str = "gracedown_connections_reaped_total";

/// Metrics configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Whether to install the Prometheus recorder.
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Handle to the installed Prometheus recorder.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    handle: PrometheusHandle,
}

impl MetricsRegistry {
    /// Renders all metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Installs the Prometheus recorder as the global `metrics` recorder.
///
/// Returns `None` when metrics are disabled.
///
/// # Errors
///
/// Returns `TelemetryError::MetricsInit` if a global recorder is already
/// installed.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<Option<MetricsRegistry>> {
    if !config.enabled {
        return Ok(None);
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    register_metric_descriptions();

    Ok(Some(MetricsRegistry { handle }))
}

fn register_metric_descriptions() {
    describe_gauge!(
        CONNECTIONS_OPEN,
        Unit::Count,
        "Number of accepted connections that have not closed yet"
    );
    describe_gauge!(
        CONNECTIONS_IDLE,
        Unit::Count,
        "Number of keep-alive connections waiting for a request"
    );
    describe_counter!(
        CONNECTIONS_REAPED,
        Unit::Count,
        "Idle connections force-closed after a grace period"
    );
}
