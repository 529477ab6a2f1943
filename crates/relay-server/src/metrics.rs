//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants to avoid typos across modules.

/// Stream connections accepted (counter, labels: endpoint).
pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
/// Stream connections refused by a handler hook (counter, labels: endpoint, stage).
pub const CONNECTIONS_REJECTED_TOTAL: &str = "relay_connections_rejected_total";
/// Stream connections torn down (counter, labels: endpoint).
pub const DISCONNECTIONS_TOTAL: &str = "relay_disconnections_total";
/// Currently open stream connections (gauge, labels: endpoint).
pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Connection lifetime in seconds (histogram, labels: endpoint).
pub const CONNECTION_DURATION_SECONDS: &str = "relay_connection_duration_seconds";
/// Messages published to an endpoint's fan-out (counter, labels: endpoint).
pub const BROADCASTS_TOTAL: &str = "relay_broadcasts_total";
/// Broadcast messages skipped by a lagging consumer (counter).
pub const BROADCAST_LAGGED_TOTAL: &str = "relay_broadcast_lagged_total";
/// Direct messages refused because the queue was full (counter).
pub const DIRECT_DROPPED_TOTAL: &str = "relay_direct_dropped_total";
/// Callback requests dispatched to a session (counter, labels: endpoint).
pub const CALLBACKS_TOTAL: &str = "relay_callbacks_total";
