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

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// Accepted sockets (counter, labels: role).
pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
/// Open sockets (gauge).
pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Authentication attempts (counter, labels: result).
pub const AUTHENTICATIONS_TOTAL: &str = "relay_authentications_total";
/// Forced closes to enforce slot limits (counter, labels: reason).
pub const EVICTIONS_TOTAL: &str = "relay_evictions_total";
/// Frames handed to a paired peer (counter).
pub const FRAMES_FORWARDED_TOTAL: &str = "relay_frames_forwarded_total";
/// Frames discarded for lack of a live peer (counter).
pub const FRAMES_DROPPED_TOTAL: &str = "relay_frames_dropped_total";
/// Connections closed for missing the keepalive window (counter).
pub const KEEPALIVE_TIMEOUTS_TOTAL: &str = "relay_keepalive_timeouts_total";
