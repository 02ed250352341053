//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the text exposition format. Call once at
/// startup before any connection is accepted.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Connections registered with the manager (counter).
pub const FEED_CONNECTIONS_TOTAL: &str = "feed_connections_total";
/// Connections removed from the manager (counter).
pub const FEED_DISCONNECTIONS_TOTAL: &str = "feed_disconnections_total";
/// Currently registered connections (gauge).
pub const FEED_CONNECTIONS_ACTIVE: &str = "feed_connections_active";
/// Clients dropped because their outbound queue was full (counter).
pub const FEED_SLOW_CLIENT_DISCONNECTS_TOTAL: &str = "feed_slow_client_disconnects_total";
/// Raw write failures in the flush task (counter).
pub const FEED_WRITE_ERRORS_TOTAL: &str = "feed_write_errors_total";
/// Delay queue length observed after each push (histogram).
pub const FEED_DELAY_QUEUE_DEPTH: &str = "feed_delay_queue_depth";
/// Messages handed to the broadcast fan-out (counter).
pub const FEED_MESSAGES_BROADCAST_TOTAL: &str = "feed_messages_broadcast_total";
/// Keepalive pings that failed to write (counter).
pub const FEED_PING_FAILURES_TOTAL: &str = "feed_ping_failures_total";
