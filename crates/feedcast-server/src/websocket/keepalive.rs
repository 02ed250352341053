//! Keepalive pings and liveness timeout.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::ClientConnection;
use super::frame::{Control, OpCode};
use crate::errors::ConnectionError;
use crate::metrics::FEED_PING_FAILURES_TOTAL;

/// Why the keepalive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepaliveResult {
    /// Nothing was read from the client within the timeout.
    TimedOut,
    /// Writing the ping frame failed.
    PingFailed,
    /// The client sent a close frame.
    ClientClosed,
    /// Reading from the client failed or hit EOF.
    ReadFailed,
    /// The loop was cancelled or the connection closed.
    Cancelled,
}

/// Ping `connection` every `interval` until it fails, times out or is
/// cancelled.
///
/// Each tick first consumes whatever the client has already sent, so pong
/// replies refresh the heartbeat, then compares the heartbeat against
/// `client_timeout`; `None` disables that check.
pub async fn run_keepalive(
    connection: Arc<ClientConnection>,
    interval: Duration,
    client_timeout: Option<Duration>,
    cancel: CancellationToken,
) -> KeepaliveResult {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let read_timeout = client_timeout.unwrap_or(interval);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return KeepaliveResult::Cancelled,
            () = connection.closed() => return KeepaliveResult::Cancelled,
            _ = ticker.tick() => {}
        }

        match drain_inbound(&connection, read_timeout).await {
            Ok(false) => {}
            Ok(true) => {
                debug!(client = %connection.name(), "client sent close");
                return KeepaliveResult::ClientClosed;
            }
            Err(e) if e.is_closed() => return KeepaliveResult::Cancelled,
            Err(e) => {
                debug!(client = %connection.name(), error = %e, "error reading from client");
                return KeepaliveResult::ReadFailed;
            }
        }

        if let Some(timeout) = client_timeout {
            let silent = connection.last_heard_elapsed();
            if silent > timeout {
                debug!(client = %connection.name(), ?silent, "client timed out");
                return KeepaliveResult::TimedOut;
            }
        }

        if let Err(e) = connection.ping().await {
            if e.is_closed() {
                return KeepaliveResult::Cancelled;
            }
            warn!(client = %connection.name(), error = %e, "error pinging client");
            counter!(FEED_PING_FAILURES_TOTAL).increment(1);
            return KeepaliveResult::PingFailed;
        }
    }
}

/// Read every message that has already arrived. Returns `true` once the
/// client sends a close frame.
async fn drain_inbound(
    connection: &ClientConnection,
    timeout: Duration,
) -> Result<bool, ConnectionError> {
    while let Some(msg) = connection.receive_pending(Duration::ZERO, timeout).await? {
        match msg.opcode {
            OpCode::Control(Control::Close) => return Ok(true),
            OpCode::Data(_) => {
                let len = msg.data.len();
                debug!(client = %connection.name(), len, "ignoring client message");
            }
            OpCode::Control(_) => {}
        }
    }
    Ok(false)
}
