//! Per-connection delivery settings consumed by the connection manager.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Settings applied to every subscriber connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BroadcasterSettings {
    /// Capacity of each connection's outbound channel. Writers block (or the
    /// client is dropped as too slow) once this many messages are queued.
    pub max_send_queue: usize,
    /// Artificial delay applied to the first message of a new connection.
    pub client_delay_ms: u64,
    /// Multiplier applied to the artificial delay after every message.
    pub client_delay_decay_rate: f64,
    /// Interval between keepalive pings.
    pub ping_interval_ms: u64,
    /// Close a client not heard from for this long. `0` disables the check.
    pub client_timeout_ms: u64,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
    /// Largest delay queue tolerated before the client is removed. `0` means
    /// unbounded.
    pub max_delay_queue: usize,
    /// Upper bound on waiting for connection tasks during shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for BroadcasterSettings {
    fn default() -> Self {
        Self {
            max_send_queue: 4096,
            client_delay_ms: 0,
            client_delay_decay_rate: 0.9,
            ping_interval_ms: 5_000,
            client_timeout_ms: 15_000,
            max_message_size: 1024 * 1024,
            max_delay_queue: 0,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl BroadcasterSettings {
    /// Initial artificial delay for new connections.
    pub fn client_delay(&self) -> Duration {
        Duration::from_millis(self.client_delay_ms)
    }

    /// Keepalive ping interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Liveness timeout, `None` when disabled.
    pub fn client_timeout(&self) -> Option<Duration> {
        (self.client_timeout_ms > 0).then(|| Duration::from_millis(self.client_timeout_ms))
    }

    /// Shutdown wait bound.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Reject values the delivery pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "maxSendQueue must be greater than zero".to_string(),
            ));
        }
        let rate = self.client_delay_decay_rate;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(SettingsError::InvalidValue(format!(
                "clientDelayDecayRate must be in (0, 1], got {rate}"
            )));
        }
        if self.ping_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "pingIntervalMs must be greater than zero".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(SettingsError::InvalidValue(
                "maxMessageSize must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
