//! Seam between a connection and the registry that owns it.

use std::sync::Arc;

use async_trait::async_trait;
use feedcast_settings::BroadcasterSettings;

use super::connection::ClientConnection;

/// Registry of live connections.
///
/// A connection reads [`settings`](Self::settings) once when it is created
/// and calls [`remove`](Self::remove) when its outbound pipeline fails.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Delivery settings applied to every connection.
    fn settings(&self) -> &BroadcasterSettings;

    /// Unregister and stop `connection`. Must tolerate repeated calls.
    async fn remove(&self, connection: &Arc<ClientConnection>);
}
