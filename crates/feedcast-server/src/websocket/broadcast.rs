//! Feed fan-out to connected subscribers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use feedcast_settings::BroadcasterSettings;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::ClientConnection;
use super::keepalive::{KeepaliveResult, run_keepalive};
use super::manager::ConnectionManager;
use super::message::{MessageIndex, PreparedMessage};
use super::transport::Transport;
use crate::errors::ConnectionError;
use crate::metrics::{
    FEED_CONNECTIONS_ACTIVE, FEED_CONNECTIONS_TOTAL, FEED_DISCONNECTIONS_TOTAL,
    FEED_MESSAGES_BROADCAST_TOTAL, FEED_SLOW_CLIENT_DISCONNECTS_TOTAL,
};

/// Registry of subscribers that sends every feed message to all of them.
pub struct BroadcastManager {
    settings: BroadcasterSettings,
    /// Connected clients indexed by connection id.
    connections: RwLock<HashMap<u64, Arc<ClientConnection>>>,
    active_count: AtomicUsize,
    shutdown: CancellationToken,
}

impl BroadcastManager {
    /// Create a manager whose connections stop when `shutdown` is cancelled.
    pub fn new(settings: BroadcasterSettings, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            settings,
            connections: RwLock::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
            shutdown,
        })
    }

    /// Wrap an upgraded transport in a connection using the configured delay
    /// and register it.
    pub async fn accept<T: Transport>(
        self: &Arc<Self>,
        transport: T,
        requested_seq_num: MessageIndex,
        connecting_ip: IpAddr,
        compression: bool,
    ) -> Result<Arc<ClientConnection>, ConnectionError> {
        let connection = ClientConnection::new(
            transport,
            self,
            requested_seq_num,
            connecting_ip,
            compression,
            self.settings.client_delay(),
            self.settings.client_delay_decay_rate,
        )?;
        self.add(Arc::clone(&connection)).await?;
        Ok(connection)
    }

    /// Start `connection`'s pipeline and keepalive and register it.
    pub async fn add(self: &Arc<Self>, connection: Arc<ClientConnection>) -> Result<(), ConnectionError> {
        if self.shutdown.is_cancelled() {
            connection.stop_only().await;
            return Err(ConnectionError::Closed);
        }
        connection.start(&self.shutdown)?;

        let _ = self
            .connections
            .write()
            .await
            .insert(connection.id(), Arc::clone(&connection));
        let active = self.active_count.fetch_add(1, Ordering::Relaxed) + 1;
        counter!(FEED_CONNECTIONS_TOTAL).increment(1);
        gauge!(FEED_CONNECTIONS_ACTIVE).set(active as f64);
        info!(
            client = %connection.name(),
            seq = %connection.requested_seq_num(),
            compression = connection.compression(),
            active,
            "client connected"
        );

        let manager = Arc::downgrade(self);
        let interval = self.settings.ping_interval();
        let timeout = self.settings.client_timeout();
        let cancel = self.shutdown.child_token();
        drop(tokio::spawn(async move {
            let result = run_keepalive(Arc::clone(&connection), interval, timeout, cancel).await;
            if result == KeepaliveResult::Cancelled {
                return;
            }
            debug!(client = %connection.name(), ?result, "keepalive ended");
            if let Some(manager) = manager.upgrade() {
                manager.remove(&connection).await;
            }
        }));
        Ok(())
    }

    /// Send `msg` to every connection. Returns how many accepted it.
    ///
    /// The message is serialized once per encoding in use. A client whose
    /// outbound queue is full is disconnected as too slow.
    pub async fn broadcast<T>(&self, msg: &T) -> usize
    where
        T: Serialize + ?Sized,
    {
        let conns: Vec<Arc<ClientConnection>> =
            self.connections.read().await.values().cloned().collect();
        if conns.is_empty() {
            return 0;
        }

        let plain = conns.iter().any(|c| !c.compression());
        let compressed = conns.iter().any(|c| c.compression());
        let prepared = match PreparedMessage::new(msg, plain, compressed) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast message");
                return 0;
            }
        };
        counter!(FEED_MESSAGES_BROADCAST_TOTAL).increment(1);

        let mut delivered = 0;
        let mut too_slow = Vec::new();
        for conn in conns {
            match conn.try_write_prepared(&prepared) {
                Ok(()) => delivered += 1,
                Err(ConnectionError::QueueFull) => {
                    warn!(client = %conn.name(), "client too slow, disconnecting");
                    counter!(FEED_SLOW_CLIENT_DISCONNECTS_TOTAL).increment(1);
                    too_slow.push(conn);
                }
                Err(e) => debug!(client = %conn.name(), error = %e, "skipping client"),
            }
        }
        for conn in &too_slow {
            self.remove(conn).await;
        }
        delivered
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Snapshot of registered connections.
    pub async fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Stop every connection and wait for their tasks, each bounded by
    /// `timeout`. Returns `false` if any connection failed to stop in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        let drained: Vec<Arc<ClientConnection>> =
            self.connections.write().await.drain().map(|(_, c)| c).collect();
        self.active_count.store(0, Ordering::Relaxed);
        gauge!(FEED_CONNECTIONS_ACTIVE).set(0.0);
        info!(count = drained.len(), "stopping all clients");

        let results =
            futures::future::join_all(drained.iter().map(|c| c.stop_and_wait(timeout))).await;
        results.into_iter().all(|stopped| stopped)
    }
}

#[async_trait]
impl ConnectionManager for BroadcastManager {
    fn settings(&self) -> &BroadcasterSettings {
        &self.settings
    }

    async fn remove(&self, connection: &Arc<ClientConnection>) {
        let removed = self
            .connections
            .write()
            .await
            .remove(&connection.id())
            .is_some();
        if removed {
            let active = self.active_count.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
            counter!(FEED_DISCONNECTIONS_TOTAL).increment(1);
            gauge!(FEED_CONNECTIONS_ACTIVE).set(active as f64);
            info!(
                client = %connection.name(),
                age = ?connection.age(),
                active,
                "client disconnected"
            );
        }
        connection.stop_only().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::deflate::FlateReader;
    use crate::websocket::frame::{COMPILED_PING, Control, Data, OpCode, read_frame};
    use crate::websocket::test_support::{LOCALHOST, client_frame};
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn manager(settings: BroadcasterSettings) -> Arc<BroadcastManager> {
        BroadcastManager::new(settings, CancellationToken::new())
    }

    async fn accept(
        bm: &Arc<BroadcastManager>,
        compression: bool,
    ) -> (Arc<ClientConnection>, DuplexStream) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let conn = bm
            .accept(server, MessageIndex(1), LOCALHOST, compression)
            .await
            .unwrap();
        (conn, client)
    }

    async fn read_payload(client: &mut DuplexStream) -> Vec<u8> {
        let frame = read_frame(client, 1 << 20).await.unwrap();
        assert_eq!(frame.header().opcode, OpCode::Data(Data::Text));
        if frame.header().rsv1 {
            FlateReader::new().decompress(frame.payload(), 1 << 20).unwrap()
        } else {
            frame.payload().to_vec()
        }
    }

    #[tokio::test]
    async fn accept_registers_connection() {
        let bm = manager(BroadcasterSettings::default());
        let (conn, _client) = accept(&bm, false).await;
        assert_eq!(bm.connection_count().await, 1);
        assert_eq!(bm.connections().await[0].id(), conn.id());
        assert_eq!(conn.requested_seq_num(), MessageIndex(1));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client_in_its_encoding() {
        let bm = manager(BroadcasterSettings::default());
        let (_plain, mut plain_client) = accept(&bm, false).await;
        let (_deflated, mut deflated_client) = accept(&bm, true).await;

        let msg = serde_json::json!({"sequenceNumber": 1, "message": "abc"});
        assert_eq!(bm.broadcast(&msg).await, 2);

        let expected = serde_json::to_vec(&msg).unwrap();
        assert_eq!(read_payload(&mut plain_client).await, expected);
        assert_eq!(read_payload(&mut deflated_client).await, expected);
    }

    #[tokio::test]
    async fn broadcast_to_empty_manager() {
        let bm = manager(BroadcasterSettings::default());
        assert_eq!(bm.broadcast("nobody").await, 0);
    }

    #[tokio::test]
    async fn slow_client_disconnected() {
        let bm = manager(BroadcasterSettings {
            max_send_queue: 2,
            ..BroadcasterSettings::default()
        });
        let (conn, _client) = accept(&bm, false).await;

        // No await point yields between these, so the pipeline cannot drain.
        assert_eq!(bm.broadcast(&1).await, 1);
        assert_eq!(bm.broadcast(&2).await, 1);
        assert_eq!(bm.broadcast(&3).await, 0);

        assert_eq!(bm.connection_count().await, 0);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let bm = manager(BroadcasterSettings::default());
        let (conn, _client) = accept(&bm, false).await;
        bm.remove(&conn).await;
        bm.remove(&conn).await;
        assert_eq!(bm.connection_count().await, 0);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn write_failure_unregisters_client() {
        let bm = manager(BroadcasterSettings::default());
        let (conn, client) = accept(&bm, false).await;
        drop(client);

        let _ = bm.broadcast("lost").await;
        tokio::time::timeout(Duration::from_secs(5), conn.closed())
            .await
            .unwrap();
        assert_eq!(bm.connection_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_removed_by_keepalive() {
        let bm = manager(BroadcasterSettings {
            ping_interval_ms: 1_000,
            client_timeout_ms: 2_500,
            ..BroadcasterSettings::default()
        });
        let (conn, _client) = accept(&bm, false).await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(conn.is_closed());
        assert_eq!(bm.connection_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_answering_subscriber_stays_connected() {
        let bm = manager(BroadcasterSettings {
            ping_interval_ms: 1_000,
            client_timeout_ms: 2_500,
            ..BroadcasterSettings::default()
        });
        let (conn, mut client) = accept(&bm, false).await;

        let answering = tokio::spawn(async move {
            let pong = client_frame(OpCode::Control(Control::Pong), Bytes::new());
            let mut pongs = 0;
            let mut buf = [0u8; 2];
            while client.read_exact(&mut buf).await.is_ok() {
                assert_eq!(buf, COMPILED_PING);
                if client.write_all(&pong).await.is_err() {
                    break;
                }
                pongs += 1;
            }
            pongs
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!conn.is_closed());
        assert_eq!(bm.connection_count().await, 1);

        assert!(bm.shutdown(Duration::from_secs(1)).await);
        assert!(answering.await.unwrap() >= 9);
    }

    #[tokio::test(start_paused = true)]
    async fn client_close_frame_removes_subscriber() {
        let bm = manager(BroadcasterSettings {
            ping_interval_ms: 1_000,
            ..BroadcasterSettings::default()
        });
        let (conn, mut client) = accept(&bm, false).await;
        client
            .write_all(&client_frame(OpCode::Control(Control::Close), Bytes::new()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(conn.is_closed());
        assert_eq!(bm.connection_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_stops_every_connection() {
        let bm = manager(BroadcasterSettings::default());
        let (a, _ca) = accept(&bm, false).await;
        let (b, _cb) = accept(&bm, true).await;

        assert!(bm.shutdown(Duration::from_secs(1)).await);
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(bm.connection_count().await, 0);

        let (server, _client) = tokio::io::duplex(64);
        let err = bm
            .accept(server, MessageIndex(0), LOCALHOST, false)
            .await
            .unwrap_err();
        assert!(err.is_closed());
    }
}
