//! Shared fixtures for the websocket unit tests.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use feedcast_settings::BroadcasterSettings;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::Notify;

use super::connection::ClientConnection;
use super::frame::{Data, Frame, FrameHeader, OpCode, encode_frame};
use super::manager::ConnectionManager;
use super::message::MessageIndex;

pub(crate) const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// RFC 6455 §5.7 sample key.
pub(crate) const CLIENT_MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

/// Final, uncompressed frame masked the way a client sends it.
pub(crate) fn client_frame(opcode: OpCode, payload: impl Into<Bytes>) -> Vec<u8> {
    let header = FrameHeader {
        opcode,
        mask: Some(CLIENT_MASK),
        ..FrameHeader::default()
    };
    encode_frame(Frame::from_payload(header, payload.into())).unwrap()
}

/// Client text frame whose payload is already deflated.
pub(crate) fn compressed_client_frame(payload: impl Into<Bytes>) -> Vec<u8> {
    let header = FrameHeader {
        rsv1: true,
        opcode: OpCode::Data(Data::Text),
        mask: Some(CLIENT_MASK),
        ..FrameHeader::default()
    };
    encode_frame(Frame::from_payload(header, payload.into())).unwrap()
}

/// Records removals and stops the removed connection.
pub(crate) struct MockManager {
    pub(crate) settings: BroadcasterSettings,
    pub(crate) removed: Mutex<Vec<u64>>,
    removal: Notify,
}

impl MockManager {
    pub(crate) fn new(settings: BroadcasterSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            removed: Mutex::new(Vec::new()),
            removal: Notify::new(),
        })
    }

    pub(crate) fn with_queue(max_send_queue: usize) -> Arc<Self> {
        Self::new(BroadcasterSettings {
            max_send_queue,
            ..BroadcasterSettings::default()
        })
    }

    pub(crate) async fn wait_removed(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.removal.notified())
            .await
            .expect("client was not removed");
    }
}

#[async_trait]
impl ConnectionManager for MockManager {
    fn settings(&self) -> &BroadcasterSettings {
        &self.settings
    }

    async fn remove(&self, connection: &Arc<ClientConnection>) {
        self.removed.lock().push(connection.id());
        connection.stop_only().await;
        self.removal.notify_one();
    }
}

/// Connection over an in-memory pipe; returns the client end.
pub(crate) fn connect(
    manager: &Arc<MockManager>,
    compression: bool,
    delay: Duration,
    rate: f64,
) -> (Arc<ClientConnection>, DuplexStream) {
    let (server, client) = tokio::io::duplex(64 * 1024);
    let conn = ClientConnection::new(
        server,
        manager,
        MessageIndex(10),
        LOCALHOST,
        compression,
        delay,
        rate,
    )
    .unwrap();
    (conn, client)
}
