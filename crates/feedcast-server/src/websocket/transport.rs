//! Byte-stream abstraction a connection is built over.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// An upgraded, bidirectional stream to one client.
///
/// Reads and writes share buffering state in real transports, so a
/// connection never drives both halves concurrently.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Remote socket address, if the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Transport for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

impl Transport for DuplexStream {}
