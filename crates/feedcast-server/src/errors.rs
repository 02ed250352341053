//! Error types for the delivery pipeline.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failures decoding or encoding WebSocket frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The transport failed or hit EOF mid-frame.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// The peer violated RFC 6455 or the negotiated extensions.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A frame or reassembled message exceeded the configured limit.
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge {
        /// Size seen so far.
        size: u64,
        /// Configured maximum.
        limit: usize,
    },
    /// The deflate stream was corrupt.
    #[error("deflate error: {0}")]
    Deflate(String),
    /// The frame codec rejected a header or failed to format a frame.
    #[error("frame codec error: {0}")]
    Codec(#[from] tungstenite::Error),
}

/// Failures surfaced by a client connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The message could not be encoded; nothing was enqueued.
    #[error("failed to serialize message: {0}")]
    Serialization(String),
    /// Decoding an inbound message failed. The transport has been closed.
    #[error("failed to read from client: {0}")]
    Read(#[from] FrameError),
    /// No complete message arrived before the deadline. The transport has
    /// been closed.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    /// Raw write of a queued frame failed.
    #[error("failed to write to client: {0}")]
    Write(#[source] io::Error),
    /// Writing the ping control frame failed.
    #[error("failed to ping client: {0}")]
    Ping(#[source] io::Error),
    /// The connection has been stopped.
    #[error("connection closed")]
    Closed,
    /// The outbound channel is at capacity.
    #[error("outbound queue full")]
    QueueFull,
    /// `start` was called more than once.
    #[error("connection already started")]
    AlreadyStarted,
    /// Construction parameters were rejected.
    #[error("invalid connection config: {0}")]
    InvalidConfig(String),
}

impl ConnectionError {
    /// Whether the error reflects the connection being torn down rather than
    /// a fault of its own.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
