//! # feedcast-server
//!
//! Per-client delivery engine of the feed broadcaster.
//!
//! - [`websocket::connection::ClientConnection`]: bounded outbound channel,
//!   decaying artificial delay, paced flush, serialized transport access
//! - [`websocket::delay_queue`]: FIFO of frames tagged with their delay
//! - [`websocket::frame`] / [`websocket::deflate`]: RFC 6455 framing and
//!   permessage-deflate
//! - [`websocket::broadcast::BroadcastManager`]: in-process registry and fan-out
//! - [`lifecycle::TaskGroup`]: cancellable background tasks per connection

#![deny(unsafe_code)]

pub mod errors;
pub mod lifecycle;
pub mod metrics;
pub mod websocket;

pub use errors::{ConnectionError, FrameError};
