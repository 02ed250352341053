//! WebSocket delivery pipeline: framing, per-client connections and fan-out.

pub mod broadcast;
pub mod connection;
pub mod deflate;
pub mod delay_queue;
pub mod frame;
pub mod keepalive;
pub mod manager;
pub mod message;
pub mod transport;

#[cfg(test)]
mod test_support;
