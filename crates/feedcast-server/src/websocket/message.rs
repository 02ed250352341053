//! Outbound message encoding.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::deflate::compress_message;
use super::frame::{Data, data_frame, encode_frame};
use crate::errors::ConnectionError;

/// Position in the feed, ordered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageIndex(pub u64);

impl fmt::Display for MessageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for MessageIndex {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Serialize `msg` as JSON and frame it as one text frame, deflated when
/// `compressed` is set.
pub fn serialize_message<T>(msg: &T, compressed: bool) -> Result<Bytes, ConnectionError>
where
    T: Serialize + ?Sized,
{
    let json = serde_json::to_vec(msg).map_err(|e| ConnectionError::Serialization(e.to_string()))?;
    let frame = if compressed {
        let deflated =
            compress_message(&json).map_err(|e| ConnectionError::Serialization(e.to_string()))?;
        data_frame(Data::Text, deflated, true)
    } else {
        data_frame(Data::Text, json, false)
    };
    let encoded = encode_frame(frame).map_err(|e| ConnectionError::Serialization(e.to_string()))?;
    Ok(Bytes::from(encoded))
}

/// A message serialized once in each encoding a fan-out needs.
#[derive(Clone, Debug, Default)]
pub struct PreparedMessage {
    plain: Option<Bytes>,
    compressed: Option<Bytes>,
}

impl PreparedMessage {
    /// Encode `msg` in the requested encodings.
    pub fn new<T>(msg: &T, plain: bool, compressed: bool) -> Result<Self, ConnectionError>
    where
        T: Serialize + ?Sized,
    {
        Ok(Self {
            plain: plain.then(|| serialize_message(msg, false)).transpose()?,
            compressed: compressed.then(|| serialize_message(msg, true)).transpose()?,
        })
    }

    /// Frame bytes for a connection with the given compression mode.
    pub fn encoding(&self, compressed: bool) -> Option<&Bytes> {
        if compressed {
            self.compressed.as_ref()
        } else {
            self.plain.as_ref()
        }
    }
}
