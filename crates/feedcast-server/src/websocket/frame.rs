//! Client frame policy over the tungstenite frame codec.
//!
//! Header layout and masking come from `tungstenite::protocol::frame`. This
//! module adds what the server enforces on top: client frames must be
//! masked, payloads are bounded, data frames are reassembled into whole
//! messages and inflated when the first frame carries RSV1.

use std::io::Cursor;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
pub use tungstenite::protocol::frame::coding::{Control, Data, OpCode};
pub use tungstenite::protocol::frame::{Frame, FrameHeader};

use super::deflate::FlateReader;
use crate::errors::FrameError;

/// Pre-built unmasked ping frame with an empty payload.
pub const COMPILED_PING: [u8; 2] = [0x89, 0x00];

/// Two fixed bytes, eight of extended length, four of mask.
const MAX_HEADER_LEN: usize = 14;
const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Final, unmasked data frame as the server sends it.
pub fn data_frame(data: Data, payload: impl Into<Bytes>, compressed: bool) -> Frame {
    let mut frame = Frame::message(payload, OpCode::Data(data), true);
    frame.header_mut().rsv1 = compressed;
    frame
}

/// Serialize `frame`, applying its mask if the header carries one.
pub fn encode_frame(frame: Frame) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(frame.len());
    frame.format(&mut out)?;
    Ok(out)
}

/// A complete inbound message or control frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingMessage {
    /// `Text`/`Binary` for data messages, or the control opcode.
    pub opcode: OpCode,
    /// Reassembled and, if applicable, inflated payload.
    pub data: Vec<u8>,
}

/// Read one frame, without masking policy.
///
/// Reads exactly the bytes of the frame so nothing past it is consumed. The
/// returned payload is unmasked; the header keeps the key the peer used.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; MAX_HEADER_LEN];
    let _ = reader.read_exact(&mut head[..2]).await?;
    let extended = match head[1] & 0x7F {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let mask = if head[1] & 0x80 == 0 { 0 } else { 4 };
    let head_len = 2 + extended + mask;
    let _ = reader.read_exact(&mut head[2..head_len]).await?;

    let Some((header, len)) = FrameHeader::parse(&mut Cursor::new(&head[..head_len]))? else {
        return Err(FrameError::Protocol("incomplete frame header".into()));
    };

    if header.rsv2 || header.rsv3 {
        return Err(FrameError::Protocol("reserved bits RSV2/RSV3 set".into()));
    }
    if len >> 63 != 0 {
        return Err(FrameError::Protocol("payload length has MSB set".into()));
    }
    if let OpCode::Control(_) = header.opcode {
        if !header.is_final {
            return Err(FrameError::Protocol("fragmented control frame".into()));
        }
        if len > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::Protocol(format!(
                "control frame payload of {len} bytes"
            )));
        }
    }
    if len > max_payload as u64 {
        return Err(FrameError::MessageTooLarge {
            size: len,
            limit: max_payload,
        });
    }

    let mut payload = vec![0u8; len as usize];
    let _ = reader.read_exact(&mut payload).await?;
    if let Some(key) = header.mask {
        for (byte, k) in payload.iter_mut().zip(key.iter().cycle()) {
            *byte ^= k;
        }
    }
    Ok(Frame::from_payload(header, Bytes::from(payload)))
}

/// Read one client message from `reader`.
///
/// Control frames are returned immediately unless they arrive between the
/// fragments of a data message, in which case pings and pongs are skipped and
/// a close frame is returned. `flate` is `Some` only when compression was
/// negotiated; its window carries over to the next call.
pub async fn read_message<R>(
    reader: &mut R,
    max_message_size: usize,
    mut flate: Option<&mut FlateReader>,
) -> Result<IncomingMessage, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut pending: Option<(Data, bool)> = None;
    let mut data = Vec::new();

    loop {
        let frame = read_frame(reader, max_message_size).await?;
        let header = frame.header();
        if header.mask.is_none() {
            return Err(FrameError::Protocol("client frame is not masked".into()));
        }
        let (is_final, rsv1, opcode) = (header.is_final, header.rsv1, header.opcode);

        let kind = match opcode {
            OpCode::Control(control) => {
                if rsv1 {
                    return Err(FrameError::Protocol("compressed control frame".into()));
                }
                if pending.is_some() && control != Control::Close {
                    continue;
                }
                return Ok(IncomingMessage {
                    opcode: OpCode::Control(control),
                    data: frame.into_payload().to_vec(),
                });
            }
            OpCode::Data(kind) => kind,
        };

        match (kind, pending) {
            (Data::Continue, None) => {
                return Err(FrameError::Protocol(
                    "continuation frame without a message".into(),
                ));
            }
            (Data::Continue, Some(_)) => {
                if rsv1 {
                    return Err(FrameError::Protocol("RSV1 set on continuation".into()));
                }
            }
            (_, Some(_)) => {
                return Err(FrameError::Protocol(
                    "new data frame inside fragmented message".into(),
                ));
            }
            (kind, None) => pending = Some((kind, rsv1)),
        }

        let size = data.len() + frame.payload().len();
        if size > max_message_size {
            return Err(FrameError::MessageTooLarge {
                size: size as u64,
                limit: max_message_size,
            });
        }
        data.extend_from_slice(frame.payload());

        if !is_final {
            continue;
        }

        let Some((kind, compressed)) = pending else {
            continue;
        };
        if compressed {
            let Some(inflater) = flate.as_deref_mut() else {
                return Err(FrameError::Protocol(
                    "compressed frame without negotiated compression".into(),
                ));
            };
            data = inflater.decompress(&data, max_message_size)?;
        }
        if kind == Data::Text && std::str::from_utf8(&data).is_err() {
            return Err(FrameError::Protocol("text message is not UTF-8".into()));
        }
        return Ok(IncomingMessage {
            opcode: OpCode::Data(kind),
            data,
        });
    }
}
