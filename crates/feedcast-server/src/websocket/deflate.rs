//! permessage-deflate (RFC 7692) payload transforms.
//!
//! Messages are raw deflate streams flushed with a sync flush; the trailing
//! `00 00 ff ff` marker is stripped on the wire and re-appended before
//! inflating. The inbound [`FlateReader`] keeps its sliding window across
//! messages (context takeover). Outbound messages are compressed
//! independently by [`compress_message`] (no context takeover), so one
//! encoding can be shared by every subscriber.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::errors::FrameError;

const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const CHUNK: usize = 4096;

/// Inflater for one client's inbound messages.
pub struct FlateReader {
    inner: Decompress,
}

impl FlateReader {
    /// Fresh raw-deflate context.
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(false),
        }
    }

    /// Inflate one message payload, failing once output would exceed `limit`.
    pub fn decompress(&mut self, payload: &[u8], limit: usize) -> Result<Vec<u8>, FrameError> {
        let mut input = Vec::with_capacity(payload.len() + DEFLATE_TAIL.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TAIL);

        let mut out = Vec::with_capacity(payload.len().saturating_mul(2).max(CHUNK));
        let mut consumed = 0usize;
        loop {
            if out.len() == out.capacity() {
                out.reserve(CHUNK);
            }
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();
            let status = self
                .inner
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| FrameError::Deflate(e.to_string()))?;
            let read = (self.inner.total_in() - before_in) as usize;
            let written = self.inner.total_out() - before_out;
            consumed += read;

            if out.len() > limit {
                return Err(FrameError::MessageTooLarge {
                    size: out.len() as u64,
                    limit,
                });
            }
            if status == Status::StreamEnd {
                self.inner.reset(false);
                break;
            }
            if consumed >= input.len() && out.len() < out.capacity() {
                break;
            }
            if read == 0 && written == 0 && out.len() < out.capacity() {
                return Err(FrameError::Deflate("inflate made no progress".into()));
            }
        }
        Ok(out)
    }
}

impl Default for FlateReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Deflater for one outbound stream.
pub struct FlateWriter {
    inner: Compress,
}

impl FlateWriter {
    /// Fresh raw-deflate context at the default level.
    pub fn new() -> Self {
        Self {
            inner: Compress::new(Compression::default(), false),
        }
    }

    /// Deflate one message payload with the sync marker removed.
    pub fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(payload.len() / 2 + 64);
        let mut consumed = 0usize;
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(CHUNK);
            }
            let before_in = self.inner.total_in();
            let _ = self
                .inner
                .compress_vec(&payload[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| FrameError::Deflate(e.to_string()))?;
            consumed += (self.inner.total_in() - before_in) as usize;

            // A sync flush is complete once input is drained and the encoder
            // stopped short of filling the buffer.
            if consumed >= payload.len() && out.len() < out.capacity() {
                break;
            }
        }
        if out.ends_with(&DEFLATE_TAIL) {
            out.truncate(out.len() - DEFLATE_TAIL.len());
        }
        Ok(out)
    }
}

impl Default for FlateWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Deflate a standalone message with a fresh context.
///
/// Broadcast payloads are shared between clients, so they cannot depend on
/// any one client's window.
pub fn compress_message(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    FlateWriter::new().compress(payload)
}
