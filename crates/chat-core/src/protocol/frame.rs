//! Streaming frame decoder.
//!
//! TCP delivers a byte stream, not messages: one `read()` may return half a
//! frame or three frames at once.  [`FrameDecoder`] accumulates chunks and
//! hands out complete envelopes one at a time.
//!
//! ```text
//!  read() #1        read() #2              read() #3
//! [hdr|pay]        [load|crc][hdr|pa]     [yload|crc]
//!  └── buffered ──────┘ env 1 └──── buffered ──┘ env 2
//! ```

use tracing::warn;

use crate::protocol::codec::{decode_envelope, ProtocolError};
use crate::protocol::messages::Envelope;

/// Reassembles envelopes from arbitrarily chunked input.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
        }
    }

    /// Appends newly read bytes to the internal buffer.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extracts the next complete envelope, if one is buffered.
    ///
    /// Returns `Ok(None)` when more data is needed.  When a frame is rejected
    /// but its length is known (checksum mismatch, unknown type, unsupported
    /// version) the frame is dropped from the buffer before the error is
    /// returned, so the next call resumes at the following frame.  For
    /// non-recoverable errors the buffer is left untouched; the caller is
    /// expected to close the connection.
    ///
    /// # Errors
    ///
    /// See [`decode_envelope`].
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        match decode_envelope(&self.buf) {
            Ok((env, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(env))
            }
            Err(ProtocolError::InsufficientData { .. }) => Ok(None),
            Err(e) => {
                if let Some(skip) = e.skip_len() {
                    warn!("dropping rejected frame ({skip} bytes): {e}");
                    self.buf.drain(..skip);
                }
                Err(e)
            }
        }
    }

    /// Discards everything buffered, e.g. when the connection is reset.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
