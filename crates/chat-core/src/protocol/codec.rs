//! Binary codec for encoding and decoding chat transport envelopes.
//!
//! Wire format:
//! ```text
//! [magic:4][type:2][version:1][flags:1][message_id:16][payload_len:4][timestamp_ms:8][payload:N][crc32:4]
//! ```
//! Total header size: 36 bytes. All multi-byte integers are big-endian.  The
//! CRC-32 (IEEE) trailer covers the payload bytes only.

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::messages::{
    Envelope, MessageFlags, MessageType, CHECKSUM_SIZE, HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE,
    PROTOCOL_VERSION,
};

/// Errors that can occur during envelope encoding or decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not enough bytes buffered yet for a complete frame.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The first four bytes are not [`MAGIC`]; the stream cannot be trusted.
    #[error("bad frame magic: {found:02X?}")]
    BadMagic { found: [u8; 4] },

    /// The declared payload length is above [`MAX_PAYLOAD_SIZE`].
    #[error("frame too large: declared payload of {declared} bytes exceeds {max}")]
    FrameTooLarge { declared: usize, max: usize },

    /// The payload handed to the encoder is above [`MAX_PAYLOAD_SIZE`].
    #[error("payload too large to encode: {len} bytes exceeds {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// The payload does not match its CRC-32 trailer.
    #[error("checksum mismatch: trailer 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        expected: u32,
        computed: u32,
        frame_len: usize,
    },

    /// The message type code is not recognised.
    #[error("unknown message type: 0x{code:04X}")]
    UnknownMessageType { code: u16, frame_len: usize },

    /// The protocol version in the header is not supported.
    #[error("unsupported protocol version: {version}")]
    UnsupportedVersion { version: u8, frame_len: usize },
}

impl ProtocolError {
    /// Number of bytes to discard to reach the next frame, when the rejected
    /// frame's boundaries are known.
    ///
    /// Returns `None` for errors after which the stream position cannot be
    /// trusted (bad magic, oversized length) and for `InsufficientData`.
    pub fn skip_len(&self) -> Option<usize> {
        match self {
            ProtocolError::ChecksumMismatch { frame_len, .. }
            | ProtocolError::UnknownMessageType { frame_len, .. }
            | ProtocolError::UnsupportedVersion { frame_len, .. } => Some(*frame_len),
            _ => None,
        }
    }

    /// `true` when only the offending frame is rejected and the connection can
    /// keep going.
    pub fn is_recoverable(&self) -> bool {
        self.skip_len().is_some()
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes an [`Envelope`] into a complete frame (header + payload + CRC).
///
/// Encoding is pure: the envelope is not modified and the message ID is
/// written exactly as supplied.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD_SIZE`].
///
/// # Examples
///
/// ```rust
/// use chat_core::protocol::{decode_envelope, encode_envelope, Envelope, MessageType};
///
/// let env = Envelope::new(MessageType::ChatListRequest, b"page=1".to_vec());
/// let bytes = encode_envelope(&env).unwrap();
/// let (decoded, consumed) = decode_envelope(&bytes).unwrap();
/// assert_eq!(decoded, env);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_envelope(env: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    if env.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            len: env.payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let payload_len = env.payload.len() as u32;

    let mut buf = Vec::with_capacity(env.frame_len());
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&(env.message_type as u16).to_be_bytes());
    buf.push(env.version);
    buf.push(env.flags.0);
    buf.extend_from_slice(env.message_id.as_bytes());
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(&env.timestamp_ms.to_be_bytes());
    buf.extend_from_slice(&env.payload);
    buf.extend_from_slice(&crc32fast::hash(&env.payload).to_be_bytes());
    Ok(buf)
}

/// Decodes one [`Envelope`] from the beginning of `bytes`.
///
/// Returns the envelope and the number of bytes consumed so the caller can
/// advance its read cursor.
///
/// # Errors
///
/// - [`ProtocolError::InsufficientData`] – wait for more bytes.
/// - [`ProtocolError::BadMagic`] / [`ProtocolError::FrameTooLarge`] – the
///   stream is corrupt and the connection should be closed.
/// - [`ProtocolError::ChecksumMismatch`] and friends – only this frame is
///   bad; [`ProtocolError::skip_len`] says how far to skip.
pub fn decode_envelope(bytes: &[u8]) -> Result<(Envelope, usize), ProtocolError> {
    // Check the magic as soon as it is available so garbage is rejected
    // without waiting for a full header.
    if bytes.len() >= MAGIC.len() && bytes[..4] != MAGIC {
        return Err(ProtocolError::BadMagic {
            found: [bytes[0], bytes[1], bytes[2], bytes[3]],
        });
    }
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let type_code = u16::from_be_bytes([bytes[4], bytes[5]]);
    let version = bytes[6];
    let flags = MessageFlags(bytes[7]);
    let message_id = read_uuid(bytes, 8);
    let payload_len = u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]) as usize;
    let timestamp_ms = read_u64(bytes, 28);

    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            declared: payload_len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let frame_len = HEADER_SIZE + payload_len + CHECKSUM_SIZE;
    if bytes.len() < frame_len {
        return Err(ProtocolError::InsufficientData {
            needed: frame_len,
            available: bytes.len(),
        });
    }

    let payload = &bytes[HEADER_SIZE..HEADER_SIZE + payload_len];
    let trailer = &bytes[HEADER_SIZE + payload_len..frame_len];
    let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = crc32fast::hash(payload);
    if expected != computed {
        return Err(ProtocolError::ChecksumMismatch {
            expected,
            computed,
            frame_len,
        });
    }

    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion { version, frame_len });
    }
    let message_type = MessageType::try_from(type_code).map_err(|_| {
        ProtocolError::UnknownMessageType {
            code: type_code,
            frame_len,
        }
    })?;

    let env = Envelope {
        message_type,
        version,
        flags,
        message_id,
        timestamp_ms,
        payload: payload.to_vec(),
    };
    Ok((env, frame_len))
}

// ── Utility helpers ───────────────────────────────────────────────────────────

// Callers guarantee `buf` holds at least a full header.
fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(raw)
}

fn read_uuid(buf: &[u8], offset: usize) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&buf[offset..offset + 16]);
    Uuid::from_bytes(raw)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
