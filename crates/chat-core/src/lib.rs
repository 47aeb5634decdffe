//! # chat-core
//!
//! Shared library for the secure chat transport: the envelope codec, the
//! session cipher, the encryption stage and the key exchange payloads.
//!
//! This crate is used by both the client and the server.  It performs no
//! socket I/O of its own.
//!
//! # Architecture overview (for beginners)
//!
//! The client and server talk over a single TCP connection.  Every message is
//! an [`Envelope`]: a typed, framed blob of bytes with an ID that lets a reply
//! be matched to its request.
//!
//! - **`protocol`** – How bytes travel over the network.  Envelopes are
//!   encoded into a 36-byte header, the payload and a CRC-32 trailer, and
//!   decoded back (even when TCP splits or merges them) by the
//!   [`FrameDecoder`].
//!
//! - **`crypto`** – Thin wrappers over AES-256-GCM and RSA-OAEP.
//!
//! - **`pipeline`** – The [`EncryptionStage`] that seals outbound payloads and
//!   opens inbound ones once a session key exists.
//!
//! - **`handshake`** – The four-message key exchange that creates that session
//!   key, including the server-side [`KeyExchangeResponder`].

pub mod crypto;
pub mod handshake;
pub mod pipeline;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `chat_core::Envelope` instead of `chat_core::protocol::messages::Envelope`.
pub use crypto::{CryptoError, ServerKeyPair, ServerPublicKey, SessionKey};
pub use handshake::KeyExchangeResponder;
pub use pipeline::{EncryptionStage, PipelineError, SessionKeyStore};
pub use protocol::codec::{decode_envelope, encode_envelope, ProtocolError};
pub use protocol::frame::FrameDecoder;
pub use protocol::messages::{
    Direction, Envelope, InboundMessage, MessageFlags, MessageId, MessageType,
};
