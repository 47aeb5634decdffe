//! The encryption stage sits between the application and the codec.
//!
//! ```text
//!  outbound:  Envelope ──► EncryptionStage::outbound ──► encode_envelope ──► socket
//!  inbound:   socket ──► FrameDecoder ──► EncryptionStage::inbound ──► Envelope
//! ```
//!
//! Handshake-family envelopes always pass through untouched.  Everything else
//! is sealed with AES-256-GCM once a session key exists.  The AEAD associated
//! data is the envelope's type code and message ID, so a sealed payload cannot
//! be replayed under a different header.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::crypto::{open, seal, CryptoError};
use crate::pipeline::key_store::SessionKeyStore;
use crate::protocol::messages::{Envelope, MessageFlags, MessageId, MessageType};

/// Errors raised while transforming an envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Outbound application traffic with no session key while encryption is
    /// required.
    #[error("session key not established; refusing to send {message_type:?} in clear")]
    SessionNotEstablished { message_type: MessageType },

    /// An inbound envelope is flagged `ENCRYPTED` but no key is installed.
    #[error("received encrypted envelope {message_id} without a session key")]
    MissingSessionKey { message_id: MessageId },

    /// Authentication of an inbound payload failed.  The session key has been
    /// cleared.
    #[error("decryption failed for envelope {message_id}: {source}")]
    DecryptionFailed {
        message_id: MessageId,
        #[source]
        source: CryptoError,
    },

    /// A clear-text application envelope arrived on an encrypted session.
    #[error("unexpected plaintext {message_type:?} on an encrypted session")]
    UnexpectedPlaintext { message_type: MessageType },

    /// Sealing an outbound payload failed.
    #[error("encryption failed: {0}")]
    Encryption(#[from] CryptoError),
}

impl PipelineError {
    /// `true` when the connection can no longer be trusted and must close.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingSessionKey { .. } | PipelineError::DecryptionFailed { .. }
        )
    }
}

/// Associated data bound into every sealed payload: `type(2) || message_id(16)`.
pub fn associated_data(env: &Envelope) -> [u8; 18] {
    let mut aad = [0u8; 18];
    aad[..2].copy_from_slice(&(env.message_type as u16).to_be_bytes());
    aad[2..].copy_from_slice(env.message_id.as_bytes());
    aad
}

/// Encrypts outbound and decrypts inbound envelopes with the session key.
#[derive(Debug, Clone)]
pub struct EncryptionStage {
    keys: Arc<SessionKeyStore>,
    require_encryption: bool,
}

impl EncryptionStage {
    /// Creates a stage reading keys from `keys`.
    ///
    /// With `require_encryption` set, application envelopes are never sent in
    /// clear and clear-text application envelopes are refused once a key is
    /// established.
    pub fn new(keys: Arc<SessionKeyStore>, require_encryption: bool) -> Self {
        Self {
            keys,
            require_encryption,
        }
    }

    pub fn keys(&self) -> &Arc<SessionKeyStore> {
        &self.keys
    }

    /// `false` for handshake types and whenever no session key is installed.
    pub fn should_encrypt(&self, env: &Envelope) -> bool {
        !env.message_type.is_handshake() && self.keys.is_established()
    }

    /// Prepares an envelope for the wire.
    ///
    /// Only `payload` and `flags` are ever changed.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::SessionNotEstablished`] for application traffic when
    ///   encryption is required and no key is installed.
    /// - [`PipelineError::Encryption`] if sealing fails.
    pub fn outbound(&self, mut env: Envelope) -> Result<Envelope, PipelineError> {
        if env.message_type.is_handshake() {
            return Ok(env);
        }
        match self.keys.session_key() {
            Some(key) => {
                let aad = associated_data(&env);
                env.payload = seal(&key, &env.payload, &aad)?;
                env.flags.set(MessageFlags::ENCRYPTED);
                Ok(env)
            }
            None if self.require_encryption => Err(PipelineError::SessionNotEstablished {
                message_type: env.message_type,
            }),
            None => Ok(env),
        }
    }

    /// Restores an envelope received from the wire.
    ///
    /// On authentication failure the session key is cleared before the error
    /// is returned, so nothing further is trusted until a new exchange.
    ///
    /// # Errors
    ///
    /// See [`PipelineError`]; use [`PipelineError::closes_connection`] to decide
    /// whether the connection survives.
    pub fn inbound(&self, mut env: Envelope) -> Result<Envelope, PipelineError> {
        if !env.flags.is_encrypted() {
            if self.require_encryption
                && !env.message_type.is_handshake()
                && self.keys.is_established()
            {
                return Err(PipelineError::UnexpectedPlaintext {
                    message_type: env.message_type,
                });
            }
            return Ok(env);
        }

        let Some(key) = self.keys.session_key() else {
            return Err(PipelineError::MissingSessionKey {
                message_id: env.message_id,
            });
        };
        let aad = associated_data(&env);
        match open(&key, &env.payload, &aad) {
            Ok(plaintext) => {
                env.payload = plaintext;
                env.flags.clear(MessageFlags::ENCRYPTED);
                Ok(env)
            }
            Err(source) => {
                self.keys.clear();
                warn!(
                    "decryption of {} failed ({source}); session key cleared",
                    env.message_id
                );
                Err(PipelineError::DecryptionFailed {
                    message_id: env.message_id,
                    source,
                })
            }
        }
    }

    /// Discards the session key.  Called whenever the stream closes.
    pub fn on_close(&self) {
        self.keys.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
