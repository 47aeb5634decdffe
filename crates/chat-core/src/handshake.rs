//! Key exchange payloads and the server-side responder.
//!
//! # Message sequence
//!
//! ```text
//!  client                                   server
//!    │ HandshakeRequest   (empty)             │
//!    │───────────────────────────────────────►│
//!    │ HandshakeResponse  base64(DER SPKI)    │
//!    │◄───────────────────────────────────────│
//!    │ KeyExchangeRequest base64(RSA-OAEP(k)) │
//!    │───────────────────────────────────────►│  install k
//!    │ KeyExchangeResponse "SUCCESS"          │
//!    │◄───────────────────────────────────────│
//! ```
//!
//! All four envelopes travel in clear.  A failed exchange is answered with
//! `"ERROR: <reason>"` instead of the success marker.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::{debug, info, warn};

use crate::crypto::{CryptoError, ServerKeyPair, ServerPublicKey, SessionKey};
use crate::pipeline::SessionKeyStore;
use crate::protocol::messages::{Envelope, MessageType};

/// Payload of a successful `KeyExchangeResponse`.
pub const KEY_EXCHANGE_SUCCESS: &[u8] = b"SUCCESS";

/// Prefix of a failed `KeyExchangeResponse`.
pub const KEY_EXCHANGE_ERROR_PREFIX: &str = "ERROR: ";

// ── Payload helpers ───────────────────────────────────────────────────────────

/// Builds the `HandshakeResponse` payload for `key`.
///
/// # Errors
///
/// Returns [`CryptoError::Encoding`] if the key cannot be DER-encoded.
pub fn encode_public_key(key: &ServerPublicKey) -> Result<Vec<u8>, CryptoError> {
    key.to_base64().map(String::into_bytes)
}

/// Parses a `HandshakeResponse` payload.
///
/// # Errors
///
/// Returns [`CryptoError::Encoding`] unless the payload is base64 DER SPKI.
pub fn decode_public_key(payload: &[u8]) -> Result<ServerPublicKey, CryptoError> {
    let text = std::str::from_utf8(payload).map_err(|e| CryptoError::Encoding(e.to_string()))?;
    ServerPublicKey::from_base64(text)
}

/// Wraps `key` under the server's public key, producing a
/// `KeyExchangeRequest` payload.
///
/// # Errors
///
/// Returns [`CryptoError::Rsa`] if RSA encryption fails.
pub fn wrap_session_key(
    server_key: &ServerPublicKey,
    key: &SessionKey,
) -> Result<Vec<u8>, CryptoError> {
    let ciphertext = server_key.encrypt(key.as_bytes())?;
    Ok(BASE64.encode(ciphertext).into_bytes())
}

/// Reverses [`wrap_session_key`] on the server.
///
/// # Errors
///
/// - [`CryptoError::Encoding`] for a payload that is not base64.
/// - [`CryptoError::Rsa`] if the ciphertext does not decrypt.
/// - [`CryptoError::InvalidKeyLength`] if the result is not 32 bytes.
pub fn unwrap_session_key(keypair: &ServerKeyPair, payload: &[u8]) -> Result<SessionKey, CryptoError> {
    let text = std::str::from_utf8(payload).map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let ciphertext = BASE64
        .decode(text.trim())
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let raw = keypair.decrypt(&ciphertext)?;
    SessionKey::from_slice(&raw)
}

/// Interprets a `KeyExchangeResponse` payload.
///
/// Returns `Ok(())` for the success marker, otherwise the peer's reason with
/// the `ERROR: ` prefix stripped.
pub fn parse_exchange_result(payload: &[u8]) -> Result<(), String> {
    if payload == KEY_EXCHANGE_SUCCESS {
        return Ok(());
    }
    let text = String::from_utf8_lossy(payload);
    let reason = text.strip_prefix(KEY_EXCHANGE_ERROR_PREFIX).unwrap_or(&text);
    Err(reason.to_owned())
}

// ── Responder ─────────────────────────────────────────────────────────────────

/// Answers the two handshake request types on behalf of a server.
///
/// One responder is shared by every connection; each connection passes its
/// own [`SessionKeyStore`].
#[derive(Debug, Clone)]
pub struct KeyExchangeResponder {
    keypair: Arc<ServerKeyPair>,
    public_payload: Vec<u8>,
}

impl KeyExchangeResponder {
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] if the public key cannot be encoded.
    pub fn new(keypair: Arc<ServerKeyPair>) -> Result<Self, CryptoError> {
        let public_payload = encode_public_key(&keypair.public_key())?;
        Ok(Self {
            keypair,
            public_payload,
        })
    }

    /// Produces the reply for a handshake request, or `None` if `request` is
    /// not one.
    ///
    /// A successful `KeyExchangeRequest` installs the session key into `keys`
    /// before the reply is returned.
    pub fn respond(&self, request: &Envelope, keys: &SessionKeyStore) -> Option<Envelope> {
        match request.message_type {
            MessageType::HandshakeRequest => {
                debug!("handshake request {}: sending public key", request.message_id);
                Some(Envelope::reply_to(
                    request,
                    MessageType::HandshakeResponse,
                    self.public_payload.clone(),
                ))
            }
            MessageType::KeyExchangeRequest => {
                let payload = match unwrap_session_key(&self.keypair, &request.payload) {
                    Ok(key) => {
                        keys.install(key);
                        info!("session key installed for exchange {}", request.message_id);
                        KEY_EXCHANGE_SUCCESS.to_vec()
                    }
                    Err(e) => {
                        warn!("key exchange {} rejected: {e}", request.message_id);
                        format!("{KEY_EXCHANGE_ERROR_PREFIX}{e}").into_bytes()
                    }
                };
                Some(Envelope::reply_to(
                    request,
                    MessageType::KeyExchangeResponse,
                    payload,
                ))
            }
            _ => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use super::*;

    fn responder() -> &'static KeyExchangeResponder {
        static R: OnceLock<KeyExchangeResponder> = OnceLock::new();
        R.get_or_init(|| {
            let keypair = Arc::new(ServerKeyPair::generate(1024).unwrap());
            KeyExchangeResponder::new(keypair).unwrap()
        })
    }

    #[test]
    fn test_handshake_request_is_answered_with_public_key() {
        // Arrange
        let keys = SessionKeyStore::new();
        let request = Envelope::new(MessageType::HandshakeRequest, Vec::new());

        // Act
        let reply = responder().respond(&request, &keys).unwrap();

        // Assert
        assert_eq!(reply.message_type, MessageType::HandshakeResponse);
        assert_eq!(reply.message_id, request.message_id);
        assert!(decode_public_key(&reply.payload).is_ok());
        assert!(!keys.is_established());
    }

    #[test]
    fn test_full_exchange_installs_same_key_on_both_sides() {
        // Arrange
        let keys = SessionKeyStore::new();
        let hello = Envelope::new(MessageType::HandshakeRequest, Vec::new());
        let public = decode_public_key(&responder().respond(&hello, &keys).unwrap().payload).unwrap();
        let client_key = SessionKey::generate();

        // Act
        let request = Envelope::new(
            MessageType::KeyExchangeRequest,
            wrap_session_key(&public, &client_key).unwrap(),
        );
        let reply = responder().respond(&request, &keys).unwrap();

        // Assert
        assert_eq!(reply.message_type, MessageType::KeyExchangeResponse);
        assert_eq!(parse_exchange_result(&reply.payload), Ok(()));
        assert_eq!(keys.session_key(), Some(client_key));
    }

    #[test]
    fn test_garbage_key_exchange_is_rejected_with_reason() {
        let keys = SessionKeyStore::new();
        let request = Envelope::new(MessageType::KeyExchangeRequest, b"not base64 !!".to_vec());

        let reply = responder().respond(&request, &keys).unwrap();

        let reason = parse_exchange_result(&reply.payload).unwrap_err();
        assert!(reason.starts_with("invalid encoding"), "reason was {reason:?}");
        assert!(!keys.is_established());
    }

    #[test]
    fn test_application_envelope_is_not_handled() {
        let keys = SessionKeyStore::new();
        let env = Envelope::new(MessageType::ChatListRequest, Vec::new());
        assert!(responder().respond(&env, &keys).is_none());
    }

    #[test]
    fn test_parse_exchange_result_strips_error_prefix() {
        assert_eq!(
            parse_exchange_result(b"ERROR: key too short"),
            Err("key too short".to_owned())
        );
        assert_eq!(parse_exchange_result(b"nope"), Err("nope".to_owned()));
    }
}
