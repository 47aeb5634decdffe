//! Cryptographic wrappers used by the transport.
//!
//! # Hybrid encryption (for beginners)
//!
//! Symmetric ciphers such as AES are fast but need both sides to already share
//! a key.  Asymmetric ciphers such as RSA solve the sharing problem (anyone may
//! encrypt with the public key, only the key owner can decrypt) but are slow
//! and can only encrypt a few hundred bytes.
//!
//! The transport combines the two:
//!
//! 1. The server publishes an RSA public key ([`rsa_keys`]).
//! 2. The client generates a random 256-bit AES key and sends it encrypted
//!    under that public key.
//! 3. Every later payload is sealed with AES-256-GCM ([`cipher`]), which both
//!    hides the plaintext and detects any modification.

pub mod cipher;
pub mod rsa_keys;

use thiserror::Error;

pub use cipher::{open, seal, SessionKey, IV_SIZE, KEY_SIZE, TAG_SIZE};
pub use rsa_keys::{ServerKeyPair, ServerPublicKey};

/// Errors from the cryptographic primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The combined `IV || tag || ciphertext` buffer is shorter than IV + tag.
    #[error("sealed payload too short: {len} bytes, need at least {min}")]
    Truncated { len: usize, min: usize },

    /// GCM tag verification failed: wrong key or tampered data.
    #[error("authentication tag mismatch")]
    AuthenticationFailed,

    /// AES-GCM refused to encrypt (only possible for absurdly large inputs).
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// A key had the wrong length.
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    /// RSA key generation, encoding, or OAEP operation failed.
    #[error("RSA error: {0}")]
    Rsa(String),

    /// A base64 or DER encoding could not be parsed.
    #[error("invalid encoding: {0}")]
    Encoding(String),
}
