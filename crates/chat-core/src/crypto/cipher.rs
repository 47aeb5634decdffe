//! AES-256-GCM session cipher.
//!
//! Sealed payload layout:
//! ```text
//! [iv:12][tag:16][ciphertext:N]
//! ```
//! A fresh random IV is drawn for every call to [`seal`].  The associated
//! data is authenticated but not transmitted; the caller must supply the same
//! bytes to [`open`].

use std::fmt;

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce, Tag,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;

/// AES-GCM nonce length in bytes.
pub const IV_SIZE: usize = 12;
/// GCM authentication tag length in bytes.
pub const TAG_SIZE: usize = 16;
/// Session key length in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// A 256-bit symmetric session key.
///
/// The key bytes are zeroed when the value is dropped and never printed by
/// `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Draws a new key from the operating system CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wraps raw key bytes received from a peer.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] unless `bytes` is exactly 32
    /// bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            got: bytes.len(),
        })?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Encrypts `plaintext`, returning `IV || tag || ciphertext`.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the underlying AEAD rejects the
/// input.
pub fn seal(key: &SessionKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let mut buffer = plaintext.to_vec();
    let tag = key
        .cipher()
        .encrypt_in_place_detached(Nonce::from_slice(&iv), aad, &mut buffer)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut sealed = Vec::with_capacity(IV_SIZE + TAG_SIZE + buffer.len());
    sealed.extend_from_slice(&iv);
    sealed.extend_from_slice(tag.as_slice());
    sealed.extend_from_slice(&buffer);
    Ok(sealed)
}

/// Verifies and decrypts a buffer produced by [`seal`].
///
/// # Errors
///
/// - [`CryptoError::Truncated`] if the buffer cannot hold an IV and tag.
/// - [`CryptoError::AuthenticationFailed`] if the tag does not verify.
pub fn open(key: &SessionKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let min = IV_SIZE + TAG_SIZE;
    if sealed.len() < min {
        return Err(CryptoError::Truncated {
            len: sealed.len(),
            min,
        });
    }
    let (iv, rest) = sealed.split_at(IV_SIZE);
    let (tag, ciphertext) = rest.split_at(TAG_SIZE);

    let mut buffer = ciphertext.to_vec();
    key.cipher()
        .decrypt_in_place_detached(Nonce::from_slice(iv), aad, &mut buffer, Tag::from_slice(tag))
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    Ok(buffer)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
