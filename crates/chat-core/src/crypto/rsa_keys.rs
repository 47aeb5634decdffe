//! RSA key handling for the key exchange.
//!
//! The server owns a [`ServerKeyPair`]; the client only ever sees the public
//! half, transported as base64-encoded DER `SubjectPublicKeyInfo`.  Session
//! keys are wrapped with RSA-OAEP using SHA-256.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{DecodePublicKey, EncodePublicKey},
    Oaep, RsaPrivateKey, RsaPublicKey,
};
use sha2::Sha256;

use super::CryptoError;

/// Default modulus size for freshly generated server keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// The server's RSA private key.
#[derive(Clone)]
pub struct ServerKeyPair {
    private: RsaPrivateKey,
}

impl ServerKeyPair {
    /// Generates a new key pair with a `bits`-bit modulus.
    ///
    /// This is slow (hundreds of milliseconds at 2048 bits); call it once at
    /// startup and share the result.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Rsa`] if key generation fails.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private =
            RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| CryptoError::Rsa(e.to_string()))?;
        Ok(Self { private })
    }

    pub fn public_key(&self) -> ServerPublicKey {
        ServerPublicKey(self.private.to_public_key())
    }

    /// Unwraps a session key sent by a client.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Rsa`] when the ciphertext was not produced for
    /// this key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| CryptoError::Rsa(e.to_string()))
    }
}

impl std::fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// A peer's RSA public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPublicKey(RsaPublicKey);

impl ServerPublicKey {
    /// Parses base64 DER `SubjectPublicKeyInfo`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] for invalid base64 or DER.
    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let der = BASE64
            .decode(text.trim())
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        RsaPublicKey::from_public_key_der(&der)
            .map(Self)
            .map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    /// Encodes the key as base64 DER `SubjectPublicKeyInfo`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] if DER serialisation fails.
    pub fn to_base64(&self) -> Result<String, CryptoError> {
        let der = self
            .0
            .to_public_key_der()
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        Ok(BASE64.encode(der.as_bytes()))
    }

    /// RSA-OAEP(SHA-256) encrypts `plaintext` under this key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Rsa`] if the message is too long for the modulus.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.0
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| CryptoError::Rsa(e.to_string()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
