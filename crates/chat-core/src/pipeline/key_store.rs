//! Per-connection session key material.

use std::sync::{PoisonError, RwLock};

use crate::crypto::{ServerPublicKey, SessionKey};

#[derive(Debug, Default)]
struct KeyMaterial {
    server_public_key: Option<ServerPublicKey>,
    session_key: Option<SessionKey>,
}

/// Key material shared between the key exchange and the encryption stage.
///
/// A session key is present only after a successful exchange; there is no
/// separate "exchanged" flag that could drift out of sync with it.  Clearing
/// drops the key, so a cleared key is never reused.
#[derive(Debug, Default)]
pub struct SessionKeyStore {
    inner: RwLock<KeyMaterial>,
}

impl SessionKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` once a session key has been installed and not yet cleared.
    pub fn is_established(&self) -> bool {
        self.read(|m| m.session_key.is_some())
    }

    /// A copy of the current session key, if any.
    pub fn session_key(&self) -> Option<SessionKey> {
        self.read(|m| m.session_key.clone())
    }

    pub fn server_public_key(&self) -> Option<ServerPublicKey> {
        self.read(|m| m.server_public_key.clone())
    }

    pub fn set_server_public_key(&self, key: ServerPublicKey) {
        self.write(|m| m.server_public_key = Some(key));
    }

    /// Installs the key produced by a completed exchange.
    pub fn install(&self, key: SessionKey) {
        self.write(|m| m.session_key = Some(key));
    }

    /// Drops all key material.  Returns `true` if a session key was present.
    pub fn clear(&self) -> bool {
        self.write(|m| {
            m.server_public_key = None;
            m.session_key.take().is_some()
        })
    }

    fn read<T>(&self, f: impl FnOnce(&KeyMaterial) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut KeyMaterial) -> T) -> T {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}
