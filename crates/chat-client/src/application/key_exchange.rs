//! Client side of the RSA + AES key exchange.
//!
//! [`KeyExchange::perform`] runs the two round-trips described in
//! `chat_core::handshake` and installs the resulting session key.  The whole
//! procedure runs under one async mutex: a caller that arrives while an
//! exchange is in flight waits for it and then returns the key it produced.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chat_core::handshake::{decode_public_key, parse_exchange_result, wrap_session_key};
use chat_core::{CryptoError, Envelope, MessageType, SessionKey, SessionKeyStore};
use thiserror::Error;
use tracing::{debug, info};

use crate::application::correlator::{RequestCorrelator, TransportError};

/// Default timeout for each handshake round-trip.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// The two round-trips of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    PublicKey,
    KeyExchange,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeStep::PublicKey => f.write_str("public-key request"),
            HandshakeStep::KeyExchange => f.write_str("key exchange"),
        }
    }
}

/// Reasons a key exchange can fail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("{step} timed out after {after:?}")]
    Timeout { step: HandshakeStep, after: Duration },

    #[error("server sent an invalid public key: {0}")]
    InvalidPublicKey(CryptoError),

    #[error("could not encrypt session key: {0}")]
    Encryption(CryptoError),

    /// The server answered with something other than the success marker.
    #[error("server rejected key exchange: {0}")]
    Rejected(String),

    #[error("unexpected {got:?} reply during {step}")]
    UnexpectedReply { step: HandshakeStep, got: MessageType },

    #[error("transport failed during handshake: {0}")]
    Transport(TransportError),

    /// [`KeyExchange::reset`] ran while the exchange was in flight.
    #[error("key exchange was reset")]
    Reset,
}

/// Where handshake envelopes are written.  Implemented by the connection.
#[async_trait]
pub trait HandshakeSink: Send + Sync {
    async fn send_handshake(&self, env: Envelope) -> Result<(), TransportError>;
}

/// Per-connection key exchange state.
pub struct KeyExchange {
    exchange_lock: tokio::sync::Mutex<()>,
    // Bumped by every reset; an exchange installs its key only if the epoch
    // it started in is still current.
    epoch: Mutex<u64>,
    keys: Arc<SessionKeyStore>,
    pending: RequestCorrelator,
    step_timeout: Duration,
}

impl KeyExchange {
    pub fn new(keys: Arc<SessionKeyStore>, step_timeout: Duration) -> Self {
        Self {
            exchange_lock: tokio::sync::Mutex::new(()),
            epoch: Mutex::new(0),
            keys,
            pending: RequestCorrelator::new(step_timeout),
            step_timeout,
        }
    }

    pub fn keys(&self) -> &Arc<SessionKeyStore> {
        &self.keys
    }

    pub fn is_exchanged(&self) -> bool {
        self.keys.is_established()
    }

    /// Runs the exchange, or returns the existing key if one is installed.
    ///
    /// # Errors
    ///
    /// See [`HandshakeError`].  On failure no key is installed; call
    /// [`reset`](Self::reset) before retrying on a new connection.
    pub async fn perform(&self, sink: &dyn HandshakeSink) -> Result<SessionKey, HandshakeError> {
        let _guard = self.exchange_lock.lock().await;
        if let Some(key) = self.keys.session_key() {
            debug!("key exchange already complete; reusing session key");
            return Ok(key);
        }
        let epoch = self.current_epoch();

        // Step 1: fetch the server public key
        let hello = Envelope::new(MessageType::HandshakeRequest, Vec::new());
        let reply = self.round_trip(sink, hello, HandshakeStep::PublicKey).await?;
        let server_key = decode_public_key(&reply.payload).map_err(HandshakeError::InvalidPublicKey)?;
        self.keys.set_server_public_key(server_key.clone());

        // Steps 2-4: generate, wrap and send the session key
        let key = SessionKey::generate();
        let wrapped = wrap_session_key(&server_key, &key).map_err(HandshakeError::Encryption)?;
        let request = Envelope::new(MessageType::KeyExchangeRequest, wrapped);
        let reply = self.round_trip(sink, request, HandshakeStep::KeyExchange).await?;
        parse_exchange_result(&reply.payload).map_err(HandshakeError::Rejected)?;

        // Step 5: arm the encryption stage
        let current = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != epoch {
            return Err(HandshakeError::Reset);
        }
        self.keys.install(key.clone());
        drop(current);

        info!("key exchange complete");
        Ok(key)
    }

    /// Routes a handshake reply to its waiting step.  Returns the envelope if
    /// no step was waiting for it.
    pub fn on_receive(&self, env: Envelope) -> Option<Envelope> {
        self.pending.on_receive(env)
    }

    /// Resolves once no exchange is in flight.
    ///
    /// The reader calls this after routing a key exchange reply so that the
    /// frames behind it are opened with the newly installed key.
    pub async fn settled(&self) {
        drop(self.exchange_lock.lock().await);
    }

    /// Clears all key material and fails any in-flight handshake step.
    pub fn reset(&self) {
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch += 1;
        self.keys.clear();
        drop(epoch);
        self.pending.fail_all(TransportError::ConnectionClosed);
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn round_trip(
        &self,
        sink: &dyn HandshakeSink,
        request: Envelope,
        step: HandshakeStep,
    ) -> Result<Envelope, HandshakeError> {
        let expected = request.message_type.response_type();
        let waiter = self
            .pending
            .register_with_timeout(request.message_id, self.step_timeout)
            .map_err(HandshakeError::Transport)?;
        sink.send_handshake(request)
            .await
            .map_err(HandshakeError::Transport)?;

        match waiter.wait().await {
            Ok(reply) if Some(reply.message_type) == expected => Ok(reply),
            Ok(reply) => Err(HandshakeError::UnexpectedReply {
                step,
                got: reply.message_type,
            }),
            Err(TransportError::Timeout { .. }) => Err(HandshakeError::Timeout {
                step,
                after: self.step_timeout,
            }),
            Err(e) => Err(HandshakeError::Transport(e)),
        }
    }
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("exchanged", &self.is_exchanged())
            .field("step_timeout", &self.step_timeout)
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;

    use chat_core::{KeyExchangeResponder, ServerKeyPair};

    use super::*;

    fn responder() -> &'static KeyExchangeResponder {
        static R: OnceLock<KeyExchangeResponder> = OnceLock::new();
        R.get_or_init(|| {
            KeyExchangeResponder::new(Arc::new(ServerKeyPair::generate(1024).unwrap())).unwrap()
        })
    }

    /// Answers handshake envelopes synchronously through a real responder.
    struct LoopbackServer {
        exchange: Arc<KeyExchange>,
        server_keys: SessionKeyStore,
        hellos: AtomicUsize,
        mangle_public_key: bool,
        silent: bool,
    }

    impl LoopbackServer {
        fn new(exchange: Arc<KeyExchange>) -> Self {
            Self {
                exchange,
                server_keys: SessionKeyStore::new(),
                hellos: AtomicUsize::new(0),
                mangle_public_key: false,
                silent: false,
            }
        }
    }

    #[async_trait]
    impl HandshakeSink for LoopbackServer {
        async fn send_handshake(&self, env: Envelope) -> Result<(), TransportError> {
            if env.message_type == MessageType::HandshakeRequest {
                self.hellos.fetch_add(1, Ordering::SeqCst);
            }
            if self.silent {
                return Ok(());
            }
            let mut reply = responder().respond(&env, &self.server_keys).unwrap();
            if self.mangle_public_key && reply.message_type == MessageType::HandshakeResponse {
                reply.payload = b"bm90IGEga2V5".to_vec();
            }
            let exchange = Arc::clone(&self.exchange);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                exchange.on_receive(reply);
            });
            Ok(())
        }
    }

    fn new_exchange(step_timeout: Duration) -> Arc<KeyExchange> {
        Arc::new(KeyExchange::new(
            Arc::new(SessionKeyStore::new()),
            step_timeout,
        ))
    }

    #[tokio::test]
    async fn test_perform_installs_key_shared_with_server() {
        // Arrange
        let exchange = new_exchange(DEFAULT_STEP_TIMEOUT);
        let server = LoopbackServer::new(Arc::clone(&exchange));

        // Act
        let key = exchange.perform(&server).await.unwrap();

        // Assert
        assert!(exchange.is_exchanged());
        assert_eq!(server.server_keys.session_key(), Some(key));
        assert!(exchange.keys().server_public_key().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_performs_share_one_round_trip() {
        // Arrange
        let exchange = new_exchange(DEFAULT_STEP_TIMEOUT);
        let server = LoopbackServer::new(Arc::clone(&exchange));

        // Act
        let (a, b) = tokio::join!(exchange.perform(&server), exchange.perform(&server));

        // Assert
        assert_eq!(server.hellos.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_public_key_fails_exchange() {
        let exchange = new_exchange(DEFAULT_STEP_TIMEOUT);
        let mut server = LoopbackServer::new(Arc::clone(&exchange));
        server.mangle_public_key = true;

        let result = exchange.perform(&server).await;

        assert!(matches!(result, Err(HandshakeError::InvalidPublicKey(_))));
        assert!(!exchange.is_exchanged());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out_first_step() {
        let exchange = new_exchange(Duration::from_secs(5));
        let mut server = LoopbackServer::new(Arc::clone(&exchange));
        server.silent = true;

        let result = exchange.perform(&server).await;

        assert_eq!(
            result,
            Err(HandshakeError::Timeout {
                step: HandshakeStep::PublicKey,
                after: Duration::from_secs(5)
            })
        );
    }

    #[tokio::test]
    async fn test_reset_clears_key_and_next_perform_runs_again() {
        // Arrange
        let exchange = new_exchange(DEFAULT_STEP_TIMEOUT);
        let server = LoopbackServer::new(Arc::clone(&exchange));
        let first = exchange.perform(&server).await.unwrap();

        // Act
        exchange.reset();
        let second = exchange.perform(&server).await.unwrap();

        // Assert
        assert_eq!(server.hellos.load(Ordering::SeqCst), 2);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_reset_during_exchange_fails_waiting_step() {
        let exchange = new_exchange(DEFAULT_STEP_TIMEOUT);
        let mut server = LoopbackServer::new(Arc::clone(&exchange));
        server.silent = true;

        let task = {
            let exchange = Arc::clone(&exchange);
            tokio::spawn(async move { exchange.perform(&server).await })
        };
        while exchange.pending.is_empty() {
            tokio::task::yield_now().await;
        }
        exchange.reset();

        assert_eq!(
            task.await.unwrap(),
            Err(HandshakeError::Transport(TransportError::ConnectionClosed))
        );
    }
}
