//! ChatServer: the TCP accept loop.
//!
//! Binds the configured address, then spawns one [`run_session`] task per
//! accepted connection.  All sessions share one RSA key pair, one
//! [`EnvelopeHandler`] and one [`SessionRegistry`].
//!
//! # Shutdown (for beginners)
//!
//! [`ChatServer::run`] takes a `tokio::sync::watch` receiver.  When the
//! owner sends `true`, the accept loop stops, every session sees the same
//! signal and closes its socket, and `run` returns once all sessions have
//! finished.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use chat_core::{CryptoError, KeyExchangeResponder, ServerKeyPair};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::application::dispatch::EnvelopeHandler;
use crate::application::registry::SessionRegistry;
use crate::infrastructure::network::session::{run_session, wait_for_shutdown, SessionContext};
use crate::infrastructure::storage::config::{ConfigError, ServerConfig};

/// Errors that prevent the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("key setup failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// A bound, not yet running, chat server.
pub struct ChatServer {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
}

impl ChatServer {
    /// Validates `config` and binds its address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] for an invalid config,
    /// [`ServerError::BindFailed`] if the address is unavailable, and
    /// [`ServerError::Crypto`] if the public key cannot be encoded.
    pub async fn bind(
        config: &ServerConfig,
        keypair: Arc<ServerKeyPair>,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let addr = config.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::BindFailed { addr, source })?;
        let ctx = SessionContext {
            responder: KeyExchangeResponder::new(keypair)?,
            handler,
            registry: SessionRegistry::new(),
            require_encryption: config.require_encryption,
            outbound_queue_depth: config.outbound_queue_depth,
        };
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
        })
    }

    /// The bound address; useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for pushing to live sessions.  Stays valid while `run` runs.
    pub fn registry(&self) -> SessionRegistry {
        self.ctx.registry.clone()
    }

    /// Accepts connections until `shutdown` is `true`, then waits for every
    /// session to close.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut sessions = JoinSet::new();
        match self.listener.local_addr() {
            Ok(addr) => info!("listening on {addr}"),
            Err(e) => debug!("listening (address unavailable: {e})"),
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("set_nodelay failed for {peer}: {e}");
                        }
                        let ctx = Arc::clone(&self.ctx);
                        let shutdown = shutdown.clone();
                        sessions.spawn(async move {
                            // The session logs its own outcome
                            let _ = run_session(stream, peer, ctx, shutdown).await;
                        });
                    }
                    // Usually transient (fd exhaustion, aborted handshake)
                    Err(e) => warn!("accept failed: {e}"),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        info!("shutting down; waiting for {} session(s)", sessions.len());
        while sessions.join_next().await.is_some() {}
        info!("server stopped");
    }
}

impl std::fmt::Debug for ChatServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("sessions", &self.ctx.registry.len())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
