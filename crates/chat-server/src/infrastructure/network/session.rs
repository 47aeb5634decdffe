//! One accepted connection, from the first byte to close.
//!
//! ```text
//!   socket ──read()──► FrameDecoder ──► responder (handshake types)
//!                                   └─► EncryptionStage::inbound ──► EnvelopeHandler
//!   reply / push ──► seal_frame ──► outbound queue ──► socket
//! ```
//!
//! Each session owns its own [`SessionKeyStore`]; the RSA key pair behind the
//! responder is shared by all sessions.  Replies and pushes are sealed when
//! they are queued and go through one bounded queue drained by a writer
//! task, so the reader never blocks on a slow socket write.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chat_core::{
    Direction, EncryptionStage, Envelope, FrameDecoder, InboundMessage, KeyExchangeResponder,
    MessageId, MessageType, PipelineError, ProtocolError, SessionKeyStore,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::dispatch::{EnvelopeHandler, SessionId};
use crate::application::registry::{seal_frame, SessionRegistry};

const READ_CHUNK: usize = 16 * 1024;

/// How long a closing session may spend flushing queued replies.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a session ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Bad magic or an oversized frame; the stream cannot be resynchronised.
    #[error("framing error: {0}")]
    Framing(#[from] ProtocolError),

    #[error("decryption error: {0}")]
    Decryption(#[source] PipelineError),
}

/// Everything a session needs that outlives it.
pub struct SessionContext {
    pub responder: KeyExchangeResponder,
    pub handler: Arc<dyn EnvelopeHandler>,
    pub registry: SessionRegistry,
    pub require_encryption: bool,
    pub outbound_queue_depth: usize,
}

/// Serves one connection until the peer closes it, it fails, or `shutdown`
/// flips to `true`.
///
/// # Errors
///
/// Returns the [`SessionError`] that closed the connection.  A clean close
/// or a shutdown is `Ok(())`.
pub async fn run_session<S>(
    stream: S,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let id = Uuid::new_v4();
    let keys = Arc::new(SessionKeyStore::new());
    let stage = EncryptionStage::new(Arc::clone(&keys), ctx.require_encryption);
    let (tx, rx) = mpsc::channel(ctx.outbound_queue_depth.max(1));
    let (reader, writer) = tokio::io::split(stream);

    let mut writer_task = tokio::spawn(write_frames(writer, rx));
    ctx.registry.register(id, peer, stage.clone(), tx.clone());
    info!("session {id} opened ({peer})");

    let mut session = Session {
        id,
        ctx: &ctx,
        keys: &keys,
        stage: &stage,
        outbound: tx,
    };
    let result = tokio::select! {
        r = session.read_frames(reader) => r,
        _ = wait_for_shutdown(&mut shutdown) => {
            debug!("session {id}: server shutting down");
            Ok(())
        }
    };

    // Dropping the last sender lets the writer drain and exit
    ctx.registry.unregister(id);
    drop(session);
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => debug!("session {id}: writer stopped: {e}"),
        Ok(Err(e)) => warn!("session {id}: writer task failed: {e}"),
        Err(_) => {
            warn!("session {id}: peer not reading; dropping unsent frames");
            writer_task.abort();
        }
    }
    stage.on_close();

    match &result {
        Ok(()) => info!("session {id} closed"),
        Err(e) => warn!("session {id} closed: {e}"),
    }
    result
}

/// Resolves once `shutdown` is `true` or its sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

struct Session<'a> {
    id: SessionId,
    ctx: &'a SessionContext,
    keys: &'a SessionKeyStore,
    stage: &'a EncryptionStage,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl Session<'_> {
    async fn read_frames<R>(&mut self, mut reader: R) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = FrameDecoder::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                debug!("session {}: peer closed the connection", self.id);
                return Ok(());
            }
            decoder.extend(&chunk[..n]);

            loop {
                match decoder.next_envelope() {
                    Ok(Some(env)) => self.on_envelope(env).await?,
                    Ok(None) => break,
                    // Already dropped and logged by the decoder
                    Err(e) if e.is_recoverable() => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    async fn on_envelope(&mut self, env: Envelope) -> Result<(), SessionError> {
        if let Some(reply) = self.ctx.responder.respond(&env, self.keys) {
            return self.send(reply).await;
        }

        let message_id = env.message_id;
        if self.ctx.require_encryption
            && !self.keys.is_established()
            && !env.message_type.is_handshake()
        {
            warn!(
                "session {}: {:?} before key exchange; refusing",
                self.id, env.message_type
            );
            return self
                .send_error(message_id, "key exchange required before application traffic")
                .await;
        }

        let plain = match self.stage.inbound(env) {
            Ok(plain) => plain,
            Err(e) if e.closes_connection() => return Err(SessionError::Decryption(e)),
            Err(e) => {
                warn!("session {}: refusing envelope: {e}", self.id);
                return self.send_error(message_id, &e.to_string()).await;
            }
        };
        if plain.message_type.is_handshake() {
            debug!(
                "session {}: ignoring stray {:?}",
                self.id, plain.message_type
            );
            return Ok(());
        }

        let message = InboundMessage::from_envelope(plain, Direction::ClientToServer);
        if let Some(reply) = self.ctx.handler.handle(self.id, message).await {
            let env = Envelope::with_id(reply.message_type, message_id, reply.payload);
            self.send(env).await?;
        }
        Ok(())
    }

    async fn send_error(
        &mut self,
        message_id: MessageId,
        reason: &str,
    ) -> Result<(), SessionError> {
        let env = Envelope::with_id(MessageType::Error, message_id, reason.as_bytes().to_vec());
        self.send(env).await
    }

    /// Seals `env` under the key in force now and queues it for the writer.
    async fn send(&mut self, env: Envelope) -> Result<(), SessionError> {
        let frame = match seal_frame(self.stage, env) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("session {}: dropping outbound envelope: {e}", self.id);
                return Ok(());
            }
        };
        self.outbound.send(frame).await.map_err(|_| {
            SessionError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session writer stopped",
            ))
        })
    }
}

/// Writes queued frames in order until every sender is dropped.
async fn write_frames<W>(mut writer: W, mut queue: mpsc::Receiver<Vec<u8>>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = queue.recv().await {
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

// ── Tests ─────────────────────────────────────────────────────────────────────
