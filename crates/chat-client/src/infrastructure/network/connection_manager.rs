//! Connection lifecycle for the chat client.
//!
//! [`ConnectionManager`] owns the state machine, the live socket, the key
//! exchange and the pending request table.  It is cheap to clone; all clones
//! drive the same connection.
//!
//! # Lifecycle (for beginners)
//!
//! 1. `connect(host, port)` moves to `Connecting`, opens the socket through
//!    the injected [`Connector`], spawns one reader and one writer task, and
//!    runs the key exchange.  Only then is the state `Connected`.
//! 2. Application code calls [`send`](ConnectionManager::send), which seals
//!    the envelope, queues it for the writer task and returns a
//!    [`PendingReply`] immediately.
//! 3. The reader task decodes frames, opens them with the session key, and
//!    routes each envelope: handshake replies to the key exchange, replies to
//!    their pending request, and everything else to the inbound channel
//!    returned by [`ConnectionManager::new`].
//! 4. Any failure moves to `Error`, rejects every pending request, discards
//!    the session key and (unless the user disconnected) schedules a
//!    reconnect with exponential backoff.
//!
//! # Generations
//!
//! Every connection attempt gets a generation number.  Tasks belonging to an
//! older generation (a reader that outlived its socket, a superseded reconnect
//! timer) find the number changed and do nothing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chat_core::{
    encode_envelope, Direction, EncryptionStage, Envelope, InboundMessage, MessageType, SessionKey,
    SessionKeyStore,
};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::backoff::ReconnectPolicy;
use crate::application::connection_state::{
    ConnectionError, ConnectionListener, ConnectionState, ListenerSet, Notice,
};
use crate::application::correlator::{PendingReply, RequestCorrelator, TransportError};
use crate::application::key_exchange::{HandshakeSink, KeyExchange};
use crate::infrastructure::network::connector::{BoxedStream, Connector};
use crate::infrastructure::network::session::{read_loop, write_loop};
use crate::infrastructure::storage::config::ClientConfig;

/// Capacity of the channel carrying unsolicited messages to the application.
/// A full channel stalls the reader (see [`ConnectionManager::new`]).
pub const INBOUND_QUEUE_DEPTH: usize = 256;

/// Drives one logical connection to the chat server.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    cell: Mutex<StateCell>,
    listeners: ListenerSet,
    correlator: RequestCorrelator,
    key_exchange: KeyExchange,
    stage: EncryptionStage,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

#[derive(Default)]
struct StateCell {
    state: ConnectionState,
    host: String,
    port: u16,
    reconnect_attempts: u32,
    manual_disconnect: bool,
    shut_down: bool,
    generation: u64,
    link: Option<Link>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl StateCell {
    fn transition(&mut self, new: ConnectionState, notices: &mut Vec<Notice>) {
        let old = std::mem::replace(&mut self.state, new);
        if old != new {
            debug!("connection state {old} -> {new}");
            notices.push(Notice::State(old, new));
        }
    }
}

/// The socket of the current generation.
struct Link {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Link {
    fn close(self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl ConnectionManager {
    /// Creates a disconnected manager.
    ///
    /// Returns the manager and the receiver of unsolicited (push) envelopes.
    ///
    /// # Draining the receiver
    ///
    /// The receiver holds [`INBOUND_QUEUE_DEPTH`] messages.  Once it is full
    /// the reader task waits for room before decoding the next frame, so
    /// replies queued behind an unread push are not delivered and pending
    /// requests may time out.  Keep the receiver drained, or drop it if
    /// pushes are not wanted; pushes to a dropped receiver are discarded.
    pub fn new(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let keys = Arc::new(SessionKeyStore::new());
        let inner = Inner {
            policy: config.reconnect.policy(),
            connector,
            cell: Mutex::new(StateCell::default()),
            listeners: ListenerSet::default(),
            correlator: RequestCorrelator::new(config.connection.request_timeout()),
            key_exchange: KeyExchange::new(
                Arc::clone(&keys),
                config.connection.handshake_step_timeout(),
            ),
            stage: EncryptionStage::new(keys, config.connection.require_encryption),
            inbound_tx,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            inbound_rx,
        )
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().reconnect_attempts
    }

    /// `true` once the current connection has a session key.
    pub fn is_encrypted(&self) -> bool {
        self.inner.key_exchange.is_exchanged()
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.len()
    }

    /// Connects to `host:port` and performs the key exchange.
    ///
    /// On failure a reconnect is scheduled before the error is returned, so
    /// the manager may still reach `Connected` later.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::InvalidHost`] / [`ConnectionError::InvalidPort`]
    ///   for bad arguments (no state change).
    /// - [`ConnectionError::AlreadyConnected`] while connecting or connected.
    /// - [`ConnectionError::ShutDown`] after [`shutdown`](Self::shutdown).
    /// - The socket, handshake or cancellation error of this attempt.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ConnectionError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(ConnectionError::InvalidHost);
        }
        if port == 0 {
            return Err(ConnectionError::InvalidPort(port));
        }

        let mut notices = Vec::new();
        let generation = {
            let mut cell = self.inner.lock();
            if cell.shut_down {
                return Err(ConnectionError::ShutDown);
            }
            if cell.state.is_active() {
                return Err(ConnectionError::AlreadyConnected);
            }
            if let Some(timer) = cell.reconnect_timer.take() {
                timer.abort();
            }
            cell.manual_disconnect = false;
            cell.reconnect_attempts = 0;
            cell.host = host.to_owned();
            cell.port = port;
            cell.generation += 1;
            cell.transition(ConnectionState::Connecting, &mut notices);
            cell.generation
        };
        self.inner.listeners.deliver(notices);

        self.inner.attempt(generation).await
    }

    /// Closes the connection and suppresses reconnection until the next
    /// `connect`.  Every pending request fails with
    /// [`TransportError::ConnectionClosed`].  Idempotent.
    pub fn disconnect(&self) {
        let notices = self.inner.close(false);
        self.inner.listeners.deliver(notices);
        info!("disconnected");
    }

    /// Disconnects for good: later `connect` calls fail with
    /// [`ConnectionError::ShutDown`] and all listeners are removed.
    pub fn shutdown(&self) {
        let notices = self.inner.close(true);
        self.inner.listeners.deliver(notices);
        self.inner.listeners.clear();
        info!("connection manager shut down");
    }

    /// Queues `env` for transmission and returns a handle to its reply.
    ///
    /// Does not wait for any I/O.
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotConnected`] unless the state is `Connected`.
    /// - [`TransportError::DuplicateMessageId`] if the ID is already pending.
    /// - [`TransportError::Pipeline`] if the envelope cannot be sealed.
    pub fn send(&self, env: Envelope) -> Result<PendingReply, TransportError> {
        let writer = self.inner.connected_writer()?;
        let pending = self.inner.correlator.register(env.message_id)?;
        self.inner.transmit(&writer, env)?;
        Ok(pending)
    }

    /// Sends `env` and waits for the matching reply.
    ///
    /// # Errors
    ///
    /// Everything [`send`](Self::send) returns, plus timeout and disconnect.
    pub async fn request(&self, env: Envelope) -> Result<Envelope, TransportError> {
        self.send(env)?.wait().await
    }

    /// Transmits `env` without registering for a reply.
    ///
    /// # Errors
    ///
    /// As [`send`](Self::send), minus the duplicate-ID check.
    pub fn send_oneway(&self, env: Envelope) -> Result<(), TransportError> {
        let writer = self.inner.connected_writer()?;
        self.inner.transmit(&writer, env)
    }

    /// Runs the key exchange on the current socket, or returns the installed
    /// session key.  Concurrent calls share one exchange.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Closed`] when there is no socket, otherwise the
    /// handshake failure.
    pub async fn perform_key_exchange(&self) -> Result<SessionKey, ConnectionError> {
        let writer = self
            .inner
            .lock()
            .link
            .as_ref()
            .map(|link| link.writer.clone())
            .ok_or(ConnectionError::Closed)?;
        let sink = LinkSink {
            writer,
            stage: self.inner.stage.clone(),
        };
        Ok(self.inner.key_exchange.perform(&sink).await?)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cell = self.inner.lock();
        f.debug_struct("ConnectionManager")
            .field("state", &cell.state)
            .field("host", &cell.host)
            .field("port", &cell.port)
            .field("reconnect_attempts", &cell.reconnect_attempts)
            .finish_non_exhaustive()
    }
}

// ── Internals ─────────────────────────────────────────────────────────────────

impl Inner {
    fn lock(&self) -> MutexGuard<'_, StateCell> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// One connect attempt for `generation`, ending in `Connected` or in the
    /// failure path.
    async fn attempt(self: &Arc<Self>, generation: u64) -> Result<(), ConnectionError> {
        match self.open(generation).await {
            Ok(()) => {
                let mut notices = Vec::new();
                {
                    let mut cell = self.lock();
                    if cell.generation != generation {
                        return Err(ConnectionError::Cancelled);
                    }
                    cell.reconnect_attempts = 0;
                    cell.transition(ConnectionState::Connected, &mut notices);
                    info!("connected to {}:{} (encrypted)", cell.host, cell.port);
                }
                self.listeners.deliver(notices);
                Ok(())
            }
            Err(_) if !self.is_current(generation) => Err(ConnectionError::Cancelled),
            Err(e) => {
                self.on_failure(generation, e.clone());
                Err(e)
            }
        }
    }

    async fn open(self: &Arc<Self>, generation: u64) -> Result<(), ConnectionError> {
        let (host, port) = {
            let cell = self.lock();
            (cell.host.clone(), cell.port)
        };
        let stream = self
            .connector
            .connect(&host, port)
            .await
            .map_err(|e| ConnectionError::Connect {
                addr: format!("{host}:{port}"),
                reason: e.to_string(),
            })?;

        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, queue) = mpsc::unbounded_channel();
        {
            let mut cell = self.lock();
            // A superseded attempt must not touch the live connection's key
            if cell.generation != generation {
                return Err(ConnectionError::Cancelled);
            }
            // Fresh crypto state for every socket
            self.key_exchange.reset();
            let reader_task = tokio::spawn(Arc::clone(self).run_reader(generation, read_half));
            let writer_task =
                tokio::spawn(Arc::clone(self).run_writer(generation, write_half, queue));
            cell.link = Some(Link {
                writer: writer.clone(),
                reader_task,
                writer_task,
            });
        }
        debug!("socket to {host}:{port} open; starting key exchange");

        let sink = LinkSink {
            writer,
            stage: self.stage.clone(),
        };
        self.key_exchange.perform(&sink).await?;
        Ok(())
    }

    async fn run_reader(self: Arc<Self>, generation: u64, reader: ReadHalf<BoxedStream>) {
        let inner = Arc::clone(&self);
        let reason = read_loop(reader, |env| {
            let inner = Arc::clone(&inner);
            async move { inner.dispatch(env).await }
        })
        .await;
        self.on_failure(generation, reason);
    }

    async fn run_writer(
        self: Arc<Self>,
        generation: u64,
        writer: WriteHalf<BoxedStream>,
        queue: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        if let Err(e) = write_loop(writer, queue).await {
            self.on_failure(generation, ConnectionError::Io(e.to_string()));
        }
    }

    /// Routes one inbound envelope.  An error closes the connection.
    async fn dispatch(&self, env: Envelope) -> Result<(), ConnectionError> {
        let env = match self.stage.inbound(env) {
            Ok(env) => env,
            Err(e) if e.closes_connection() => return Err(ConnectionError::Decryption(e)),
            Err(e) => {
                warn!("dropping inbound envelope: {e}");
                return Ok(());
            }
        };

        if env.message_type.is_handshake_response() {
            let final_step = env.message_type == MessageType::KeyExchangeResponse;
            match self.key_exchange.on_receive(env) {
                Some(stray) => debug!("no handshake step waiting for {}", stray.message_id),
                // The server may seal its next frame right behind this reply
                None if final_step => self.key_exchange.settled().await,
                None => {}
            }
            return Ok(());
        }

        if let Some(push) = self.correlator.on_receive(env) {
            let message = InboundMessage::from_envelope(push, Direction::ServerToClient);
            if self.inbound_tx.send(message).await.is_err() {
                debug!("inbound receiver dropped; discarding push");
            }
        }
        Ok(())
    }

    /// Failure path shared by connect attempts and live connections.
    fn on_failure(self: &Arc<Self>, generation: u64, error: ConnectionError) {
        let mut notices = Vec::new();
        {
            let mut cell = self.lock();
            if cell.generation != generation || cell.shut_down {
                return;
            }
            cell.generation += 1;
            if let Some(link) = cell.link.take() {
                link.close();
            }
            warn!("connection to {}:{} failed: {error}", cell.host, cell.port);
            self.correlator.fail_all(TransportError::ConnectionClosed);
            self.key_exchange.reset();

            cell.transition(ConnectionState::Error, &mut notices);
            notices.push(Notice::Error(error));
            if !cell.manual_disconnect {
                self.schedule_reconnect(&mut cell, &mut notices);
            }
        }
        self.listeners.deliver(notices);
    }

    /// Arms the reconnect timer for the next attempt.  Must be called with the
    /// state lock held.
    fn schedule_reconnect(self: &Arc<Self>, cell: &mut StateCell, notices: &mut Vec<Notice>) {
        cell.reconnect_attempts += 1;
        let attempt = cell.reconnect_attempts;
        if !self.policy.allows(attempt) {
            warn!(
                "giving up after {} reconnect attempts",
                self.policy.max_attempts
            );
            notices.push(Notice::Error(ConnectionError::AttemptsExhausted {
                attempts: self.policy.max_attempts,
            }));
            return;
        }

        let delay = self.policy.delay_for(attempt);
        cell.transition(ConnectionState::Reconnecting, notices);
        notices.push(Notice::ReconnectAttempt(attempt, delay));
        info!("reconnect attempt {attempt} in {delay:?}");

        if let Some(previous) = cell.reconnect_timer.take() {
            previous.abort();
        }
        let generation = cell.generation;
        let inner = Arc::clone(self);
        cell.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire_reconnect(generation).await;
        }));
    }

    async fn fire_reconnect(self: Arc<Self>, generation: u64) {
        let mut notices = Vec::new();
        let next = {
            let mut cell = self.lock();
            if cell.generation != generation
                || cell.manual_disconnect
                || cell.shut_down
                || cell.state != ConnectionState::Reconnecting
            {
                return;
            }
            // Detach our own handle so a failure below does not abort us
            cell.reconnect_timer = None;
            cell.generation += 1;
            cell.transition(ConnectionState::Connecting, &mut notices);
            cell.generation
        };
        self.listeners.deliver(notices);

        if let Err(e) = self.attempt(next).await {
            debug!("reconnect attempt failed: {e}");
        }
    }

    /// Shared by `disconnect` and `shutdown`.
    fn close(&self, shutdown: bool) -> Vec<Notice> {
        let mut notices = Vec::new();
        let mut cell = self.lock();
        cell.manual_disconnect = true;
        if shutdown {
            cell.shut_down = true;
        }
        cell.generation += 1;
        if let Some(timer) = cell.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(link) = cell.link.take() {
            link.close();
        }
        self.correlator.fail_all(TransportError::ConnectionClosed);
        self.key_exchange.reset();
        cell.transition(ConnectionState::Disconnected, &mut notices);
        notices
    }

    fn connected_writer(&self) -> Result<mpsc::UnboundedSender<Vec<u8>>, TransportError> {
        let cell = self.lock();
        match (&cell.state, &cell.link) {
            (ConnectionState::Connected, Some(link)) => Ok(link.writer.clone()),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn transmit(
        &self,
        writer: &mpsc::UnboundedSender<Vec<u8>>,
        env: Envelope,
    ) -> Result<(), TransportError> {
        let sealed = self.stage.outbound(env)?;
        let frame = encode_envelope(&sealed)?;
        writer
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

/// Writes handshake envelopes through the encryption stage (which passes
/// them through in clear) onto the current socket.
struct LinkSink {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    stage: EncryptionStage,
}

#[async_trait]
impl HandshakeSink for LinkSink {
    async fn send_handshake(&self, env: Envelope) -> Result<(), TransportError> {
        let sealed = self.stage.outbound(env)?;
        let frame = encode_envelope(&sealed)?;
        self.writer
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
