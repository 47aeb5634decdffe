//! Request/response correlation by message ID.
//!
//! Every outbound request registers a single-assignment slot keyed by its
//! [`MessageId`].  The reader task hands every inbound envelope to
//! [`RequestCorrelator::on_receive`]: a matching slot is resolved and removed,
//! anything else is returned to the caller as an unsolicited (push) message.
//!
//! Slots are removed exactly once, by whichever comes first:
//! - the reply arriving,
//! - [`RequestCorrelator::fail_all`] on disconnect,
//! - the [`PendingReply`] timing out or being dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chat_core::{Envelope, MessageId, PipelineError, ProtocolError};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Default per-request reply timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors delivered to a caller waiting on a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection closed before a reply arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// No reply arrived in time.  The connection itself is unaffected.
    #[error("no reply to {message_id} within {after:?}")]
    Timeout { message_id: MessageId, after: Duration },

    /// `send` was called while not connected.
    #[error("not connected")]
    NotConnected,

    /// A request with the same ID is already waiting for its reply.
    #[error("a request with id {0} is already pending")]
    DuplicateMessageId(MessageId),

    /// The encryption stage refused the envelope.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The envelope could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

type Reply = Result<Envelope, TransportError>;

#[derive(Debug)]
struct Slot {
    token: u64,
    tx: oneshot::Sender<Reply>,
}

type SlotTable = Arc<Mutex<HashMap<MessageId, Slot>>>;

fn lock(table: &SlotTable) -> MutexGuard<'_, HashMap<MessageId, Slot>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The pending request table.
#[derive(Clone)]
pub struct RequestCorrelator {
    pending: SlotTable,
    next_token: Arc<AtomicU64>,
    default_timeout: Duration,
}

impl RequestCorrelator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(0)),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Registers a slot using the default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::DuplicateMessageId`] if `id` is already
    /// pending.
    pub fn register(&self, id: MessageId) -> Result<PendingReply, TransportError> {
        self.register_with_timeout(id, self.default_timeout)
    }

    /// Registers a slot that times out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::DuplicateMessageId`] if `id` is already
    /// pending.
    pub fn register_with_timeout(
        &self,
        id: MessageId,
        timeout: Duration,
    ) -> Result<PendingReply, TransportError> {
        let mut table = lock(&self.pending);
        if table.contains_key(&id) {
            return Err(TransportError::DuplicateMessageId(id));
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        table.insert(id, Slot { token, tx });
        Ok(PendingReply {
            message_id: id,
            token,
            timeout,
            rx,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Routes an inbound envelope.
    ///
    /// Returns `None` when the envelope resolved a pending slot, or gives the
    /// envelope back when nothing was waiting for it.
    pub fn on_receive(&self, env: Envelope) -> Option<Envelope> {
        let slot = lock(&self.pending).remove(&env.message_id);
        match slot {
            Some(slot) => {
                if slot.tx.send(Ok(env)).is_err() {
                    debug!("reply arrived after its waiter went away");
                }
                None
            }
            None => Some(env),
        }
    }

    /// Rejects every pending slot with `err` and empties the table.
    ///
    /// Returns the number of slots rejected.
    pub fn fail_all(&self, err: TransportError) -> usize {
        let drained: Vec<Slot> = lock(&self.pending).drain().map(|(_, slot)| slot).collect();
        let count = drained.len();
        for slot in drained {
            let _ = slot.tx.send(Err(err.clone()));
        }
        if count > 0 {
            debug!("failed {count} pending request(s): {err}");
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pending(&self, id: &MessageId) -> bool {
        lock(&self.pending).contains_key(id)
    }
}

impl std::fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

/// Handle to a reply that has not arrived yet.
///
/// Dropping the handle withdraws the request from the table.
#[derive(Debug)]
pub struct PendingReply {
    message_id: MessageId,
    token: u64,
    timeout: Duration,
    rx: oneshot::Receiver<Reply>,
    pending: SlotTable,
}

impl PendingReply {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Waits for the reply.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if nothing arrives within the timeout.
    /// - [`TransportError::ConnectionClosed`] (or whatever error the table was
    ///   failed with) on disconnect.
    pub async fn wait(mut self) -> Result<Envelope, TransportError> {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::Timeout {
                message_id: self.message_id,
                after: self.timeout,
            }),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let mut table = lock(&self.pending);
        if table
            .get(&self.message_id)
            .is_some_and(|slot| slot.token == self.token)
        {
            table.remove(&self.message_id);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
