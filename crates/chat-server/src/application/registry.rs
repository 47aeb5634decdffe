//! SessionRegistry: the server's table of live sessions.
//!
//! Every accepted connection registers its outbound queue here for as long
//! as it runs.  That is what lets server-side code send a `Notification` to
//! one client ([`SessionRegistry::push`]) or to all of them
//! ([`SessionRegistry::broadcast`]) without holding the socket.
//!
//! # Why a bounded queue? (for beginners)
//!
//! A client that stops reading would otherwise let pushes pile up in memory
//! without limit.  Each session's queue holds at most `outbound_queue_depth`
//! frames; a push to a full queue fails with [`PushError::QueueFull`]
//! instead of waiting.
//!
//! # Sealing
//!
//! The queue carries finished wire frames.  Every envelope is sealed (or
//! left clear) with the session's key at the moment it is queued, so the
//! caller learns right away whether it can be delivered.  A push to a
//! session that has not finished its key exchange fails with
//! [`PushError::NotEstablished`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use chat_core::{
    encode_envelope, EncryptionStage, Envelope, MessageId, MessageType, PipelineError,
    ProtocolError,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::application::dispatch::SessionId;

/// Why a push could not be queued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("no live session {0}")]
    UnknownSession(SessionId),

    #[error("outbound queue of session {0} is full")]
    QueueFull(SessionId),

    #[error("session {0} is closing")]
    Closed(SessionId),

    #[error("session {0} has no session key yet")]
    NotEstablished(SessionId),

    #[error("cannot frame push for session {id}: {source}")]
    Seal {
        id: SessionId,
        #[source]
        source: SealError,
    },
}

/// Why an envelope could not be turned into a wire frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Seals `env` with the session's current key and encodes it.
///
/// `Error` envelopes stay clear while no key exists, so a peer that skipped
/// the handshake can still read why it was refused.
pub fn seal_frame(stage: &EncryptionStage, env: Envelope) -> Result<Vec<u8>, SealError> {
    let env = if env.message_type == MessageType::Error && !stage.keys().is_established() {
        env
    } else {
        stage.outbound(env)?
    };
    Ok(encode_envelope(&env)?)
}

/// Snapshot of one registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: SocketAddr,
}

struct SessionEntry {
    peer: SocketAddr,
    stage: EncryptionStage,
    outbound: mpsc::Sender<Vec<u8>>,
}

/// Shared, cloneable registry of live sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session's encryption stage and frame queue.  Replaces any
    /// previous entry with the same ID.
    pub fn register(
        &self,
        id: SessionId,
        peer: SocketAddr,
        stage: EncryptionStage,
        outbound: mpsc::Sender<Vec<u8>>,
    ) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                SessionEntry {
                    peer,
                    stage,
                    outbound,
                },
            );
        debug!("session {id} registered ({peer})");
    }

    /// Removes a session.  Returns `false` if it was not registered.
    pub fn unregister(&self, id: SessionId) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!("session {id} unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Returns a snapshot of all live sessions.
    pub fn all(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                peer: entry.peer,
            })
            .collect()
    }

    /// Queues a server-initiated envelope for one session.
    ///
    /// Returns the message ID of the queued envelope, which is sealed with
    /// the session's key before it is queued.
    ///
    /// # Errors
    ///
    /// See [`PushError`].
    pub fn push(
        &self,
        id: SessionId,
        message_type: MessageType,
        payload: impl Into<Vec<u8>>,
    ) -> Result<MessageId, PushError> {
        let env = Envelope::new(message_type, payload);
        let message_id = env.message_id;
        let (stage, outbound) = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            let entry = sessions.get(&id).ok_or(PushError::UnknownSession(id))?;
            (entry.stage.clone(), entry.outbound.clone())
        };
        let frame = seal_frame(&stage, env).map_err(|source| match source {
            SealError::Pipeline(PipelineError::SessionNotEstablished { .. }) => {
                PushError::NotEstablished(id)
            }
            source => PushError::Seal { id, source },
        })?;
        outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::QueueFull(id),
            mpsc::error::TrySendError::Closed(_) => PushError::Closed(id),
        })?;
        Ok(message_id)
    }

    /// Queues the same payload for every live session.
    ///
    /// Each session gets its own envelope (and message ID).  Returns how many
    /// sessions accepted it; failures are logged and skipped.
    pub fn broadcast(&self, message_type: MessageType, payload: &[u8]) -> usize {
        let ids: Vec<SessionId> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.into_iter()
            .filter(|id| match self.push(*id, message_type, payload.to_vec()) {
                Ok(_) => true,
                Err(e) => {
                    warn!("broadcast skipped: {e}");
                    false
                }
            })
            .count()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chat_core::{decode_envelope, SessionKey, SessionKeyStore};
    use uuid::Uuid;

    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.1:50000".parse().unwrap()
    }

    /// A stage that lets envelopes through in clear.
    fn clear_stage() -> EncryptionStage {
        EncryptionStage::new(Arc::new(SessionKeyStore::new()), false)
    }

    fn keyed_stage() -> EncryptionStage {
        let keys = Arc::new(SessionKeyStore::new());
        keys.install(SessionKey::generate());
        EncryptionStage::new(keys, true)
    }

    fn unkeyed_stage() -> EncryptionStage {
        EncryptionStage::new(Arc::new(SessionKeyStore::new()), true)
    }

    fn decode(frame: &[u8]) -> Envelope {
        decode_envelope(frame).unwrap().0
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.all().is_empty());
    }

    #[tokio::test]
    async fn test_push_reaches_registered_session() {
        // Arrange
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(id, peer(), clear_stage(), tx);

        // Act
        let message_id = registry
            .push(id, MessageType::Notification, b"ping".to_vec())
            .unwrap();

        // Assert
        let env = decode(&rx.recv().await.unwrap());
        assert_eq!(env.message_id, message_id);
        assert_eq!(env.message_type, MessageType::Notification);
        assert_eq!(env.payload, b"ping".to_vec());
    }

    #[tokio::test]
    async fn test_push_to_keyed_session_is_sealed_when_queued() {
        // Arrange
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let stage = keyed_stage();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(id, peer(), stage.clone(), tx);

        // Act
        registry
            .push(id, MessageType::Notification, b"secret".to_vec())
            .unwrap();

        // Assert
        let env = decode(&rx.recv().await.unwrap());
        assert!(env.flags.is_encrypted());
        assert_eq!(stage.inbound(env).unwrap().payload, b"secret".to_vec());
    }

    #[test]
    fn test_push_before_key_exchange_is_refused() {
        // Arrange
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(id, peer(), unkeyed_stage(), tx);

        // Act
        let result = registry.push(id, MessageType::Notification, b"early".to_vec());

        // Assert
        assert_eq!(result, Err(PushError::NotEstablished(id)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_error_frame_stays_clear_until_key_exists() {
        // Arrange
        let keys = Arc::new(SessionKeyStore::new());
        let stage = EncryptionStage::new(Arc::clone(&keys), true);
        let refusal = Envelope::new(MessageType::Error, b"handshake first".to_vec());

        // Act
        let before = decode(&seal_frame(&stage, refusal.clone()).unwrap());
        keys.install(SessionKey::generate());
        let after = decode(&seal_frame(&stage, refusal).unwrap());

        // Assert
        assert!(!before.flags.is_encrypted());
        assert_eq!(before.payload, b"handshake first".to_vec());
        assert!(after.flags.is_encrypted());
    }

    #[test]
    fn test_push_to_unknown_session_fails() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        assert_eq!(
            registry.push(id, MessageType::Notification, Vec::new()),
            Err(PushError::UnknownSession(id))
        );
    }

    #[test]
    fn test_push_to_full_queue_fails_without_blocking() {
        // Arrange
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(1);
        registry.register(id, peer(), clear_stage(), tx);
        registry
            .push(id, MessageType::Notification, Vec::new())
            .unwrap();

        // Act
        let second = registry.push(id, MessageType::Notification, Vec::new());

        // Assert
        assert_eq!(second, Err(PushError::QueueFull(id)));
    }

    #[test]
    fn test_push_to_closed_session_fails() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(1);
        registry.register(id, peer(), clear_stage(), tx);
        drop(rx);

        assert_eq!(
            registry.push(id, MessageType::Notification, Vec::new()),
            Err(PushError::Closed(id))
        );
    }

    #[tokio::test]
    async fn test_broadcast_counts_accepting_sessions() {
        // Arrange: two live sessions and one whose receiver is gone
        let registry = SessionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let (tx_dead, rx_dead) = mpsc::channel(4);
        registry.register(Uuid::new_v4(), peer(), clear_stage(), tx_a);
        registry.register(Uuid::new_v4(), peer(), clear_stage(), tx_b);
        registry.register(Uuid::new_v4(), peer(), clear_stage(), tx_dead);
        drop(rx_dead);

        // Act
        let delivered = registry.broadcast(MessageType::Notification, b"all");

        // Assert
        assert_eq!(delivered, 2);
        let a = decode(&rx_a.recv().await.unwrap());
        let b = decode(&rx_b.recv().await.unwrap());
        assert_eq!(a.payload, b"all".to_vec());
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_unregister_removes_session() {
        let registry = SessionRegistry::new();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(1);
        registry.register(id, peer(), clear_stage(), tx);

        assert!(registry.unregister(id));
        assert!(!registry.contains(id));
        assert!(!registry.unregister(id));
    }
}
