//! Downstream dispatch: what the server does with a decrypted envelope.
//!
//! The transport never interprets application payloads.  Each session calls
//! an [`EnvelopeHandler`] once per inbound message, in arrival order, and
//! sends back whatever [`Reply`] it returns under the request's message ID.

use async_trait::async_trait;
use chat_core::{InboundMessage, MessageType};
use tracing::debug;
use uuid::Uuid;

/// Identifies one accepted connection for its whole lifetime.
pub type SessionId = Uuid;

/// A response to send back on the same session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn new(message_type: MessageType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
        }
    }
}

/// Application logic behind the transport.
///
/// Implementations must be cheap to share across sessions; the same handler
/// serves every connection concurrently.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Handles one message from `session`.  `None` sends nothing back.
    async fn handle(&self, session: SessionId, message: InboundMessage) -> Option<Reply>;
}

/// Answers every request with its matching response type and the request's
/// payload; ignores everything else.
///
/// Stands in for real chat logic in the `chat-server` binary and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcknowledgeHandler;

#[async_trait]
impl EnvelopeHandler for AcknowledgeHandler {
    async fn handle(&self, session: SessionId, message: InboundMessage) -> Option<Reply> {
        let response_type = message.message_type.response_type()?;
        debug!(
            "session {session}: acknowledging {:?} {}",
            message.message_type, message.message_id
        );
        Some(Reply::new(response_type, message.payload))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
