//! Connection state machine types and the listener contract.
//!
//! ```text
//!                 connect()
//!  Disconnected ───────────► Connecting ──ok──► Connected
//!        ▲                     │   ▲               │
//!        │ disconnect()   fail │   │ timer         │ lost
//!        │                     ▼   │               │
//!        └──────────────────  Error ──► Reconnecting
//!                              ▲ (attempts exhausted: stays here)
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chat_core::{PipelineError, ProtocolError};
use thiserror::Error;
use tracing::error;

use crate::application::key_exchange::HandshakeError;

/// Lifecycle state of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    /// `true` for states in which `connect` is rejected.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Errors reported by the connection manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("host must not be blank")]
    InvalidHost,

    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("already connected or connecting")]
    AlreadyConnected,

    #[error("connection manager has been shut down")]
    ShutDown,

    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("key exchange failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// The byte stream is corrupt (bad magic or oversized frame).
    #[error("framing error: {0}")]
    Framing(#[from] ProtocolError),

    /// An inbound payload failed authentication.
    #[error("decryption error: {0}")]
    Decryption(PipelineError),

    #[error("connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),

    /// The reconnect budget is spent; only an explicit `connect` restarts.
    #[error("gave up after {attempts} reconnect attempts")]
    AttemptsExhausted { attempts: u32 },

    /// A manual disconnect interrupted the attempt.
    #[error("connection attempt cancelled")]
    Cancelled,
}

/// Observer of connection lifecycle events.
///
/// Callbacks run on whichever task committed the transition, after the state
/// lock is released.  They must return quickly; a panic is caught and logged.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionListener: Send + Sync {
    fn on_state_changed(&self, _old: ConnectionState, _new: ConnectionState) {}

    fn on_reconnect_attempt(&self, _attempt: u32, _delay: Duration) {}

    fn on_connection_error(&self, _error: &ConnectionError) {}
}

/// A lifecycle event waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Notice {
    State(ConnectionState, ConnectionState),
    ReconnectAttempt(u32, Duration),
    Error(ConnectionError),
}

/// The listener list of one connection manager.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
}

impl ListenerSet {
    pub fn add(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn clear(&self) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `notices` in order to every listener.
    pub(crate) fn deliver(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let snapshot: Vec<Arc<dyn ConnectionListener>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for notice in &notices {
            for listener in &snapshot {
                let outcome = catch_unwind(AssertUnwindSafe(|| match notice {
                    Notice::State(old, new) => listener.on_state_changed(*old, *new),
                    Notice::ReconnectAttempt(attempt, delay) => {
                        listener.on_reconnect_attempt(*attempt, *delay)
                    }
                    Notice::Error(err) => listener.on_connection_error(err),
                }));
                if outcome.is_err() {
                    error!("connection listener panicked while handling {notice:?}");
                }
            }
        }
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use mockall::Sequence;

    use super::*;

    #[test]
    fn test_notices_are_delivered_in_order() {
        // Arrange
        let mut mock = MockConnectionListener::new();
        let mut seq = Sequence::new();
        mock.expect_on_state_changed()
            .with(eq(ConnectionState::Disconnected), eq(ConnectionState::Connecting))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        mock.expect_on_connection_error()
            .withf(|e| *e == ConnectionError::Closed)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        mock.expect_on_reconnect_attempt()
            .with(eq(1), eq(Duration::ZERO))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        let set = ListenerSet::default();
        set.add(Arc::new(mock));

        // Act
        set.deliver(vec![
            Notice::State(ConnectionState::Disconnected, ConnectionState::Connecting),
            Notice::Error(ConnectionError::Closed),
            Notice::ReconnectAttempt(1, Duration::ZERO),
        ]);
    }

    struct Panicky;

    impl ConnectionListener for Panicky {
        fn on_state_changed(&self, _old: ConnectionState, _new: ConnectionState) {
            panic!("listener bug");
        }
    }

    #[derive(Default)]
    struct Counting(std::sync::atomic::AtomicUsize);

    impl ConnectionListener for Counting {
        fn on_state_changed(&self, _old: ConnectionState, _new: ConnectionState) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        // Arrange
        let steady = Arc::new(Counting::default());
        let set = ListenerSet::default();
        set.add(Arc::new(Panicky));
        set.add(steady.clone());

        // Act: no panic escapes
        set.deliver(vec![Notice::State(
            ConnectionState::Connecting,
            ConnectionState::Connected,
        )]);

        // Assert
        assert_eq!(steady.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_removes_all_listeners() {
        let counting = Arc::new(Counting::default());
        let set = ListenerSet::default();
        set.add(counting.clone());
        set.clear();
        set.deliver(vec![Notice::State(
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        )]);
        assert!(set.is_empty());
        assert_eq!(counting.0.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connect_rejected_only_while_active() {
        assert!(ConnectionState::Connected.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(!ConnectionState::Reconnecting.is_active());
        assert!(!ConnectionState::Error.is_active());
    }
}
