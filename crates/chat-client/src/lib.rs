//! chat-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does chat-client do? (for beginners)
//!
//! The client keeps one long-lived TCP connection to the chat server and
//! turns it into a request/response API:
//!
//! 1. [`ConnectionManager::connect`] opens the socket and runs the RSA + AES
//!    key exchange, so every later application message is sealed with
//!    AES-256-GCM.
//! 2. [`ConnectionManager::request`] sends an envelope and resolves with the
//!    reply whose `reply_to` matches it.  Many requests may be in flight at
//!    once; replies are matched by message ID, not by arrival order.
//! 3. Messages the server pushes on its own (notifications, incoming chat
//!    messages) arrive as [`chat_core::InboundMessage`] values on the
//!    receiver returned by [`ConnectionManager::new`].
//! 4. When the connection drops, the manager reconnects with exponential
//!    backoff and runs a fresh key exchange.

/// Application layer: state machine, correlation, backoff and key exchange.
pub mod application;

/// Infrastructure layer: sockets, read/write loops and configuration files.
pub mod infrastructure;

pub use application::backoff::ReconnectPolicy;
pub use application::connection_state::{ConnectionError, ConnectionListener, ConnectionState};
pub use application::correlator::{PendingReply, RequestCorrelator, TransportError};
pub use application::key_exchange::{HandshakeError, HandshakeStep, KeyExchange};
pub use infrastructure::network::{ConnectionManager, Connector, TcpConnector};
pub use infrastructure::storage::config::{ClientConfig, ConfigError};
