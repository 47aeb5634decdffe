//! chat-server library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does chat-server do? (for beginners)
//!
//! The server accepts TCP connections from chat clients.  For each one it:
//!
//! 1. Answers the two handshake requests: it hands out its RSA public key,
//!    then unwraps the AES session key the client sends back.
//! 2. Decrypts every later envelope and passes it to an [`EnvelopeHandler`],
//!    one at a time and in arrival order.
//! 3. Seals the handler's reply with the same session key and sends it back
//!    under the request's message ID.
//!
//! Server-initiated notifications go through the [`SessionRegistry`].

/// Application layer: dispatch contract and the live-session registry.
pub mod application;

/// Infrastructure layer: TCP listener, sessions and configuration files.
pub mod infrastructure;

pub use application::dispatch::{AcknowledgeHandler, EnvelopeHandler, Reply, SessionId};
pub use application::registry::{PushError, SealError, SessionInfo, SessionRegistry};
pub use infrastructure::network::{ChatServer, ServerError};
pub use infrastructure::storage::config::{ConfigError, ServerConfig};
