//! Network infrastructure for the chat server.
//!
//! # Sub-modules
//!
//! - **`listener`** – binds the TCP port and spawns one session per accepted
//!   connection.
//!
//! - **`session`** – the per-connection reader and writer: handshake replies,
//!   decryption, dispatch to the handler, and sealing of replies and pushes.

pub mod listener;
pub mod session;

pub use listener::{ChatServer, ServerError};
