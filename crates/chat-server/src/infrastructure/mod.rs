//! Infrastructure layer for the chat server.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `chat_core`, but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod storage;
