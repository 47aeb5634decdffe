//! Infrastructure layer for the chat client.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `chat_core`, but MUST NOT be imported by the `application` layer.
//!
//! - **`network`** – the connection manager plus the TCP connector and the
//!   reader/writer loops it spawns.
//! - **`storage`** – TOML configuration.

pub mod network;
pub mod storage;
