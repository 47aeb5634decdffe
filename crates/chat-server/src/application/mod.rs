//! Application layer of the chat server.
//!
//! Contains no socket I/O:
//!
//! - **`dispatch`** – the [`dispatch::EnvelopeHandler`] trait that receives
//!   decrypted messages, plus the acknowledging demo handler.
//! - **`registry`** – the table of live sessions used to push notifications.

pub mod dispatch;
pub mod registry;
