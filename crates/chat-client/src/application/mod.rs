//! Application layer of the chat client.
//!
//! Nothing here touches a socket directly:
//!
//! - **`backoff`** – reconnect delay schedule.
//! - **`connection_state`** – the lifecycle state enum, its errors and the
//!   listener contract.
//! - **`correlator`** – matches replies to outstanding requests by message ID.
//! - **`key_exchange`** – the client half of the RSA + AES handshake, written
//!   against a [`key_exchange::HandshakeSink`] so it can be tested without I/O.

pub mod backoff;
pub mod connection_state;
pub mod correlator;
pub mod key_exchange;
