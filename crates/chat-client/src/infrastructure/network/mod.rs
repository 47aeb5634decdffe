//! Network infrastructure for the chat client.
//!
//! - `connector` opens byte streams (TCP in production, in-memory pipes in
//!   tests).
//! - `session` runs the per-socket reader and writer loops.
//! - `connection_manager` ties them to the state machine, the key exchange
//!   and the request correlator.

pub mod connection_manager;
pub mod connector;
pub mod session;

pub use connection_manager::ConnectionManager;
pub use connector::{BoxedStream, Connector, Stream, TcpConnector};
