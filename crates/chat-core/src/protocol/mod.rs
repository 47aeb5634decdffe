//! Protocol module containing the envelope types, the binary codec, and the
//! streaming frame decoder.

pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::{decode_envelope, encode_envelope, ProtocolError};
pub use frame::FrameDecoder;
pub use messages::*;
