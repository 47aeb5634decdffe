//! Envelope transforms applied between the application and the wire codec.

pub mod encryption_stage;
pub mod key_store;

pub use encryption_stage::{associated_data, EncryptionStage, PipelineError};
pub use key_store::SessionKeyStore;
