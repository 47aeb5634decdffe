//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML file, fills in defaults for
//! anything missing, and validates what serde cannot.

pub mod config;
