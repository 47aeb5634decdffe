//! TOML configuration for the chat server.
//!
//! ```toml
//! bind_address = "0.0.0.0:9000"
//! rsa_key_bits = 2048
//! outbound_queue_depth = 256
//! require_encryption = true
//! ```
//!
//! # Serde default values (for beginners)
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return value
//! of `some_fn()` when the field is absent from the TOML file.  The server
//! therefore starts with no config file at all, and an older file that lacks
//! newer fields still loads.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest RSA modulus the server accepts.
pub const MIN_RSA_KEY_BITS: usize = 1024;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// `ip:port` the listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Modulus size of the RSA key pair generated at start-up.
    #[serde(default = "default_rsa_key_bits")]
    pub rsa_key_bits: usize,
    /// Frames queued per session before pushes are refused.
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,
    /// Answer clear-text application traffic with an `Error` envelope.
    #[serde(default = "default_true")]
    pub require_encryption: bool,
}

fn default_bind_address() -> String {
    "0.0.0.0:9000".to_string()
}
fn default_rsa_key_bits() -> usize {
    chat_core::crypto::rsa_keys::DEFAULT_KEY_BITS
}
fn default_outbound_queue_depth() -> usize {
    256
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            rsa_key_bits: default_rsa_key_bits(),
            outbound_queue_depth: default_outbound_queue_depth(),
            require_encryption: default_true(),
        }
    }
}

impl ServerConfig {
    /// Parses [`bind_address`](Self::bind_address).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if it is not an `ip:port` pair.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_address
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                field: "bind_address",
                reason: e.to_string(),
            })
    }

    /// Checks the values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;
        if self.rsa_key_bits < MIN_RSA_KEY_BITS {
            return Err(ConfigError::Invalid {
                field: "rsa_key_bits",
                reason: format!("must be at least {MIN_RSA_KEY_BITS}"),
            });
        }
        if self.outbound_queue_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "outbound_queue_depth",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the TOML is malformed.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Loads the config at `path`, returning the defaults if the file does not
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for file-system errors other than "not
    /// found", and [`ConfigError::Parse`] if the TOML is malformed.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Writes the config to `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Serialize`].
    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
