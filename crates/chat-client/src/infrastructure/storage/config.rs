//! TOML configuration for the client.
//!
//! ```toml
//! [connection]
//! host = "chat.example.net"
//! port = 9000
//! request_timeout_ms = 30000
//! require_encryption = true
//!
//! [reconnect]
//! base_delay_ms = 5000
//! max_attempts = 10
//! ```
//!
//! Every field has a serde default, so an empty file (or no file at all)
//! yields [`ClientConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::backoff::ReconnectPolicy;

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
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

/// Where to connect and how long to wait.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-request reply timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Timeout for each of the two key exchange round-trips.
    #[serde(default = "default_handshake_step_timeout_ms")]
    pub handshake_step_timeout_ms: u64,
    /// Refuse to send or accept application traffic in clear.
    #[serde(default = "default_true")]
    pub require_encryption: bool,
}

/// Automatic reconnection schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconnectSettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_handshake_step_timeout_ms() -> u64 {
    5_000
}
fn default_true() -> bool {
    true
}
fn default_base_delay_ms() -> u64 {
    5_000
}
fn default_max_delay_ms() -> u64 {
    300_000
}
fn default_max_attempts() -> u32 {
    10
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            handshake_step_timeout_ms: default_handshake_step_timeout_ms(),
            require_encryption: default_true(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_step_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_step_timeout_ms)
    }
}

impl ReconnectSettings {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

// ── Load / save ───────────────────────────────────────────────────────────────

impl ClientConfig {
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
    /// Returns [`ConfigError::Io`] for file-system failures or
    /// [`ConfigError::Serialize`] if serialization fails.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_documented_values() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.connection.port, 9000);
        assert_eq!(cfg.connection.request_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.connection.handshake_step_timeout(), Duration::from_secs(5));
        assert!(cfg.connection.require_encryption);
        assert_eq!(cfg.reconnect.policy(), ReconnectPolicy::default());
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        assert_eq!(ClientConfig::from_toml_str("").unwrap(), ClientConfig::default());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        // Arrange
        let text = "[connection]\nhost = \"chat.example.net\"\n\n[reconnect]\nmax_attempts = 3\n";

        // Act
        let cfg = ClientConfig::from_toml_str(text).unwrap();

        // Assert
        assert_eq!(cfg.connection.host, "chat.example.net");
        assert_eq!(cfg.connection.port, 9000);
        assert_eq!(cfg.reconnect.max_attempts, 3);
        assert_eq!(cfg.reconnect.base_delay_ms, 5_000);
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        assert!(matches!(
            ClientConfig::from_toml_str("[connection\nport = "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_save_then_load_from_disk() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("chat-client-cfg-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("client.toml");
        let mut cfg = ClientConfig::default();
        cfg.connection.port = 9443;

        // Act
        cfg.save_to_path(&path).unwrap();
        let loaded = ClientConfig::load_from_path(&path).unwrap();

        // Assert
        assert_eq!(loaded, cfg);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("chat-client-definitely-missing.toml");
        assert_eq!(ClientConfig::load_from_path(&path).unwrap(), ClientConfig::default());
    }
}
