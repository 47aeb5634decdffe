//! chat-client entry point.
//!
//! Connects to a chat server, validates the session once, then logs every
//! envelope the server pushes until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! chat-client [--config client.toml] [--host chat.example.net] [--port 9000]
//! ```
//!
//! Command-line flags and `CHAT_*` environment variables override the values
//! read from the config file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chat_client::{
    ClientConfig, ConnectionListener, ConnectionManager, ConnectionState, TcpConnector,
};
use chat_core::{Envelope, MessageType};

#[derive(Parser, Debug)]
#[command(
    name = "chat-client",
    about = "Connect to a secure chat server and follow its notifications",
    version
)]
struct Args {
    /// Path to the TOML config file (missing file means defaults).
    #[arg(long, default_value = "chat-client.toml", env = "CHAT_CLIENT_CONFIG")]
    config: PathBuf,

    /// Server host name or IP address.
    #[arg(long, env = "CHAT_HOST")]
    host: Option<String>,

    /// Server TCP port.
    #[arg(long, env = "CHAT_PORT")]
    port: Option<u16>,
}

impl Args {
    fn into_client_config(self) -> anyhow::Result<ClientConfig> {
        let mut config = ClientConfig::load_from_path(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        if let Some(host) = self.host {
            config.connection.host = host;
        }
        if let Some(port) = self.port {
            config.connection.port = port;
        }
        Ok(config)
    }
}

/// Logs lifecycle events.
struct LogListener;

impl ConnectionListener for LogListener {
    fn on_state_changed(&self, old: ConnectionState, new: ConnectionState) {
        info!("connection {old} -> {new}");
    }

    fn on_reconnect_attempt(&self, attempt: u32, delay: std::time::Duration) {
        info!("reconnect attempt {attempt} in {delay:?}");
    }

    fn on_connection_error(&self, error: &chat_client::ConnectionError) {
        warn!("connection error: {error}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_client_config()?;
    let host = config.connection.host.clone();
    let port = config.connection.port;
    info!("chat-client starting; server {host}:{port}");

    let connector = Arc::new(TcpConnector::new(config.connection.connect_timeout()));
    let (manager, mut pushes) = ConnectionManager::new(&config, connector);
    manager.add_listener(Arc::new(LogListener));

    // A failed first attempt is not fatal: the manager keeps reconnecting.
    match manager.connect(&host, port).await {
        Ok(()) => {
            let probe = Envelope::new(MessageType::SessionValidateRequest, Vec::new());
            match manager.request(probe).await {
                Ok(reply) => info!(
                    "session check answered with {:?} ({} bytes)",
                    reply.message_type,
                    reply.payload.len()
                ),
                Err(e) => warn!("session check failed: {e}"),
            }
        }
        Err(e) => warn!("initial connect failed: {e}"),
    }

    loop {
        tokio::select! {
            push = pushes.recv() => match push {
                Some(message) => info!(
                    "server pushed {:?} {} ({} bytes)",
                    message.message_type,
                    message.message_id,
                    message.payload.len()
                ),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    manager.shutdown();
    info!("chat-client stopped");
    Ok(())
}
