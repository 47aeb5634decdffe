//! chat-server entry point.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load ServerConfig (file, then CLI overrides)
//!  └─ generate the RSA key pair (blocking pool)
//!  └─ ChatServer::bind()
//!  └─ ChatServer::run()      -- one session task per connection
//!       └─ Ctrl-C            -- flips the shutdown watch channel
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chat_core::ServerKeyPair;
use chat_server::{AcknowledgeHandler, ChatServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(
    name = "chat-server",
    about = "Serve the secure chat transport over TCP",
    version
)]
struct Args {
    /// Path to the TOML config file (missing file means defaults).
    #[arg(long, default_value = "chat-server.toml", env = "CHAT_SERVER_CONFIG")]
    config: PathBuf,

    /// Address to listen on, e.g. `0.0.0.0:9000`.
    #[arg(long, env = "CHAT_BIND")]
    bind: Option<String>,

    /// RSA modulus size for the generated key pair.
    #[arg(long, env = "CHAT_RSA_BITS")]
    rsa_bits: Option<usize>,
}

impl Args {
    fn into_server_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = ServerConfig::load_from_path(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(bits) = self.rsa_bits {
            config.rsa_key_bits = bits;
        }
        config.validate().context("validating configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_server_config()?;
    info!("chat-server starting on {}", config.bind_address);

    let bits = config.rsa_key_bits;
    info!("generating {bits}-bit RSA key pair");
    let keypair = tokio::task::spawn_blocking(move || ServerKeyPair::generate(bits))
        .await
        .context("key generation task panicked")?
        .context("generating RSA key pair")?;

    let server = ChatServer::bind(&config, Arc::new(keypair), Arc::new(AcknowledgeHandler))
        .await
        .context("starting server")?;

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                // Dropping the sender would stop the server
                warn!("could not listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        }
    });

    server.run(stop_rx).await;
    Ok(())
}
