//! CLI entry point for the relay server.
//!
//! Loads a TOML config file (with a couple of overridable flags), wires
//! up `tracing-subscriber`, and runs [`relay::server::Server`] until
//! `SIGTERM`/Ctrl-C requests a graceful shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use netbird_relay::relay::config::ServerConfig;
use netbird_relay::relay::error::{Error, Result};
use netbird_relay::relay::server::Server;

#[derive(Parser, Debug)]
#[command(name = "relay-server", about = "NetBird-style WebSocket relay server")]
struct Cli {
    /// Path to the server's TOML configuration file.
    #[arg(long, env = "RELAY_CONFIG")]
    config: PathBuf,

    /// Overrides `listen_address` from the config file.
    #[arg(long, env = "RELAY_LISTEN_ADDRESS")]
    listen_address: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let raw = std::fs::read_to_string(&cli.config).map_err(|e| {
        Error::Config(format!("failed to read {}: {e}", cli.config.display()))
    })?;
    let mut config = ServerConfig::from_toml_str(&raw)?;
    if let Some(addr) = cli.listen_address {
        config.listen_address = addr;
    }

    let server = Arc::new(Server::new(config));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received");
        shutdown_server.request_shutdown();
    });

    server.run().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
