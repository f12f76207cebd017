//! unlock-relay binary entry point.
//!
//! Usage:
//! ```bash
//! unlock-relay --config relay.toml
//! unlock-relay --bind 127.0.0.1:8080
//! unlock-relay --help
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use unlock_relay::config::Config;
use unlock_relay::http::build_router;
use unlock_relay::server::UnlockRelay;

const DEFAULT_CONFIG: &str = "relay.toml";

/// Presence and message relay for cross-device unlock approval.
#[derive(Parser, Debug)]
#[command(name = "unlock-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Override `http.bind_address`
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("unlock_relay=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    if let Some(bind) = cli.bind {
        config.http.bind_address = bind;
    }

    let relay = Arc::new(UnlockRelay::new(config).context("failed to start relay")?);
    let reaper = relay.spawn_reaper();

    let bind_address = relay.config().http.bind_address.clone();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!(
        "unlock-relay v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        bind_address
    );

    let app = build_router(relay.clone());
    let shutdown_relay = relay.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            // Ends every open SSE body so graceful shutdown can complete.
            shutdown_relay.shutdown();
        })
        .await
        .context("server error")?;

    relay.shutdown();
    if let Err(e) = reaper.await {
        tracing::warn!("Reaper task failed: {}", e);
    }
    tracing::info!("unlock-relay stopped");
    Ok(())
}

/// Load the config file; a missing default file means built-in defaults.
fn load_config(path: &std::path::Path) -> Result<Config> {
    if !path.exists() && path == std::path::Path::new(DEFAULT_CONFIG) {
        tracing::info!("No {} found, using defaults", DEFAULT_CONFIG);
        return Ok(Config::default());
    }
    Config::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}
