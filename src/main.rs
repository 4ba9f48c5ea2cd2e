//! Warden DNS proxy - entry point.
//!
//! Loads the configuration, builds the engine, binds the listeners, and
//! serves until interrupted. Exits 0 on a clean shutdown and 1 on any
//! startup error.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use warden::{server, Config, Engine};

async fn run() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "warden.yml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    info!("Starting warden DNS proxy...");
    info!("Home directory: {}", config.home.display());
    info!("Resolvers: {}", config.resolvers.len());
    info!("Lists: {}", config.lists.len());

    let engine = Arc::new(Engine::build(&config).context("Failed to build engine")?);

    let listeners = server::spawn_listeners(Arc::clone(&engine), &config)
        .await
        .context("Failed to bind listeners")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for interrupt")?;
    info!("Interrupt received, shutting down...");

    // stop taking queries, then let the engine drain its recorder
    for listener in &listeners {
        listener.abort();
    }
    engine.shutdown().await;

    info!("Shutdown complete.");
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(err) = run().await {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}
