//! # Sideline Relay
//!
//! Alert service for Sideline devices: fans emergencies out to athletes and
//! staff by role and relays responder updates back.
//!
//! ```bash
//! sideline-relay                       # first sideline-relay.toml found
//! sideline-relay ./stadium-relay.toml  # explicit file
//! SIDELINE_RELAY__PORT=8080 sideline-relay
//! ```

mod config;
mod handlers;
mod hub;
mod metrics;

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "sideline_relay=info".into()))
        .with(fmt::layer())
        .init();

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    let addr = config.bind_addr()?;

    metrics::init_metrics();
    if config.metrics.enabled {
        metrics::start_metrics_server(config.metrics.port)
            .context("Failed to start metrics server")?;
    }

    info!(%addr, max_message_size = config.max_message_size, "Starting Sideline relay");
    handlers::run_server(config).await
}
