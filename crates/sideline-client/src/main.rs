//! # Sideline
//!
//! Headless device client: connects to the alert service as one identity
//! and logs every emergency and channel change.
//!
//! ## Usage
//!
//! ```bash
//! # Run with sideline.toml from a default location
//! sideline
//!
//! # Run with a specific config file
//! sideline /path/to/sideline.toml
//!
//! # Run with environment variables
//! SIDELINE__IDENTITY__ID=7 SIDELINE__IDENTITY__ROLE=coach sideline
//! ```

use anyhow::{Context, Result};
use sideline_client::{metrics, ClientConfig, Dispatcher};
use sideline_transport::FallbackConnector;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sideline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = match path {
        Some(path) => ClientConfig::load_from(Some(&path))?,
        None => ClientConfig::load()?,
    };
    let identity = config
        .identity
        .clone()
        .context("No identity configured (set [identity] or SIDELINE__IDENTITY__ID/ROLE)")?;

    metrics::init_metrics();
    if config.metrics.enabled {
        metrics::start_metrics_server(config.metrics.port)?;
    }

    let connector = FallbackConnector::from_endpoints(
        config.service.endpoints.iter().cloned(),
        &config.websocket_template(),
    );
    let dispatcher = Dispatcher::with_options(
        identity.clone(),
        Arc::new(connector),
        config.dispatch_options(),
    );

    tracing::info!(%identity, endpoints = ?config.service.endpoints, "Starting Sideline client");

    let mut changes = dispatcher.subscribe();
    let mut states = dispatcher.watch_channel();
    dispatcher.connect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            change = changes.recv() => match change {
                Ok(change) => {
                    tracing::info!(change = change.kind(), session = ?change.session(), "Session change");
                    if let Some(summary) = dispatcher.summary() {
                        tracing::info!(?summary, destination = ?dispatcher.destination(), "Current emergency");
                    }
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Missed session changes"),
                Err(RecvError::Closed) => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                tracing::info!(%state, "Channel state");
            }
        }
    }

    dispatcher.close().await;
    Ok(())
}
