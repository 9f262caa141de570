//! The Hadron extended-action controller.

mod app;
mod cluster;
mod config;
mod database;
mod error;
#[cfg(test)]
mod fixtures;
mod models;
mod objects;
mod server;
mod transport;
mod utils;
mod xact;
mod xs;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let recorder = server::get_metrics_recorder(&cfg);
    metrics::set_recorder(recorder).context("error setting prometheus metrics recorder")?;

    tracing::info!(
        node_id = %cfg.node_id,
        server_port = %cfg.server_port,
        metrics_port = %cfg.metrics_port,
        cluster_size = cfg.cluster_nodes.len(),
        storage_data_path = %cfg.storage_data_path,
        "starting Hadron xact controller",
    );
    if let Err(err) = App::new(cfg).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
