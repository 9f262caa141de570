//! The node's HTTP server, exposing Prometheus metrics & job status.

mod prom;

use anyhow::Result;
use axum::{extract::Extension, routing::get, AddExtensionLayer, Json, Router};
use futures::prelude::*;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::xact::{XactQuery, XactRegistry, XactSnap};

pub use prom::get_metrics_recorder;

/// Spawn the HTTP server, serving until the shutdown signal fires.
pub fn spawn_http_server(config: &Config, registry: XactRegistry, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let metrics = get_metrics_recorder(config).handle();
    let app = Router::new()
        .route("/metrics", get(prom::prometheus_scrape))
        .route("/xacts", get(list_xacts))
        .layer(AddExtensionLayer::new(metrics))
        .layer(AddExtensionLayer::new(registry));
    let server = axum::Server::bind(&([0, 0, 0, 0], config.metrics_port).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!("http server is listening at 0.0.0.0:{}", config.metrics_port);
    tokio::spawn(server.map_err(anyhow::Error::from))
}

/// List snapshots of all jobs of this node.
async fn list_xacts(Extension(registry): Extension<XactRegistry>) -> Json<Vec<XactSnap>> {
    Json(registry.snapshots(&XactQuery::default()).await)
}
