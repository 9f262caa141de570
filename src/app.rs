use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::cluster::Membership;
use crate::config::Config;
use crate::database::Database;
use crate::objects::{Backend, DirBackend, NoBackend, ObjectStore};
use crate::server::spawn_http_server;
use crate::transport::{Collector, Transport, TransportServer};
use crate::xact::{AbortSignal, XactCtx, XactRegistry};
use crate::xs;

/// The application object for when the node is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,
    /// The registry of all jobs of this node.
    registry: XactRegistry,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the stream collector.
    collector_handle: JoinHandle<Result<()>>,
    /// The join handle of the transport server.
    transport_server: JoinHandle<Result<()>>,
    /// The join handle of the HTTP server.
    http_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);

        // Initialize this node's storage.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let store = ObjectStore::new(&config, &db).await.context("error opening object store")?;
        let backend: Arc<dyn Backend> = match &config.backend_data_path {
            Some(path) => Arc::new(DirBackend::new(path)),
            None => Arc::new(NoBackend),
        };
        let membership = Membership::from_config(&config)?;

        // Spawn the streaming transport.
        let (collector, collector_handle) = Collector::new(config.clone(), shutdown_tx.subscribe());
        let collector_handle_task = collector.spawn();
        let transport = Transport::new(config.clone(), membership.local_node_id().clone(), collector_handle);
        let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
        let transport_server = TransportServer::bind(addr, transport.clone(), shutdown_tx.clone()).await?.spawn();

        let ctx = XactCtx {
            config: config.clone(),
            store,
            backend,
            membership,
            transport,
            node_stop: AbortSignal::new(),
        };
        let registry = XactRegistry::new(ctx, xs::factories());
        let http_server = spawn_http_server(&config, registry.clone(), shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            _db: db,
            registry,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            collector_handle: collector_handle_task,
            transport_server,
            http_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine. Jobs stop first, so that they may still quiesce their transports.
        tracing::debug!("node is shutting down");
        self.registry.shutdown().await;
        let _ = self.shutdown_tx.send(());

        if let Err(err) = self.transport_server.await.context("error joining transport server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down transport server");
        }
        if let Err(err) = self.collector_handle.await.context("error joining stream collector handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down stream collector");
        }
        if let Err(err) = self.http_server.await.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }

        tracing::debug!("node shutdown complete");
        Ok(())
    }
}
