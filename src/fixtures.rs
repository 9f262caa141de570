use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::prelude::*;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cluster::{self, ClusterView, Membership, NodeInfo};
use crate::config::Config;
use crate::database::Database;
use crate::models::Bucket;
use crate::objects::{Backend, DirBackend, ObjectStore};
use crate::transport::{Collector, Transport, TransportServer};
use crate::xact::{AbortSignal, XactCtx, XactQuery, XactRegistry, XactSnap};
use crate::xs;

/// A node running only the streaming transport.
pub struct TransportNode {
    pub config: Arc<Config>,
    pub info: NodeInfo,
    pub transport: Transport,
    pub shutdown_tx: broadcast::Sender<()>,
    _collector: JoinHandle<Result<()>>,
    _server: JoinHandle<Result<()>>,
}

impl TransportNode {
    /// Start a transport node listening on an ephemeral loopback port.
    pub async fn new(id: &str, tmpdir: &tempfile::TempDir, tweak: impl FnOnce(&mut Config)) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.context("error binding test listener")?;
        let addr = listener.local_addr()?;
        let mut config = Config::new_test_node(id, addr, tmpdir)?;
        tweak(&mut config);
        Self::with_listener(Arc::new(config), listener)
    }

    fn with_listener(config: Arc<Config>, listener: TcpListener) -> Result<Self> {
        let addr = listener.local_addr()?;
        let info = NodeInfo::new(config.node_id.as_str(), addr);
        let (shutdown_tx, _) = broadcast::channel(10);
        let (collector, collector_handle) = Collector::new(config.clone(), shutdown_tx.subscribe());
        let transport = Transport::new(config.clone(), info.id.clone(), collector_handle);
        let server = TransportServer::new(listener, transport.clone(), shutdown_tx.clone());
        Ok(Self {
            config,
            info,
            transport,
            shutdown_tx,
            _collector: collector.spawn(),
            _server: server.spawn(),
        })
    }
}

impl Drop for TransportNode {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// A fully wired node of a test cluster.
pub struct TestNode {
    pub net: TransportNode,
    pub store: ObjectStore,
    pub membership: Membership,
    pub registry: XactRegistry,
    _db: Database,
}

impl TestNode {
    pub fn id(&self) -> &str {
        self.net.info.id.as_str()
    }
}

/// An in-process cluster whose nodes talk over loopback TCP.
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub tmpdir: tempfile::TempDir,
}

impl TestCluster {
    /// Start a cluster of the given size; nodes share a backend directory for remote buckets.
    pub async fn new(size: usize, tweak: impl Fn(&mut Config)) -> Result<Self> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let backend_path = tmpdir.path().join("backend");
        tokio::fs::create_dir_all(&backend_path).await?;

        let mut listeners = vec![];
        for idx in 0..size {
            let listener = TcpListener::bind("127.0.0.1:0").await.context("error binding test listener")?;
            listeners.push((format!("node-{}", idx), listener));
        }
        let cluster_nodes = listeners
            .iter()
            .map(|(id, listener)| Ok((id.clone(), listener.local_addr()?)))
            .collect::<Result<Vec<_>>>()?;

        let mut nodes = vec![];
        for (id, listener) in listeners {
            let mut config = Config::new_test_node(&id, listener.local_addr()?, &tmpdir)?;
            config.cluster_nodes = cluster_nodes.clone();
            config.backend_data_path = Some(backend_path.to_string_lossy().to_string());
            tweak(&mut config);
            config.validate()?;
            let config = Arc::new(config);

            let db = Database::new(config.clone()).await?;
            let store = ObjectStore::new(&config, &db).await?;
            let membership = Membership::from_config(&config)?;
            let net = TransportNode::with_listener(config.clone(), listener)?;
            let backend: Arc<dyn Backend> = Arc::new(DirBackend::new(&backend_path));
            let ctx = XactCtx {
                config: config.clone(),
                store: store.clone(),
                backend,
                membership: membership.clone(),
                transport: net.transport.clone(),
                node_stop: AbortSignal::new(),
            };
            let registry = XactRegistry::new(ctx, xs::factories());
            nodes.push(TestNode {
                net,
                store,
                membership,
                registry,
                _db: db,
            });
        }
        Ok(Self { nodes, tmpdir })
    }

    /// The current cluster view, as seen by the first node.
    pub fn view(&self) -> Arc<ClusterView> {
        self.nodes[0].membership.current_view()
    }

    pub fn node(&self, id: &str) -> Result<&TestNode> {
        self.nodes.iter().find(|node| node.id() == id).with_context(|| format!("no test node {}", id))
    }

    /// The node owning the given placement key.
    pub fn owner_of(&self, key: &str) -> Result<&TestNode> {
        let owner = cluster::resolve(key.as_bytes(), &self.view())?;
        self.node(owner.id.as_str())
    }

    /// Create the given bucket on every node.
    pub async fn create_bucket(&self, bucket: &Bucket) -> Result<()> {
        for node in self.nodes.iter() {
            node.store.create_bucket(bucket).await?;
        }
        Ok(())
    }

    /// Write an object of random content to the given node, returning its content.
    pub async fn put_random(&self, node: &str, bucket: &Bucket, name: &str, size: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; size];
        rand::thread_rng().fill(data.as_mut_slice());
        self.node(node)?.store.put_object(bucket, name, &mut data.as_slice()).await?;
        Ok(data)
    }

    /// Wait until the given predicate holds for the snapshots of every node's jobs.
    pub async fn wait_for_jobs(&self, query: &XactQuery, timeout: Duration, pred: impl Fn(&[XactSnap]) -> bool) -> Result<Vec<Vec<XactSnap>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut all = vec![];
            for node in self.nodes.iter() {
                all.push(node.registry.snapshots(query).await);
            }
            if all.iter().all(|snaps| pred(snaps)) {
                return Ok(all);
            }
            if Instant::now() >= deadline {
                anyhow::bail!("timeout waiting on jobs, last snapshots: {:#?}", all);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
