//! Cluster membership & placement.

mod hrw;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;

use crate::config::Config;

pub use hrw::resolve;

/// The ID of a node in the cluster.
pub type NodeId = Arc<String>;

/// A cluster node descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// The ID of the node.
    pub id: NodeId,
    /// The address of the node's transport listener.
    pub addr: SocketAddr,
    /// The placement digest of the node, derived from its ID.
    pub digest: u64,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, addr: SocketAddr) -> Self {
        let id: String = id.into();
        let digest = seahash::hash(id.as_bytes());
        Self { id: Arc::new(id), addr, digest }
    }
}

/// An immutable snapshot of the cluster's membership.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterView {
    /// The version of this view; newer views always carry a greater version.
    pub version: u64,
    /// All member nodes, indexed by ID.
    pub nodes: BTreeMap<NodeId, Arc<NodeInfo>>,
}

impl ClusterView {
    /// Create a new view from the given nodes.
    pub fn new(version: u64, nodes: impl IntoIterator<Item = NodeInfo>) -> Self {
        let nodes = nodes.into_iter().map(|node| (node.id.clone(), Arc::new(node))).collect();
        Self { version, nodes }
    }

    /// Get a node by ID.
    pub fn get(&self, id: &str) -> Option<&Arc<NodeInfo>> {
        self.nodes.get(&id.to_string())
    }

    /// Build a copy of this view without the given node, bumping the version.
    pub fn without(&self, id: &str) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.remove(&id.to_string());
        Self { version: self.version + 1, nodes }
    }
}

/// The membership service of this node.
///
/// Views are swapped atomically; readers always observe a complete snapshot.
#[derive(Clone)]
pub struct Membership {
    local: Arc<NodeInfo>,
    view: Arc<ArcSwap<ClusterView>>,
}

impl Membership {
    /// Create a new instance.
    pub fn new(local: NodeInfo, view: ClusterView) -> Self {
        Self {
            local: Arc::new(local),
            view: Arc::new(ArcSwap::from_pointee(view)),
        }
    }

    /// Create a new instance from the runtime config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let nodes: Vec<_> = config.cluster_nodes.iter().map(|(id, addr)| NodeInfo::new(id.as_str(), *addr)).collect();
        let local = nodes
            .iter()
            .find(|node| node.id.as_str() == config.node_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("local node {} is not part of the configured cluster", config.node_id))?;
        Ok(Self::new(local, ClusterView::new(1, nodes)))
    }

    /// The current cluster view.
    pub fn current_view(&self) -> Arc<ClusterView> {
        self.view.load_full()
    }

    /// The local node's ID.
    pub fn local_node_id(&self) -> &NodeId {
        &self.local.id
    }

    /// Install a new cluster view, ignoring views older than the current one.
    ///
    /// Returns `true` if the given view was installed.
    pub fn update(&self, view: ClusterView) -> bool {
        let current = self.view.load();
        if view.version <= current.version {
            tracing::debug!(current = current.version, given = view.version, "ignoring stale cluster view");
            return false;
        }
        tracing::info!(version = view.version, nodes = view.nodes.len(), "installing new cluster view");
        self.view.store(Arc::new(view));
        true
    }
}
