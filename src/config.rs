//! Runtime configuration.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The ID of this node within the cluster.
    pub node_id: String,
    /// The port which cluster internal transport traffic is to use.
    pub server_port: u16,
    /// The port used to serve Prometheus metrics.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The initial cluster membership, formatted as `{id}={host}:{port}` pairs separated by commas.
    ///
    /// The local node must be part of this list.
    #[serde(deserialize_with = "Config::parse_cluster_nodes")]
    pub cluster_nodes: Vec<(String, SocketAddr)>,

    /// The path to the database & object data on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,
    /// The path to a directory used as the backing store for remote buckets.
    #[serde(default)]
    pub backend_data_path: Option<String>,

    /// The max number of in-flight objects per transport, beyond which senders block.
    #[serde(default = "Config::default_transport_burst")]
    pub transport_burst: usize,
    /// The max size in bytes of an encoded object header.
    #[serde(default = "Config::default_transport_max_header_size")]
    pub transport_max_header_size: usize,
    /// The period of the stream collector's idle sweep.
    #[serde(default = "Config::default_transport_tick_ms")]
    pub transport_tick_ms: u64,
    /// The duration after which an idle stream's connection is torn down.
    #[serde(default = "Config::default_transport_idle_teardown_ms")]
    pub transport_idle_teardown_ms: u64,

    /// The duration of inactivity after which a demand-based job stops itself.
    #[serde(default = "Config::default_xact_totally_idle_ms")]
    pub xact_totally_idle_ms: u64,
    /// The duration of inactivity after which a demand-based job reports itself as idle.
    #[serde(default = "Config::default_xact_likely_idle_ms")]
    pub xact_likely_idle_ms: u64,
    /// The duration of transport silence a job waits for before closing its transport.
    #[serde(default = "Config::default_xact_quiesce_ms")]
    pub xact_quiesce_ms: u64,
    /// The max number of constituents a job processes concurrently.
    #[serde(default = "Config::default_xact_workers")]
    pub xact_workers: usize,

    /// The max duration an archive owner waits on peer completion markers before finalizing.
    #[serde(default = "Config::default_archive_settle_timeout_ms")]
    pub archive_settle_timeout_ms: u64,
    /// The max number of names a range template of an archive request may expand to.
    #[serde(default = "Config::default_archive_max_range_names")]
    pub archive_max_range_names: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the cross-field invariants of this config.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            bail!("NODE_ID may not be empty");
        }
        if !self.cluster_nodes.iter().any(|(id, _)| id == &self.node_id) {
            bail!("CLUSTER_NODES must include this node's ID {}", self.node_id);
        }
        if self.transport_burst == 0 {
            bail!("TRANSPORT_BURST must be greater than 0");
        }
        if self.xact_workers == 0 {
            bail!("XACT_WORKERS must be greater than 0");
        }
        if self.archive_max_range_names == 0 {
            bail!("ARCHIVE_MAX_RANGE_NAMES must be greater than 0");
        }
        Ok(())
    }

    pub fn transport_tick(&self) -> Duration {
        Duration::from_millis(self.transport_tick_ms)
    }

    pub fn transport_idle_teardown(&self) -> Duration {
        Duration::from_millis(self.transport_idle_teardown_ms)
    }

    pub fn xact_totally_idle(&self) -> Duration {
        Duration::from_millis(self.xact_totally_idle_ms)
    }

    pub fn xact_likely_idle(&self) -> Duration {
        Duration::from_millis(self.xact_likely_idle_ms)
    }

    pub fn xact_quiesce(&self) -> Duration {
        Duration::from_millis(self.xact_quiesce_ms)
    }

    pub fn archive_settle_timeout(&self) -> Duration {
        Duration::from_millis(self.archive_settle_timeout_ms)
    }

    /// Parse the cluster node list from the config source.
    fn parse_cluster_nodes<'de, D: Deserializer<'de>>(val: D) -> Result<Vec<(String, SocketAddr)>, D::Error> {
        let raw: String = Deserialize::deserialize(val)?;
        parse_node_list(&raw).map_err(|err| DeError::custom(format!("error parsing CLUSTER_NODES: {:#}", err)))
    }

    fn default_metrics_port() -> u16 {
        7002
    }
    fn default_transport_burst() -> usize {
        32
    }
    fn default_transport_max_header_size() -> usize {
        4096
    }
    fn default_transport_tick_ms() -> u64 {
        1_000
    }
    fn default_transport_idle_teardown_ms() -> u64 {
        4_000
    }
    fn default_xact_totally_idle_ms() -> u64 {
        5 * 60 * 1_000
    }
    fn default_xact_likely_idle_ms() -> u64 {
        4_000
    }
    fn default_xact_quiesce_ms() -> u64 {
        2_000
    }
    fn default_xact_workers() -> usize {
        8
    }
    fn default_archive_settle_timeout_ms() -> u64 {
        30_000
    }
    fn default_archive_max_range_names() -> u64 {
        100_000
    }
}

/// Parse a list of `{id}={host}:{port}` pairs separated by commas.
pub fn parse_node_list(raw: &str) -> Result<Vec<(String, SocketAddr)>> {
    let mut nodes = vec![];
    for pair in raw.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let (id, addr) = pair.split_once('=').with_context(|| format!("expected `id=host:port`, got {}", pair))?;
        if id.is_empty() {
            bail!("empty node ID in pair {}", pair);
        }
        let addr: SocketAddr = addr.parse().with_context(|| format!("invalid socket address for node {}", id))?;
        if nodes.iter().any(|(other, _): &(String, SocketAddr)| other == id) {
            bail!("duplicate node ID {}", id);
        }
        nodes.push((id.to_string(), addr));
    }
    Ok(nodes)
}

#[cfg(test)]
impl Config {
    /// Create a config instance for testing, rooted in a new temp dir.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let config = Self::new_test_node("node-0", "127.0.0.1:0".parse()?, &tmpdir)?;
        Ok((std::sync::Arc::new(config), tmpdir))
    }

    /// Create a config instance for a test node rooted under the given temp dir.
    ///
    /// Timings are shortened so that multi-node scenarios settle quickly.
    pub fn new_test_node(node_id: &str, addr: SocketAddr, tmpdir: &tempfile::TempDir) -> Result<Self> {
        Ok(Self {
            rust_log: "".into(),
            node_id: node_id.into(),
            server_port: addr.port(),
            metrics_port: 0,
            cluster_nodes: vec![(node_id.into(), addr)],
            storage_data_path: tmpdir.path().join(node_id).to_string_lossy().to_string(),
            backend_data_path: None,
            transport_burst: 32,
            transport_max_header_size: 4096,
            transport_tick_ms: 50,
            transport_idle_teardown_ms: 200,
            xact_totally_idle_ms: 2_000,
            xact_likely_idle_ms: 100,
            xact_quiesce_ms: 100,
            xact_workers: 4,
            archive_settle_timeout_ms: 5_000,
            archive_max_range_names: 10_000,
        })
    }
}
