use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::command::template::Templater;
use crate::error::{Result, TewError};

pub const NODE_BOOTSTRAPPER: &str = "bootstrapper";
pub const NODE_CONTROLLER: &str = "controller";
pub const NODE_WORKER: &str = "worker";
pub const NODE_STORAGE: &str = "storage";

pub const FEATURE_STORAGE: &str = "storage";
pub const FEATURE_MONITORING: &str = "monitoring";
pub const FEATURE_LOGGING: &str = "logging";
pub const FEATURE_BACKUP: &str = "backup";
pub const FEATURE_SHOWCASE: &str = "showcase";
pub const FEATURE_INGRESS: &str = "ingress";
pub const FEATURE_PACKAGING: &str = "packaging";

pub const PORT_VIP_RAFT_CONTROLLER: u16 = 16277;
pub const PORT_VIP_RAFT_WORKER: u16 = 16728;

pub const HOST_BINARIES_DIRECTORY: &str = "host-binaries";

/// Role/category tags attached to nodes, servers and commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Labels(pub Vec<String>);

impl Labels {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(labels.into_iter().map(Into::into).collect())
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.0.iter().any(|l| l == label)
    }

    /// True when at least one of `required` is carried by these labels.
    pub fn has_labels(&self, required: &Labels) -> bool {
        required.0.iter().any(|label| self.has_label(label))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Label match between a node and a server/command declaration.
pub fn compare_labels(node_labels: &Labels, required: &Labels) -> bool {
    node_labels.has_labels(required)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    pub ip: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub os: String,
}

impl Node {
    pub fn is_controller(&self) -> bool {
        self.labels.has_label(NODE_CONTROLLER)
    }

    pub fn is_worker(&self) -> bool {
        self.labels.has_label(NODE_WORKER)
    }
}

/// A long-running local process managed by the supervisor.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub labels: Labels,
    pub command: String,
    /// Rendered as `--key=value`, ordered by key.
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// A provisioning step executed once per run, in declaration order.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub labels: Labels,
    /// Empty means any OS.
    #[serde(default)]
    pub os: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Timing of the VIP leader election.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ElectionTiming {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Pause between campaigns after a backend error.
    pub retry_interval_ms: u64,
}

impl Default for ElectionTiming {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 1000,
            election_timeout_max_ms: 2000,
            heartbeat_interval_ms: 250,
            retry_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    #[serde(default = "default_assets_directory")]
    pub assets_directory: PathBuf,
    #[serde(default)]
    pub controller_virtual_ip: String,
    #[serde(default)]
    pub controller_virtual_ip_interface: String,
    #[serde(default)]
    pub worker_virtual_ip: String,
    #[serde(default)]
    pub worker_virtual_ip_interface: String,
    #[serde(default = "default_controller_port")]
    pub vip_raft_controller_port: u16,
    #[serde(default = "default_worker_port")]
    pub vip_raft_worker_port: u16,
    #[serde(default)]
    pub election: ElectionTiming,
    /// Commands tagged with any of these features are skipped.
    #[serde(default)]
    pub skip_features: Vec<String>,
    /// Extra template variables.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub nodes: HashMap<String, Node>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub commands: Vec<Command>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            assets_directory: default_assets_directory(),
            controller_virtual_ip: String::new(),
            controller_virtual_ip_interface: String::new(),
            worker_virtual_ip: String::new(),
            worker_virtual_ip_interface: String::new(),
            vip_raft_controller_port: PORT_VIP_RAFT_CONTROLLER,
            vip_raft_worker_port: PORT_VIP_RAFT_WORKER,
            election: ElectionTiming::default(),
            skip_features: Vec::new(),
            variables: BTreeMap::new(),
            nodes: HashMap::new(),
            servers: Vec::new(),
            commands: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cluster_name() -> String {
    "k8s-tew".to_string()
}

fn default_assets_directory() -> PathBuf {
    PathBuf::from("/opt/k8s-tew")
}

fn default_controller_port() -> u16 {
    PORT_VIP_RAFT_CONTROLLER
}

fn default_worker_port() -> u16 {
    PORT_VIP_RAFT_WORKER
}

pub fn load_config(path: impl AsRef<Path>) -> Result<ClusterConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| TewError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let config: ClusterConfig = serde_yaml::from_str(&contents)?;
    Ok(config)
}

/// The cluster configuration seen from one node.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub name: String,
    pub node: Node,
    pub config: ClusterConfig,
}

impl NodeContext {
    pub fn new(config: ClusterConfig, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let node = config
            .nodes
            .get(&name)
            .cloned()
            .ok_or_else(|| TewError::UnknownNode(name.clone()))?;

        Ok(Self { name, node, config })
    }

    pub fn host_binaries_directory(&self) -> PathBuf {
        self.config.assets_directory.join(HOST_BINARIES_DIRECTORY)
    }

    /// `PATH` with the host binaries directory in front of `inherited`.
    pub fn augmented_path(&self, inherited: &str) -> String {
        let host = self.host_binaries_directory();
        if inherited.is_empty() {
            host.display().to_string()
        } else {
            format!("{}:{}", host.display(), inherited)
        }
    }

    /// Peer map (node name → `ip:port`) of every node carrying `role`.
    pub fn peers(&self, role: &str, port: u16) -> HashMap<String, String> {
        let role = Labels::new([role]);
        self.config
            .nodes
            .iter()
            .filter(|(_, node)| node.labels.has_labels(&role))
            .map(|(name, node)| (name.clone(), format!("{}:{}", node.ip, port)))
            .collect()
    }

    pub fn template_variables(&self) -> BTreeMap<String, String> {
        let mut vars = self.config.variables.clone();
        vars.insert("cluster_name".into(), self.config.cluster_name.clone());
        vars.insert("node_name".into(), self.name.clone());
        vars.insert("node_ip".into(), self.node.ip.clone());
        vars.insert("node_os".into(), self.node.os.clone());
        vars.insert(
            "assets_directory".into(),
            self.config.assets_directory.display().to_string(),
        );
        vars.insert(
            "host_binaries_directory".into(),
            self.host_binaries_directory().display().to_string(),
        );
        vars.insert(
            "controller_virtual_ip".into(),
            self.config.controller_virtual_ip.clone(),
        );
        vars.insert(
            "worker_virtual_ip".into(),
            self.config.worker_virtual_ip.clone(),
        );
        vars
    }

    pub fn apply_template(&self, name: &str, raw: &str) -> Result<String> {
        Templater::new(self.template_variables())
            .render(raw)
            .map_err(|message| TewError::Template {
                name: name.to_string(),
                message,
            })
    }
}

/// Configuration of one Raft election instance.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub node_id: String,
    pub election: String,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: String,
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for ElectionConfig {
    fn default() -> Self {
        let timing = ElectionTiming::default();
        Self {
            node_id: "node-1".to_string(),
            election: "/k8s-tew/controller-vip-manager".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], PORT_VIP_RAFT_CONTROLLER)),
            peers: Vec::new(),
            election_timeout_min_ms: timing.election_timeout_min_ms,
            election_timeout_max_ms: timing.election_timeout_max_ms,
            heartbeat_interval_ms: timing.heartbeat_interval_ms,
        }
    }
}

impl ElectionConfig {
    pub fn new(node_id: impl Into<String>, election: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            election: election.into(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: impl Into<String>, addr: impl Into<String>) -> Self {
        self.peers.push(PeerConfig {
            node_id: node_id.into(),
            addr: addr.into(),
        });
        self
    }

    pub fn with_timing(mut self, timing: &ElectionTiming) -> Self {
        self.election_timeout_min_ms = timing.election_timeout_min_ms;
        self.election_timeout_max_ms = timing.election_timeout_max_ms;
        self.heartbeat_interval_ms = timing.heartbeat_interval_ms;
        self
    }

    /// Votes needed to win, counting this node.
    pub fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Deadline for a single vote or heartbeat RPC.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(50))
    }

    /// How long a leader keeps leading after the start of the last heartbeat
    /// round a majority acknowledged. Leadership is checked before and after
    /// every round, so checks are never more than one heartbeat interval or
    /// RPC timeout apart and the lease ends before the minimum election
    /// timeout.
    pub fn leader_lease(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms).saturating_sub(self.rpc_timeout())
    }
}
