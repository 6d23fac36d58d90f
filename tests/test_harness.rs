//! Shared fakes and helpers for the integration tests.
//!
//! Provides recording doubles for commands, servers, the process killer and
//! the network, plus helpers to build node contexts and Raft election groups.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tew_node::command::{CommandError, CommandRunner};
use tew_node::config::{
    ClusterConfig, Command, ElectionConfig, Labels, Node, NodeContext, ServerConfig,
};
use tew_node::election::election_name;
use tew_node::error::{Result, TewError};
use tew_node::raft::RaftElection;
use tew_node::server::{Server, ServerFactory};
use tew_node::supervisor::assets::AssetSource;
use tew_node::supervisor::killer::ProcessKiller;
use tew_node::supervisor::progress::Progress;
use tew_node::vip::NetworkInterface;

// =============================================================================
// Polling
// =============================================================================

/// Poll `condition` until it holds or `timeout_duration` elapses.
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}

// =============================================================================
// Node contexts
// =============================================================================

pub const NODE_NAME: &str = "controller00";

pub fn server_config(name: &str, labels: &[&str]) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        enabled: true,
        labels: Labels::new(labels.iter().copied()),
        command: name.to_string(),
        arguments: BTreeMap::new(),
        environment: BTreeMap::new(),
        log_file: None,
    }
}

pub fn command(name: &str, command: &str, labels: &[&str]) -> Command {
    Command {
        name: name.to_string(),
        command: command.to_string(),
        labels: Labels::new(labels.iter().copied()),
        os: Vec::new(),
        features: Vec::new(),
    }
}

/// A one-node cluster whose node carries the `controller` label.
pub fn cluster_config(assets_directory: &Path) -> ClusterConfig {
    let mut config = ClusterConfig {
        assets_directory: assets_directory.to_path_buf(),
        ..ClusterConfig::default()
    };
    config.nodes.insert(
        NODE_NAME.to_string(),
        Node {
            ip: "127.0.0.1".to_string(),
            labels: Labels::new(["controller"]),
            os: "ubuntu/18.04".to_string(),
        },
    );
    config
}

pub fn node_context(config: ClusterConfig) -> NodeContext {
    NodeContext::new(config, NODE_NAME).unwrap()
}

// =============================================================================
// Command runner
// =============================================================================

/// Records every command it runs. Commands listed in `failures` fail that
/// many times before succeeding; `always_fail` makes every command fail.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, u32>>,
    always_fail: AtomicBool,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let runner = Self::default();
        runner.always_fail.store(true, Ordering::SeqCst);
        Arc::new(runner)
    }

    pub fn fail_times(self: &Arc<Self>, command: &str, times: u32) {
        self.failures.lock().unwrap().insert(command.to_string(), times);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[tonic::async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &str) -> std::result::Result<(), CommandError> {
        self.calls.lock().unwrap().push(command.to_string());

        let failed = CommandError::Failed {
            exit_code: Some(1),
            output: format!("{} failed", command),
        };
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(failed);
        }

        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(command) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(failed)
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Servers
// =============================================================================

/// Ordered `start:<name>` / `stop:<name>` events of every fake server.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

pub struct FakeServer {
    name: String,
    fail_start: bool,
    running: bool,
    log: EventLog,
}

#[tonic::async_trait]
impl Server for FakeServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        if self.fail_start {
            return Err(TewError::ServerStart {
                name: self.name.clone(),
                message: "refused to start".to_string(),
            });
        }
        self.running = true;
        self.log.push(format!("start:{}", self.name));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.running {
            self.running = false;
            self.log.push(format!("stop:{}", self.name));
        }
        Ok(())
    }
}

/// Builds [`FakeServer`]s that share one [`EventLog`].
#[derive(Default)]
pub struct RecordingServerFactory {
    pub log: EventLog,
    fail_start: HashSet<String>,
    paths: Mutex<Vec<String>>,
}

impl RecordingServerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, name: &str) -> Self {
        self.fail_start.insert(name.to_string());
        self
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }
}

impl ServerFactory for RecordingServerFactory {
    fn create(&self, _context: &NodeContext, config: &ServerConfig, path: &str) -> Result<Box<dyn Server>> {
        self.paths.lock().unwrap().push(path.to_string());
        Ok(Box::new(FakeServer {
            name: config.name.clone(),
            fail_start: self.fail_start.contains(&config.name),
            running: false,
            log: self.log.clone(),
        }))
    }
}

// =============================================================================
// Killer, progress, assets
// =============================================================================

#[derive(Default)]
pub struct CountingKiller {
    calls: AtomicUsize,
}

impl CountingKiller {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[tonic::async_trait]
impl ProcessKiller for CountingKiller {
    async fn kill_children(&self, _pid: u32, _timeout: Duration) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingProgress {
    steps: Mutex<Vec<String>>,
    hidden: AtomicBool,
}

impl RecordingProgress {
    pub fn steps(&self) -> Vec<String> {
        self.steps.lock().unwrap().clone()
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::SeqCst)
    }
}

impl Progress for RecordingProgress {
    fn increase_step(&self, label: &str) {
        self.steps.lock().unwrap().push(label.to_string());
    }

    fn hide(&self) {
        self.hidden.store(true, Ordering::SeqCst);
    }
}

/// Lists one file that cannot be read.
pub struct BrokenAssets;

impl AssetSource for BrokenAssets {
    fn files(&self) -> io::Result<Vec<String>> {
        Ok(vec!["kubelet".to_string()])
    }

    fn open(&self, _name: &str) -> io::Result<Box<dyn Read + Send>> {
        Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated bundle"))
    }
}

// =============================================================================
// Network
// =============================================================================

/// One shared L2 segment: records which hosts hold the virtual IP and the
/// highest number of simultaneous holders ever observed.
#[derive(Default)]
pub struct Network {
    holders: Mutex<HashSet<String>>,
    max_holders: AtomicUsize,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn host(self: &Arc<Self>, host: &str) -> Arc<HostInterface> {
        Arc::new(HostInterface {
            host: host.to_string(),
            network: self.clone(),
            fail_add: AtomicBool::new(false),
        })
    }

    pub fn holders(&self) -> Vec<String> {
        let mut holders: Vec<String> = self.holders.lock().unwrap().iter().cloned().collect();
        holders.sort();
        holders
    }

    pub fn max_holders(&self) -> usize {
        self.max_holders.load(Ordering::SeqCst)
    }
}

/// The interface of one host on a [`Network`].
pub struct HostInterface {
    host: String,
    network: Arc<Network>,
    fail_add: AtomicBool,
}

impl HostInterface {
    pub fn fail_add(&self, fail: bool) {
        self.fail_add.store(fail, Ordering::SeqCst);
    }
}

#[tonic::async_trait]
impl NetworkInterface for HostInterface {
    async fn add_address(&self, ip: &str, interface: &str) -> Result<bool> {
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(TewError::Network(format!("cannot add {} to {}", ip, interface)));
        }
        let mut holders = self.network.holders.lock().unwrap();
        let added = holders.insert(self.host.clone());
        self.network.max_holders.fetch_max(holders.len(), Ordering::SeqCst);
        Ok(added)
    }

    async fn remove_address(&self, _ip: &str, _interface: &str) -> Result<()> {
        self.network.holders.lock().unwrap().remove(&self.host);
        Ok(())
    }

    async fn has_address(&self, _ip: &str, _interface: &str) -> Result<bool> {
        Ok(self.network.holders.lock().unwrap().contains(&self.host))
    }
}

// =============================================================================
// Raft elections
// =============================================================================

/// Election config with shorter timeouts for faster tests
pub fn test_election_config(node_id: &str, port: u16, peers: &[(&str, u16)]) -> ElectionConfig {
    let listen_addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let mut config = ElectionConfig::new(node_id, election_name("controller"), listen_addr);
    for (peer, peer_port) in peers {
        config = config.with_peer(*peer, format!("127.0.0.1:{}", peer_port));
    }
    config.election_timeout_min_ms = 300;
    config.election_timeout_max_ms = 600;
    config.heartbeat_interval_ms = 50;
    config
}

/// `size` elections named `n1..` on consecutive ports from `base_port`.
pub fn raft_group(size: usize, base_port: u16) -> Vec<Arc<RaftElection>> {
    let ids: Vec<String> = (1..=size).map(|i| format!("n{}", i)).collect();
    (0..size)
        .map(|i| {
            let peers: Vec<(&str, u16)> = (0..size)
                .filter(|j| *j != i)
                .map(|j| (ids[j].as_str(), base_port + j as u16))
                .collect();
            let config = test_election_config(&ids[i], base_port + i as u16, &peers);
            Arc::new(RaftElection::new(config).unwrap())
        })
        .collect()
}

pub async fn leaders(group: &[Arc<RaftElection>]) -> Vec<String> {
    let mut leaders = Vec::new();
    for election in group {
        if election.node().is_leader().await {
            leaders.push(election.node().id.clone());
        }
    }
    leaders
}
