//! Node supervisor.
//!
//! [`Servers`] owns the lifecycle of one node:
//!
//! 1. extract the bundled binaries and prepend them to `PATH`
//! 2. start every server that applies to the node, VIP managers last
//! 3. run the provisioning commands in the background
//! 4. on SIGINT/SIGTERM or a failed command, stop all servers and kill
//!    whatever child processes remain

pub mod assets;
pub mod killer;
pub mod progress;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::command::{run_with_retries, should_run, CommandError, CommandRunner, ShellRunner, RETRY_BACKOFF};
use crate::config::{compare_labels, NodeContext, ServerConfig, NODE_CONTROLLER, NODE_WORKER};
use crate::election::ElectionFactory;
use crate::error::{Result, TewError};
use crate::raft::RaftElectionFactory;
use crate::server::{ProcessServerFactory, Server, ServerFactory, VipManagerServer};
use crate::shutdown::install_shutdown_handler;
use crate::vip::{IpCommandInterface, NetworkInterface, VipManager, VipSettings};

use assets::{extract_embedded_files, AssetSource, NoAssets};
use killer::{ProcessKiller, ProcfsKiller};
use progress::{LogProgress, Progress};

pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether a server, VIP manager or command applies to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Run,
    Skip(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub kind: &'static str,
    pub name: String,
    pub decision: Decision,
}

/// What [`Servers::run`] would do on a node, without doing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub node: String,
    pub steps: usize,
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    pub fn running(&self, kind: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| entry.kind == kind && entry.decision == Decision::Run)
            .map(|entry| entry.name.as_str())
            .collect()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Node {} ({} steps)", self.node, self.steps)?;
        for entry in &self.entries {
            match entry.decision {
                Decision::Run => writeln!(f, "  run   {:<12} {}", entry.kind, entry.name)?,
                Decision::Skip(ref reason) => {
                    writeln!(f, "  skip  {:<12} {} ({})", entry.kind, entry.name, reason)?
                }
            }
        }
        Ok(())
    }
}

fn server_decision(config: &ServerConfig, context: &NodeContext) -> Decision {
    if !config.enabled {
        Decision::Skip("disabled".into())
    } else if !compare_labels(&context.node.labels, &config.labels) {
        Decision::Skip("labels do not match".into())
    } else {
        Decision::Run
    }
}

/// Supervises the servers and provisioning commands of one node.
pub struct Servers {
    context: Arc<NodeContext>,
    servers: Vec<Box<dyn Server>>,
    stop: CancellationToken,
    started: bool,
    kill_timeout: Duration,
    retry_backoff: Duration,
    vip_retry_interval: Duration,
    runner: Option<Arc<dyn CommandRunner>>,
    assets: Arc<dyn AssetSource>,
    server_factory: Option<Arc<dyn ServerFactory>>,
    election_factory: Arc<dyn ElectionFactory>,
    interface: Arc<dyn NetworkInterface>,
    killer: Arc<dyn ProcessKiller>,
    progress: Arc<dyn Progress>,
}

impl Servers {
    pub fn new(context: NodeContext) -> Self {
        let steps = context.config.servers.len() + context.config.commands.len() + 1;
        let election_factory = RaftElectionFactory::new(context.config.election.clone());
        let vip_retry_interval = Duration::from_millis(context.config.election.retry_interval_ms);

        Self {
            context: Arc::new(context),
            servers: Vec::new(),
            stop: CancellationToken::new(),
            started: false,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            retry_backoff: RETRY_BACKOFF,
            vip_retry_interval,
            runner: None,
            assets: Arc::new(NoAssets),
            server_factory: None,
            election_factory: Arc::new(election_factory),
            interface: Arc::new(IpCommandInterface::new()),
            killer: Arc::new(ProcfsKiller::default()),
            progress: Arc::new(LogProgress::new(steps)),
        }
    }

    /// Also bounds how long each process server gets to exit on SIGTERM,
    /// unless a custom server factory is installed.
    pub fn with_kill_timeout(mut self, kill_timeout: Duration) -> Self {
        self.kill_timeout = kill_timeout;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_vip_retry_interval(mut self, interval: Duration) -> Self {
        self.vip_retry_interval = interval;
        self
    }

    /// Replaces the shell runner, which otherwise uses the augmented `PATH`.
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_assets(mut self, assets: Arc<dyn AssetSource>) -> Self {
        self.assets = assets;
        self
    }

    pub fn with_server_factory(mut self, factory: Arc<dyn ServerFactory>) -> Self {
        self.server_factory = Some(factory);
        self
    }

    pub fn with_election_factory(mut self, factory: Arc<dyn ElectionFactory>) -> Self {
        self.election_factory = factory;
        self
    }

    pub fn with_network_interface(mut self, interface: Arc<dyn NetworkInterface>) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_killer(mut self, killer: Arc<dyn ProcessKiller>) -> Self {
        self.killer = killer;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn context(&self) -> &NodeContext {
        &self.context
    }

    /// Configured servers + configured commands + the initializing step.
    pub fn steps(&self) -> usize {
        self.context.config.servers.len() + self.context.config.commands.len() + 1
    }

    /// Names of the servers added by the current run, in start order.
    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name().to_string()).collect()
    }

    fn vip_settings(&self, role: &str) -> VipSettings {
        let config = &self.context.config;
        let (port, virtual_ip, interface) = if role == NODE_CONTROLLER {
            (
                config.vip_raft_controller_port,
                &config.controller_virtual_ip,
                &config.controller_virtual_ip_interface,
            )
        } else {
            (
                config.vip_raft_worker_port,
                &config.worker_virtual_ip,
                &config.worker_virtual_ip_interface,
            )
        };

        VipSettings {
            role: role.to_string(),
            node_id: self.context.name.clone(),
            endpoint: format!("{}:{}", self.context.node.ip, port),
            virtual_ip: virtual_ip.clone(),
            interface: interface.clone(),
            peers: self.context.peers(role, port),
        }
    }

    /// Report which servers, VIP managers and commands apply to this node.
    pub fn plan(&self) -> Plan {
        let context = &self.context;
        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for config in &context.config.servers {
            let mut decision = server_decision(config, context);
            if decision == Decision::Run && !seen.insert(config.name.as_str()) {
                decision = Decision::Skip("duplicate name".into());
            }
            entries.push(PlanEntry {
                kind: "server",
                name: config.name.clone(),
                decision,
            });
        }

        for role in [NODE_CONTROLLER, NODE_WORKER] {
            let settings = self.vip_settings(role);
            let decision = if !context.node.labels.has_label(role) {
                Decision::Skip(format!("node is not a {}", role))
            } else if !settings.is_configured() {
                Decision::Skip("virtual IP not configured".into())
            } else {
                Decision::Run
            };
            entries.push(PlanEntry {
                kind: "vip-manager",
                name: format!("{}-vip-manager", role),
                decision,
            });
        }

        for command in &context.config.commands {
            let decision = match should_run(command, &context.node, &context.config.skip_features) {
                Ok(()) => Decision::Run,
                Err(reason) => Decision::Skip(reason.to_string()),
            };
            entries.push(PlanEntry {
                kind: "command",
                name: command.name.clone(),
                decision,
            });
        }

        Plan {
            node: context.name.clone(),
            steps: self.steps(),
            entries,
        }
    }

    /// Run until SIGINT/SIGTERM or until a provisioning command exhausts its
    /// retries.
    pub async fn run(&mut self, command_retries: u32) -> Result<()> {
        self.ensure_not_started()?;
        let shutdown = install_shutdown_handler()?;
        self.run_until(command_retries, shutdown).await
    }

    /// Like [`run`](Self::run), with the shutdown signal supplied by the
    /// caller.
    /// A `Servers` runs once. Later calls fail without touching any server.
    pub async fn run_until(&mut self, command_retries: u32, shutdown: CancellationToken) -> Result<()> {
        self.ensure_not_started()?;
        self.started = true;

        tracing::info!(node = %self.context.name, steps = self.steps(), "Initializing");

        let host_binaries = self.context.host_binaries_directory();
        extract_embedded_files(self.assets.clone(), host_binaries).await?;

        let inherited = std::env::var("PATH").unwrap_or_default();
        let path = self.context.augmented_path(&inherited);
        self.progress.increase_step("Initializing");

        self.add_servers(&path)?;
        self.add_vip_managers()?;

        if let Err(e) = self.start_servers().await {
            tracing::error!(error = %e, "Failed to start servers");
            self.shutdown().await;
            return Err(e);
        }

        let runner: Arc<dyn CommandRunner> = match self.runner {
            Some(ref runner) => runner.clone(),
            None => Arc::new(ShellRunner::with_path(path)),
        };
        let mut commands = tokio::spawn(run_commands(
            self.context.clone(),
            runner,
            self.progress.clone(),
            self.stop.clone(),
            command_retries,
            self.retry_backoff,
        ));

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown requested");
                Ok(())
            }
            result = &mut commands => match result {
                Ok(Ok(())) => {
                    shutdown.cancelled().await;
                    tracing::info!("Shutdown requested");
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(e) => Err(TewError::Internal(format!("command task failed: {}", e))),
            },
        };

        self.shutdown().await;

        commands.abort();
        let _ = commands.await;

        outcome
    }

    fn ensure_not_started(&self) -> Result<()> {
        if self.started {
            return Err(TewError::Internal("servers already started".to_string()));
        }
        Ok(())
    }

    fn add_servers(&mut self, path: &str) -> Result<()> {
        let context = self.context.clone();
        let factory: Arc<dyn ServerFactory> = match &self.server_factory {
            Some(factory) => factory.clone(),
            None => Arc::new(ProcessServerFactory::new(self.kill_timeout)),
        };
        let mut names = HashSet::new();

        for config in &context.config.servers {
            if let Decision::Skip(reason) = server_decision(config, &context) {
                tracing::debug!(name = %config.name, reason = %reason, "Skipping server");
                continue;
            }
            if !names.insert(config.name.as_str()) {
                tracing::warn!(name = %config.name, "Duplicate server name, skipping");
                continue;
            }

            let server = factory.create(&context, config, path)?;
            self.servers.push(server);
        }
        Ok(())
    }

    fn add_vip_managers(&mut self) -> Result<()> {
        for role in [NODE_CONTROLLER, NODE_WORKER] {
            if !self.context.node.labels.has_label(role) {
                continue;
            }

            let settings = self.vip_settings(role);
            let manager = VipManager::new(settings, self.election_factory.as_ref(), self.interface.clone())?;
            match manager {
                Some(manager) => {
                    let manager = manager.with_retry_interval(self.vip_retry_interval);
                    self.servers.push(Box::new(VipManagerServer::new(manager)));
                }
                None => tracing::debug!(role, "Virtual IP not configured, no VIP manager"),
            }
        }
        Ok(())
    }

    async fn start_servers(&mut self) -> Result<()> {
        for index in 0..self.servers.len() {
            let server = &mut self.servers[index];
            tracing::info!(name = %server.name(), "Starting server");

            if let Err(e) = server.start().await {
                // Only servers that started get stopped.
                self.servers.truncate(index);
                return Err(e);
            }
            self.progress.increase_step(server.name());
        }
        Ok(())
    }

    /// Stop servers in start order, then kill remaining descendants.
    async fn shutdown(&mut self) {
        self.stop.cancel();

        for server in self.servers.iter_mut() {
            let name = server.name().to_string();
            tracing::info!(name = %name, "Stopping server");
            if let Err(e) = server.stop().await {
                tracing::error!(name = %name, error = %e, "Failed to stop server");
            }
        }

        self.killer
            .kill_children(std::process::id(), self.kill_timeout)
            .await;
        tracing::info!("Servers stopped");
    }
}

async fn run_commands(
    context: Arc<NodeContext>,
    runner: Arc<dyn CommandRunner>,
    progress: Arc<dyn Progress>,
    stop: CancellationToken,
    retries: u32,
    backoff: Duration,
) -> Result<()> {
    for command in &context.config.commands {
        if stop.is_cancelled() {
            return Ok(());
        }

        if let Err(reason) = should_run(command, &context.node, &context.config.skip_features) {
            tracing::debug!(name = %command.name, reason = %reason, "Skipping command");
            progress.increase_step(&command.name);
            continue;
        }

        let rendered = context.apply_template(&command.name, &command.command)?;
        progress.increase_step(&command.name);

        match run_with_retries(runner.as_ref(), &command.name, &rendered, retries, backoff, &stop).await {
            Ok(()) => {}
            Err(CommandError::Cancelled) => return Ok(()),
            Err(source) => {
                return Err(TewError::SetupFailed {
                    name: command.name.clone(),
                    source,
                })
            }
        }
    }

    tracing::info!("Cluster setup finished");
    progress.hide();
    Ok(())
}
