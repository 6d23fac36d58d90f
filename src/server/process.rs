use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{NodeContext, ServerConfig};
use crate::error::{Result, TewError};
use crate::server::{Server, ServerFactory};
use crate::supervisor::killer::send_signal;

/// Pause before a crashed process is started again.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Fully rendered invocation of a server binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub log_file: Option<PathBuf>,
}

impl Launch {
    /// Render a server entry: templated command, `--key=value` arguments in
    /// key order, `PATH` plus the templated environment.
    pub fn render(context: &NodeContext, config: &ServerConfig, path: &str) -> Result<Self> {
        let program = context.apply_template(&config.name, &config.command)?;

        let mut args = Vec::with_capacity(config.arguments.len());
        for (key, value) in &config.arguments {
            let value = context.apply_template(&config.name, value)?;
            args.push(format!("--{}={}", key, value));
        }

        let mut env = vec![("PATH".to_string(), path.to_string())];
        for (key, value) in &config.environment {
            env.push((key.clone(), context.apply_template(&config.name, value)?));
        }

        Ok(Self {
            program,
            args,
            env,
            log_file: config.log_file.clone(),
        })
    }

    fn output(&self) -> std::io::Result<(Stdio, Stdio)> {
        match self.log_file {
            Some(ref path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                let stderr = file.try_clone()?;
                Ok((Stdio::from(file), Stdio::from(stderr)))
            }
            None => Ok((Stdio::null(), Stdio::null())),
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let (stdout, stderr) = self.output()?;
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// An external binary kept alive until the supervisor stops it.
pub struct ProcessServer {
    name: String,
    launch: Arc<Launch>,
    kill_timeout: Duration,
    restart_delay: Duration,
    running: Option<Running>,
}

impl ProcessServer {
    pub fn new(name: impl Into<String>, launch: Launch, kill_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            launch: Arc::new(launch),
            kill_timeout,
            restart_delay: RESTART_DELAY,
            running: None,
        }
    }

    pub fn with_restart_delay(mut self, restart_delay: Duration) -> Self {
        self.restart_delay = restart_delay;
        self
    }

    pub fn launch(&self) -> &Launch {
        &self.launch
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
    }
}

#[tonic::async_trait]
impl Server for ProcessServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let child = self.launch.spawn().map_err(|e| TewError::ServerStart {
            name: self.name.clone(),
            message: format!("{}: {}", self.launch.program, e),
        })?;

        tracing::info!(
            name = %self.name,
            program = %self.launch.program,
            pid = ?child.id(),
            "Started server"
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(
            self.name.clone(),
            self.launch.clone(),
            child,
            cancel.clone(),
            self.kill_timeout,
            self.restart_delay,
        ));

        self.running = Some(Running { cancel, handle });
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        running.cancel.cancel();
        running.handle.await.map_err(|e| TewError::ServerStop {
            name: self.name.clone(),
            message: e.to_string(),
        })?;

        tracing::info!(name = %self.name, "Stopped server");
        Ok(())
    }
}

/// Restart the process whenever it exits until `cancel` fires, then
/// terminate it.
async fn supervise(
    name: String,
    launch: Arc<Launch>,
    child: Child,
    cancel: CancellationToken,
    kill_timeout: Duration,
    restart_delay: Duration,
) {
    let mut current = Some(child);

    loop {
        if let Some(mut child) = current.take() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    terminate(&name, &mut child, kill_timeout).await;
                    return;
                }
                status = child.wait() => match status {
                    Ok(status) => tracing::warn!(name = %name, status = %status, "Server exited, restarting"),
                    Err(e) => tracing::error!(name = %name, error = %e, "Failed to wait for server"),
                },
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(restart_delay) => {}
        }

        match launch.spawn() {
            Ok(child) => {
                tracing::info!(name = %name, pid = ?child.id(), "Restarted server");
                current = Some(child);
            }
            Err(e) => tracing::error!(name = %name, error = %e, "Failed to restart server"),
        }
    }
}

/// SIGTERM, then SIGKILL once `kill_timeout` has passed.
async fn terminate(name: &str, child: &mut Child, kill_timeout: Duration) {
    let Some(pid) = child.id() else {
        return;
    };

    if let Err(e) = send_signal(pid, "TERM").await {
        tracing::warn!(name, pid, error = %e, "Failed to send SIGTERM");
    }

    match tokio::time::timeout(kill_timeout, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(name, pid, status = %status, "Server terminated"),
        Ok(Err(e)) => tracing::warn!(name, pid, error = %e, "Failed to wait for server"),
        Err(_) => {
            tracing::warn!(name, pid, "Server ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                tracing::error!(name, pid, error = %e, "Failed to kill server");
            }
        }
    }
}

/// Creates a [`ProcessServer`] per configured server entry.
#[derive(Debug, Clone)]
pub struct ProcessServerFactory {
    kill_timeout: Duration,
}

impl ProcessServerFactory {
    pub fn new(kill_timeout: Duration) -> Self {
        Self { kill_timeout }
    }
}

impl ServerFactory for ProcessServerFactory {
    fn create(&self, context: &NodeContext, config: &ServerConfig, path: &str) -> Result<Box<dyn Server>> {
        let launch = Launch::render(context, config, path)?;
        Ok(Box::new(ProcessServer::new(
            config.name.clone(),
            launch,
            self.kill_timeout,
        )))
    }
}
