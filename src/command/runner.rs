use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::CommandError;

/// Fixed pause between two attempts of a failing command.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Executes one rendered command line.
#[tonic::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<(), CommandError>;
}

/// Runs commands through `sh -c` with an optional `PATH` override.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    path: Option<String>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    fn process_output(result: std::io::Result<std::process::Output>) -> Result<(), CommandError> {
        let output = result.map_err(|e| CommandError::Spawn(e.to_string()))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Err(CommandError::Failed {
            exit_code: output.status.code(),
            output: if stderr.is_empty() { stdout } else { stderr },
        })
    }
}

#[tonic::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Result<(), CommandError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref path) = self.path {
            cmd.env("PATH", path);
        }

        Self::process_output(cmd.output().await)
    }
}

/// Run `command` up to `max_retries` times with a fixed `backoff` between
/// attempts. The stop token is checked before every attempt.
pub async fn run_with_retries(
    runner: &dyn CommandRunner,
    name: &str,
    command: &str,
    max_retries: u32,
    backoff: Duration,
    stop: &CancellationToken,
) -> Result<(), CommandError> {
    let attempts = max_retries.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        if stop.is_cancelled() {
            tracing::warn!(name, attempt, "Command aborted by shutdown");
            return Err(CommandError::Cancelled);
        }

        tracing::info!(name, command, attempt, "Executing command");

        match runner.run(command).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::debug!(name, attempt, error = %e, "Command attempt failed");
                last_error = Some(e);
            }
        }

        if attempt < attempts {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    let error = last_error.unwrap_or(CommandError::Cancelled);
    tracing::error!(name, command, error = %error, "Command failed");
    Err(error)
}
