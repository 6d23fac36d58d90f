use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Send `signal` (a name such as `TERM` or `KILL`) to `pid`.
pub async fn send_signal(pid: u32, signal: &str) -> std::io::Result<()> {
    let status = Command::new("kill")
        .args(["-s", signal, &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;

    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "kill -s {} {} exited with {}",
            signal, pid, status
        )))
    }
}

/// Terminates every descendant of a process.
#[tonic::async_trait]
pub trait ProcessKiller: Send + Sync {
    /// SIGTERM all descendants of `pid`, SIGKILL those still alive after
    /// `timeout`.
    async fn kill_children(&self, pid: u32, timeout: Duration);
}

/// [`ProcessKiller`] that discovers the process tree through procfs.
#[derive(Debug, Clone)]
pub struct ProcfsKiller {
    proc_root: PathBuf,
}

impl Default for ProcfsKiller {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcfsKiller {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    async fn descendants(&self, pid: u32) -> Vec<u32> {
        let root = self.proc_root.clone();
        match tokio::task::spawn_blocking(move || scan_descendants(&root, pid)).await {
            Ok(pids) => pids,
            Err(e) => {
                tracing::error!(error = %e, "Process scan panicked");
                Vec::new()
            }
        }
    }

    async fn alive(&self, pids: &[u32]) -> Vec<u32> {
        let root = self.proc_root.clone();
        let pids = pids.to_vec();
        tokio::task::spawn_blocking(move || {
            pids.into_iter()
                .filter(|pid| is_alive(&root, *pid))
                .collect()
        })
        .await
        .unwrap_or_default()
    }
}

#[tonic::async_trait]
impl ProcessKiller for ProcfsKiller {
    async fn kill_children(&self, pid: u32, timeout: Duration) {
        let children = self.descendants(pid).await;
        if children.is_empty() {
            return;
        }

        tracing::info!(count = children.len(), "Terminating child processes");
        for child in &children {
            if let Err(e) = send_signal(*child, "TERM").await {
                tracing::debug!(pid = child, error = %e, "SIGTERM failed");
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut remaining = children;
        loop {
            remaining = self.alive(&remaining).await;
            if remaining.is_empty() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        tracing::warn!(count = remaining.len(), "Killing child processes that ignored SIGTERM");
        for child in remaining {
            if let Err(e) = send_signal(child, "KILL").await {
                tracing::debug!(pid = child, error = %e, "SIGKILL failed");
            }
        }
    }
}

/// Process state and parent pid from a `/proc/<pid>/stat` line. The command
/// name may contain spaces and parentheses, so fields are read after the
/// last `)`.
fn parse_stat(contents: &str) -> Option<(char, u32)> {
    let (_, rest) = contents.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

fn read_stat(root: &Path, pid: u32) -> Option<(char, u32)> {
    let contents = std::fs::read_to_string(root.join(pid.to_string()).join("stat")).ok()?;
    parse_stat(&contents)
}

/// Zombies count as gone: they can no longer be signalled.
fn is_alive(root: &Path, pid: u32) -> bool {
    matches!(read_stat(root, pid), Some((state, _)) if state != 'Z' && state != 'X')
}

fn scan_descendants(root: &Path, pid: u32) -> Vec<u32> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(root = %root.display(), error = %e, "Cannot scan processes");
            return Vec::new();
        }
    };

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(child) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
            continue;
        };
        if let Some((state, ppid)) = read_stat(root, child) {
            if state != 'Z' && state != 'X' {
                children.entry(ppid).or_default().push(child);
            }
        }
    }

    let mut seen = HashSet::new();
    let mut result = Vec::new();
    let mut queue = VecDeque::from([pid]);
    while let Some(parent) = queue.pop_front() {
        for &child in children.get(&parent).into_iter().flatten() {
            if child != pid && seen.insert(child) {
                result.push(child);
                queue.push_back(child);
            }
        }
    }
    result
}
