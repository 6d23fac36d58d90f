//! Provisioning command execution.
//!
//! - [`template`]: renders `{{ variable }}` placeholders in command strings
//! - [`runner`]: runs a rendered command through the shell with a fixed
//!   retry backoff and an early exit on shutdown
//!
//! [`should_run`] decides whether a declared command applies to a node.

pub mod runner;
pub mod template;

use thiserror::Error;

use crate::config::{compare_labels, Command, Node};

pub use runner::{run_with_retries, CommandRunner, ShellRunner, RETRY_BACKOFF};
pub use template::Templater;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    #[error("exit code {exit_code:?}: {output}")]
    Failed {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("cancelled by shutdown")]
    Cancelled,
}

/// Why a command is not executed on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Labels,
    OperatingSystem,
    Feature(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Labels => write!(f, "labels do not match"),
            SkipReason::OperatingSystem => write!(f, "operating system excluded"),
            SkipReason::Feature(feature) => write!(f, "feature {} skipped", feature),
        }
    }
}

/// OS tags are `id` or `id/version`; a bare `id` requirement matches any
/// version of that distribution.
pub fn os_matches(required: &[String], host_os: &str) -> bool {
    if required.is_empty() {
        return true;
    }

    let host_id = host_os.split('/').next().unwrap_or(host_os);
    required
        .iter()
        .any(|os| os == host_os || (!os.contains('/') && os == host_id))
}

pub fn should_run(command: &Command, node: &Node, skip_features: &[String]) -> Result<(), SkipReason> {
    if !compare_labels(&node.labels, &command.labels) {
        return Err(SkipReason::Labels);
    }

    if !os_matches(&command.os, &node.os) {
        return Err(SkipReason::OperatingSystem);
    }

    if let Some(feature) = command.features.iter().find(|f| skip_features.contains(f)) {
        return Err(SkipReason::Feature(feature.clone()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Labels;

    fn node(labels: &[&str], os: &str) -> Node {
        Node {
            ip: "10.0.0.1".into(),
            labels: Labels::new(labels.iter().copied()),
            os: os.into(),
        }
    }

    fn command(labels: &[&str], os: &[&str], features: &[&str]) -> Command {
        Command {
            name: "cmd".into(),
            command: "true".into(),
            labels: Labels::new(labels.iter().copied()),
            os: os.iter().map(|s| s.to_string()).collect(),
            features: features.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn os_matching() {
        assert!(os_matches(&[], "centos/7.5"));
        assert!(os_matches(&["ubuntu".into()], "ubuntu/18.04"));
        assert!(os_matches(&["ubuntu/18.04".into()], "ubuntu/18.04"));
        assert!(!os_matches(&["ubuntu/16.04".into()], "ubuntu/18.04"));
        assert!(!os_matches(&["centos".into()], "ubuntu/18.04"));
        assert!(!os_matches(&["ubuntu".into()], ""));
    }

    #[test]
    fn should_run_checks_labels_os_and_features() {
        let n = node(&["worker"], "ubuntu/18.04");
        let skip = vec!["monitoring".to_string()];

        assert_eq!(should_run(&command(&["worker"], &[], &[]), &n, &skip), Ok(()));
        assert_eq!(
            should_run(&command(&["controller"], &[], &[]), &n, &skip),
            Err(SkipReason::Labels)
        );
        assert_eq!(
            should_run(&command(&["worker"], &["centos"], &[]), &n, &skip),
            Err(SkipReason::OperatingSystem)
        );
        assert_eq!(
            should_run(&command(&["worker"], &["ubuntu"], &["monitoring"]), &n, &skip),
            Err(SkipReason::Feature("monitoring".into()))
        );
        assert_eq!(
            should_run(&command(&["worker"], &["ubuntu"], &["storage"]), &n, &skip),
            Ok(())
        );
    }
}
