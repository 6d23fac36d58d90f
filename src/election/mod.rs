//! Leader election contract consumed by the VIP managers.
//!
//! An election is a named coordination point; at most one campaigning
//! participant holds leadership at a time. The VIP manager only drives the
//! contract below, the mutual exclusion itself comes from the backend:
//!
//! - [`crate::raft::RaftElection`]: election-only Raft between the nodes of a role
//! - [`memory::MemoryElectionBackend`]: in-process backend with injectable
//!   session expiry and disconnection

pub mod memory;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ElectionError {
    #[error("election backend unavailable: {0}")]
    Unavailable(String),

    #[error("election closed")]
    Closed,
}

/// Name of the election a VIP manager of `role` campaigns in.
pub fn election_name(role: &str) -> String {
    format!("/k8s-tew/{}-vip-manager", role)
}

#[tonic::async_trait]
pub trait ElectionClient: Send + Sync {
    /// Identity this client campaigns with.
    fn candidate_id(&self) -> &str;

    /// Wait until this candidate holds leadership.
    ///
    /// Returns an error when the backend cannot be reached; callers retry.
    async fn campaign(&self) -> Result<(), ElectionError>;

    /// Give up leadership (if held) and acknowledge a revoked session.
    async fn resign(&self) -> Result<(), ElectionError>;

    /// Current leader of the election as seen by this client.
    fn observe(&self) -> watch::Receiver<Option<String>>;

    /// Release backend resources. Called once the owner stops for good.
    async fn shutdown(&self) {}
}

/// Node name → `ip:port` election endpoint, the local node included.
pub type Peers = HashMap<String, String>;

/// Builds the election client of one VIP manager.
pub trait ElectionFactory: Send + Sync {
    fn create(
        &self,
        election: &str,
        node_id: &str,
        endpoint: &str,
        peers: &Peers,
    ) -> crate::error::Result<Arc<dyn ElectionClient>>;
}

/// Hands out clients of in-process backends, one backend per election name.
#[derive(Default)]
pub struct MemoryElectionFactory {
    backends: Mutex<HashMap<String, Arc<memory::MemoryElectionBackend>>>,
}

impl MemoryElectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(&self, election: &str) -> Arc<memory::MemoryElectionBackend> {
        let mut backends = self
            .backends
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        backends
            .entry(election.to_string())
            .or_insert_with(|| memory::MemoryElectionBackend::new(election))
            .clone()
    }
}

impl ElectionFactory for MemoryElectionFactory {
    fn create(
        &self,
        election: &str,
        node_id: &str,
        _endpoint: &str,
        _peers: &Peers,
    ) -> crate::error::Result<Arc<dyn ElectionClient>> {
        Ok(Arc::new(self.backend(election).client(node_id)))
    }
}
