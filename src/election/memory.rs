use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;

use super::{ElectionClient, ElectionError};

#[derive(Debug, Clone, Default)]
struct ElectionState {
    leader: Option<String>,
    /// Holder of a revoked session that has not acknowledged the loss yet.
    /// Nobody else is granted leadership until it resigns.
    draining: Option<String>,
    disconnected: HashSet<String>,
}

impl ElectionState {
    fn is_free(&self) -> bool {
        self.leader.is_none() && self.draining.is_none()
    }
}

/// A single named election held in process memory.
///
/// Sessions can be expired and candidates disconnected to exercise
/// failover paths without a network.
pub struct MemoryElectionBackend {
    name: String,
    state: watch::Sender<ElectionState>,
    leader: watch::Sender<Option<String>>,
}

impl MemoryElectionBackend {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (state, _) = watch::channel(ElectionState::default());
        let (leader, _) = watch::channel(None);
        Arc::new(Self {
            name: name.into(),
            state,
            leader,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(self: &Arc<Self>, candidate_id: impl Into<String>) -> MemoryElection {
        MemoryElection {
            backend: self.clone(),
            candidate_id: candidate_id.into(),
        }
    }

    pub fn leader(&self) -> Option<String> {
        self.state.borrow().leader.clone()
    }

    /// Revoke the session of `candidate_id` if it currently leads.
    pub fn expire_session(&self, candidate_id: &str) {
        self.modify(|state| {
            if state.leader.as_deref() == Some(candidate_id) {
                state.leader = None;
                state.draining = Some(candidate_id.to_string());
            }
        });
        tracing::info!(election = %self.name, candidate_id, "Session expired");
    }

    /// Cut `candidate_id` off the backend; its leadership is revoked and
    /// campaigns fail until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self, candidate_id: &str) {
        self.modify(|state| {
            state.disconnected.insert(candidate_id.to_string());
            if state.leader.as_deref() == Some(candidate_id) {
                state.leader = None;
                state.draining = Some(candidate_id.to_string());
            }
        });
    }

    pub fn reconnect(&self, candidate_id: &str) {
        self.modify(|state| {
            state.disconnected.remove(candidate_id);
        });
    }

    fn modify(&self, f: impl FnOnce(&mut ElectionState)) {
        self.state.send_modify(f);
        let leader = self.state.borrow().leader.clone();
        self.leader.send_if_modified(|current| {
            if *current != leader {
                *current = leader;
                true
            } else {
                false
            }
        });
    }

    /// Grant leadership to `candidate_id` if the election is free.
    fn try_acquire(&self, candidate_id: &str) -> Result<bool, ElectionError> {
        let mut granted = false;
        let mut unavailable = false;
        self.modify(|state| {
            if state.disconnected.contains(candidate_id) {
                unavailable = true;
            } else if state.leader.as_deref() == Some(candidate_id) {
                granted = true;
            } else if state.is_free() {
                state.leader = Some(candidate_id.to_string());
                granted = true;
            }
        });

        if unavailable {
            return Err(ElectionError::Unavailable(format!(
                "{} is disconnected from {}",
                candidate_id, self.name
            )));
        }
        Ok(granted)
    }
}

/// Client handle of one candidate on a [`MemoryElectionBackend`].
#[derive(Clone)]
pub struct MemoryElection {
    backend: Arc<MemoryElectionBackend>,
    candidate_id: String,
}

#[tonic::async_trait]
impl ElectionClient for MemoryElection {
    fn candidate_id(&self) -> &str {
        &self.candidate_id
    }

    async fn campaign(&self) -> Result<(), ElectionError> {
        let id = self.candidate_id.as_str();
        let mut rx = self.backend.state.subscribe();

        loop {
            if self.backend.try_acquire(id)? {
                tracing::debug!(election = %self.backend.name, candidate_id = id, "Won election");
                return Ok(());
            }

            rx.wait_for(|state| {
                state.disconnected.contains(id)
                    || state.leader.as_deref() == Some(id)
                    || state.is_free()
            })
            .await
            .map_err(|_| ElectionError::Closed)?;
        }
    }

    async fn resign(&self) -> Result<(), ElectionError> {
        let id = self.candidate_id.as_str();
        self.backend.modify(|state| {
            if state.leader.as_deref() == Some(id) {
                state.leader = None;
            }
            if state.draining.as_deref() == Some(id) {
                state.draining = None;
            }
        });
        Ok(())
    }

    fn observe(&self) -> watch::Receiver<Option<String>> {
        self.backend.leader.subscribe()
    }
}
