use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use crate::config::ElectionConfig;
use crate::error::Result;
use crate::proto::election_service_client::ElectionServiceClient;
use crate::proto::{HeartbeatRequest, HeartbeatResponse, VoteRequest, VoteResponse};
use crate::raft::rpc::{handle_heartbeat, handle_request_vote};
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::timer::random_election_timeout;

/// One participant of an election-only Raft group.
pub struct RaftNode {
    pub id: String,
    pub election: String,
    pub state: Arc<RwLock<RaftState>>,
    config: ElectionConfig,
    peers: HashMap<String, ElectionServiceClient<Channel>>,
    last_heartbeat: RwLock<Instant>,
    last_quorum: RwLock<Instant>,
    campaigning: AtomicBool,
    leader_tx: watch::Sender<Option<String>>,
}

impl RaftNode {
    /// Build the node. Peer channels connect lazily, so peers that are not
    /// up yet do not fail construction.
    pub fn new(config: ElectionConfig) -> Result<Self> {
        let mut peers = HashMap::new();
        for peer in &config.peers {
            let endpoint = Endpoint::from_shared(format!("http://{}", peer.addr))?
                .connect_timeout(config.rpc_timeout());
            peers.insert(
                peer.node_id.clone(),
                ElectionServiceClient::new(endpoint.connect_lazy()),
            );
        }

        let (leader_tx, _) = watch::channel(None);

        Ok(Self {
            id: config.node_id.clone(),
            election: config.election.clone(),
            state: Arc::new(RwLock::new(RaftState::new())),
            config,
            peers,
            last_heartbeat: RwLock::new(Instant::now()),
            last_quorum: RwLock::new(Instant::now()),
            campaigning: AtomicBool::new(false),
            leader_tx,
        })
    }

    pub fn subscribe_leader(&self) -> watch::Receiver<Option<String>> {
        self.leader_tx.subscribe()
    }

    /// Allow or forbid this node to start elections. It keeps voting either way.
    pub fn set_campaigning(&self, campaigning: bool) {
        self.campaigning.store(campaigning, Ordering::SeqCst);
    }

    fn rpc_timeout(&self) -> Duration {
        self.config.rpc_timeout()
    }

    fn publish(&self, state: &RaftState) {
        let leader = state.leader_id.clone();
        self.leader_tx.send_if_modified(|current| {
            if *current != leader {
                *current = leader;
                true
            } else {
                false
            }
        });
    }

    /// Run the election loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let heartbeat_interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        let mut election_timeout = random_election_timeout(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );

        loop {
            let role = self.state.read().await.role;

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(node_id = %self.id, election = %self.election, "Election loop stopped");
                    break;
                }

                // Election timeout (for followers and candidates)
                _ = tokio::time::sleep(election_timeout), if role != RaftRole::Leader => {
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if self.campaigning.load(Ordering::SeqCst) && elapsed >= election_timeout {
                        tracing::info!(
                            node_id = %self.id,
                            elapsed_ms = elapsed.as_millis(),
                            "Election timeout, starting election"
                        );
                        self.start_election().await;
                    }
                    election_timeout = random_election_timeout(
                        self.config.election_timeout_min_ms,
                        self.config.election_timeout_max_ms,
                    );
                }

                // Heartbeat interval (for leaders)
                _ = tokio::time::sleep(heartbeat_interval), if role == RaftRole::Leader => {
                    self.check_quorum().await;
                    self.send_heartbeats().await;
                    self.check_quorum().await;
                }
            }
        }
    }

    /// Start a new election
    async fn start_election(&self) {
        let mut state = self.state.write().await;
        state.become_candidate(&self.id);
        let term = state.current_term;
        self.publish(&state);
        drop(state);

        let majority = self.config.majority() as u64;
        tracing::info!(node_id = %self.id, term, "Starting election");

        let election_start = Instant::now();
        let req = VoteRequest {
            election: self.election.clone(),
            term,
            candidate_id: self.id.clone(),
        };

        let mut requests = JoinSet::new();
        for (peer_id, client) in &self.peers {
            let mut client = client.clone();
            let peer_id = peer_id.clone();
            let req = req.clone();
            let rpc_timeout = self.rpc_timeout();
            requests.spawn(async move {
                (peer_id, timeout(rpc_timeout, client.request_vote(req)).await)
            });
        }

        let mut vote_count = 1u64; // Vote for self
        while let Some(joined) = requests.join_next().await {
            let Ok((peer_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(Ok(response)) => {
                    let resp = response.into_inner();
                    if resp.term > term {
                        // Higher term seen, become follower
                        let mut state = self.state.write().await;
                        state.become_follower(resp.term);
                        self.publish(&state);
                        return;
                    }
                    if resp.vote_granted {
                        vote_count += 1;
                        tracing::debug!(node_id = %self.id, peer_id = %peer_id, votes = vote_count, "Received vote");
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer_id = %peer_id, error = %e, "Vote request failed");
                }
                Err(_) => {
                    tracing::debug!(peer_id = %peer_id, "Vote request timed out");
                }
            }
        }

        // Check if we won
        let mut state = self.state.write().await;
        if state.role == RaftRole::Candidate && state.current_term == term {
            state.votes_received = vote_count;
            if vote_count >= majority {
                state.become_leader(&self.id);
                *self.last_quorum.write().await = election_start;
                tracing::info!(node_id = %self.id, term, votes = vote_count, "Became leader");
            } else {
                tracing::debug!(
                    node_id = %self.id,
                    term,
                    votes = vote_count,
                    needed = majority,
                    "Election failed, not enough votes"
                );
            }
        }
        self.publish(&state);
    }

    /// Send heartbeats to all followers (leader only)
    async fn send_heartbeats(&self) {
        let state = self.state.read().await;
        if !state.is_leader() {
            return;
        }
        let term = state.current_term;
        drop(state);

        // Followers reset their timers no earlier than this.
        let round_start = Instant::now();
        let req = HeartbeatRequest {
            election: self.election.clone(),
            term,
            leader_id: self.id.clone(),
        };

        let mut requests = JoinSet::new();
        for (peer_id, client) in &self.peers {
            let mut client = client.clone();
            let peer_id = peer_id.clone();
            let req = req.clone();
            let rpc_timeout = self.rpc_timeout();
            requests.spawn(async move { (peer_id, timeout(rpc_timeout, client.heartbeat(req)).await) });
        }

        let mut acks = 1usize; // self
        while let Some(joined) = requests.join_next().await {
            let Ok((peer_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(Ok(response)) => {
                    let resp = response.into_inner();
                    if resp.term > term {
                        let mut state = self.state.write().await;
                        state.become_follower(resp.term);
                        self.publish(&state);
                        tracing::info!(node_id = %self.id, term = resp.term, "Higher term seen, stepping down");
                        return;
                    }
                    if resp.success {
                        acks += 1;
                    }
                }
                Ok(Err(e)) => {
                    tracing::trace!(peer_id = %peer_id, error = %e, "Heartbeat failed");
                }
                Err(_) => {
                    tracing::trace!(peer_id = %peer_id, "Heartbeat timed out");
                }
            }
        }

        if acks >= self.config.majority() {
            *self.last_quorum.write().await = round_start;
        }
    }

    /// Step down once the leader lease measured from the last acknowledged
    /// round has run out.
    async fn check_quorum(&self) {
        let lease = self.config.leader_lease();
        let elapsed = self.last_quorum.read().await.elapsed();
        if elapsed < lease {
            return;
        }

        let mut state = self.state.write().await;
        if state.is_leader() {
            tracing::warn!(
                node_id = %self.id,
                elapsed_ms = elapsed.as_millis(),
                "Lost contact with quorum, stepping down"
            );
            state.step_down();
            self.publish(&state);
        }
    }

    /// Give up leadership and hold off candidacy for one election timeout.
    pub async fn resign(&self) {
        self.set_campaigning(false);
        let mut state = self.state.write().await;
        if state.is_leader() {
            tracing::info!(node_id = %self.id, term = state.current_term, "Resigning leadership");
            state.step_down();
            self.publish(&state);
        }
        drop(state);
        *self.last_heartbeat.write().await = Instant::now();
    }

    /// Whether the leader this node knows about may still be leading. Votes
    /// for anyone else are refused meanwhile so a peer that merely lost
    /// contact with a healthy leader cannot depose it.
    async fn leader_is_live(&self, state: &RaftState, candidate_id: &str) -> bool {
        match state.leader_id.as_deref() {
            None => false,
            Some(leader) if leader == candidate_id => false,
            Some(leader) if leader == self.id => {
                self.last_quorum.read().await.elapsed() < self.config.leader_lease()
            }
            Some(_) => {
                self.last_heartbeat.read().await.elapsed()
                    < Duration::from_millis(self.config.election_timeout_min_ms)
            }
        }
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_vote_request(&self, req: VoteRequest) -> VoteResponse {
        let mut state = self.state.write().await;
        if self.leader_is_live(&state, &req.candidate_id).await {
            tracing::debug!(
                node_id = %self.id,
                candidate = %req.candidate_id,
                term = req.term,
                leader = ?state.leader_id,
                "Rejecting vote while leader is live"
            );
            return VoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }
        let response = handle_request_vote(&mut state, &req, &self.id);
        self.publish(&state);
        drop(state);

        // Reset election timeout if we granted vote
        if response.vote_granted {
            *self.last_heartbeat.write().await = Instant::now();
        }

        response
    }

    /// Handle incoming Heartbeat RPC
    pub async fn handle_heartbeat(&self, req: HeartbeatRequest) -> HeartbeatResponse {
        let mut state = self.state.write().await;
        let response = handle_heartbeat(&mut state, &req, &self.id);
        self.publish(&state);
        drop(state);

        if response.success {
            *self.last_heartbeat.write().await = Instant::now();
        }

        response
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.state.read().await.is_leader()
    }

    /// Get the current leader ID
    pub async fn get_leader_id(&self) -> Option<String> {
        self.state.read().await.leader_id.clone()
    }
}
