use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::proto::election_service_server::ElectionService as ElectionRpc;
use crate::proto::{HeartbeatRequest, HeartbeatResponse, VoteRequest, VoteResponse};
use crate::raft::RaftNode;

/// gRPC service for node-to-node election traffic
pub struct ElectionService {
    raft_node: Arc<RaftNode>,
}

impl ElectionService {
    pub fn new(raft_node: Arc<RaftNode>) -> Self {
        Self { raft_node }
    }

    fn check_election(&self, election: &str) -> Result<(), Status> {
        if election != self.raft_node.election {
            return Err(Status::failed_precondition(format!(
                "node {} serves election {}, not {}",
                self.raft_node.id, self.raft_node.election, election
            )));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl ElectionRpc for ElectionService {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        self.check_election(&req.election)?;
        tracing::debug!(
            candidate = %req.candidate_id,
            term = req.term,
            "Received RequestVote"
        );

        let response = self.raft_node.handle_vote_request(req).await;
        Ok(Response::new(response))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        self.check_election(&req.election)?;
        tracing::trace!(leader = %req.leader_id, term = req.term, "Received Heartbeat");

        let response = self.raft_node.handle_heartbeat(req).await;
        Ok(Response::new(response))
    }
}
