use crate::proto::{HeartbeatRequest, HeartbeatResponse, VoteRequest, VoteResponse};
use crate::raft::state::RaftState;

/// Handle RequestVote RPC
pub fn handle_request_vote(state: &mut RaftState, req: &VoteRequest, my_id: &str) -> VoteResponse {
    // If request term is greater, update our term and become follower
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let vote_granted = if req.term < state.current_term {
        // Reject if request term is less than our current term
        false
    } else if state.voted_for.is_some() && state.voted_for.as_deref() != Some(&req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else {
        state.voted_for = Some(req.candidate_id.clone());
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = %req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle Heartbeat RPC from a leader
pub fn handle_heartbeat(state: &mut RaftState, req: &HeartbeatRequest, my_id: &str) -> HeartbeatResponse {
    if req.term < state.current_term {
        return HeartbeatResponse {
            term: state.current_term,
            success: false,
        };
    }

    if state.leader_id.as_deref() != Some(&req.leader_id) {
        tracing::info!(node_id = my_id, leader = %req.leader_id, term = req.term, "Following new leader");
    }
    state.follow(req.term, &req.leader_id);

    HeartbeatResponse {
        term: state.current_term,
        success: true,
    }
}
