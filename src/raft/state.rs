/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Election state of one node. There is no replicated log: the only thing
/// agreed upon is who leads the current term.
///
/// # Safety Invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term. Enforced by:
/// - Each node votes for at most one candidate per term (`voted_for`)
/// - Candidate must receive majority of votes to become leader
///
/// ## Leader Lease
/// The lease runs from the start of the last heartbeat round a majority
/// acknowledged and lasts the minimum election timeout less one RPC timeout.
/// A cut-off leader steps down when it runs out. Followers refuse votes for
/// a minimum election timeout after the last heartbeat, so no new leader can
/// win before the old lease has ended.
#[derive(Debug)]
pub struct RaftState {
    pub current_term: u64,
    pub voted_for: Option<String>,

    // Current role
    pub role: RaftRole,

    // Known leader (if any)
    pub leader_id: Option<String>,

    // Votes received in current election (for candidates)
    pub votes_received: u64,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: 0,
        }
    }

    /// Transition to follower state. The vote is only reset when the term
    /// advances.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.leader_id = None;
        self.votes_received = 0;
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_id: &str) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id.to_string());
        self.votes_received = 1; // Vote for self
        self.leader_id = None;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: &str) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id.to_string());
    }

    /// Leave leadership without changing the term.
    pub fn step_down(&mut self) {
        let term = self.current_term;
        self.become_follower(term);
    }

    /// Record a valid leader for `term`.
    pub fn follow(&mut self, term: u64, leader_id: &str) {
        if term > self.current_term || self.role != RaftRole::Follower {
            self.become_follower(term);
        }
        self.leader_id = Some(leader_id.to_string());
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_follower() {
        let state = RaftState::new();
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 0);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.leader_id, None);
    }

    #[test]
    fn test_become_candidate() {
        let mut state = RaftState::new();
        state.become_candidate("a");

        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for.as_deref(), Some("a"));
        assert_eq!(state.votes_received, 1); // Self-vote
        assert_eq!(state.leader_id, None);
    }

    #[test]
    fn test_become_leader() {
        let mut state = RaftState::new();
        state.become_candidate("a");
        state.become_leader("a");

        assert!(state.is_leader());
        assert_eq!(state.leader_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_become_follower_with_higher_term() {
        let mut state = RaftState::new();
        state.become_candidate("a");
        state.become_follower(5);

        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 5);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.votes_received, 0);
    }

    #[test]
    fn test_step_down_keeps_term_and_vote() {
        let mut state = RaftState::new();
        state.become_candidate("a");
        state.become_leader("a");
        state.step_down();

        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for.as_deref(), Some("a"));
        assert_eq!(state.leader_id, None);
    }

    #[test]
    fn test_follow_records_leader() {
        let mut state = RaftState::new();
        state.become_candidate("a");
        state.follow(1, "b");

        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.leader_id.as_deref(), Some("b"));

        state.follow(3, "c");
        assert_eq!(state.current_term, 3);
        assert_eq!(state.leader_id.as_deref(), Some("c"));
    }

    #[test]
    fn test_role_display() {
        assert_eq!(RaftRole::Follower.to_string(), "follower");
        assert_eq!(RaftRole::Candidate.to_string(), "candidate");
        assert_eq!(RaftRole::Leader.to_string(), "leader");
    }
}
