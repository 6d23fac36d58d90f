pub mod election;
pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;

pub use election::{RaftElection, RaftElectionFactory};
pub use node::RaftNode;
pub use state::{RaftRole, RaftState};
