pub mod command;
pub mod config;
pub mod election;
pub mod error;
pub mod grpc;
pub mod raft;
pub mod server;
pub mod shutdown;
pub mod supervisor;
pub mod vip;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("election");
}
