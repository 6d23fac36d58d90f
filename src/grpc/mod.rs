pub mod election_service;
pub mod server;

pub use election_service::ElectionService;
pub use server::GrpcServer;
