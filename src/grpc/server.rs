use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::error::Result;
use crate::grpc::election_service::ElectionService;
use crate::proto::election_service_server::ElectionServiceServer;
use crate::raft::RaftNode;

pub struct GrpcServer {
    listener: TcpListener,
    raft_node: Arc<RaftNode>,
}

impl GrpcServer {
    /// Bind the listener up front so an occupied port is reported to the
    /// caller instead of inside the serving task.
    pub async fn bind(addr: SocketAddr, raft_node: Arc<RaftNode>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            raft_node,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        let election_service = ElectionService::new(self.raft_node.clone());

        tracing::info!(addr = %addr, election = %self.raft_node.election, "Starting gRPC server");

        Server::builder()
            .add_service(ElectionServiceServer::new(election_service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), async move {
                cancel.cancelled().await
            })
            .await?;
        Ok(())
    }
}
