use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ElectionConfig, ElectionTiming};
use crate::election::{ElectionClient, ElectionError, ElectionFactory, Peers};
use crate::error::{Result, TewError};
use crate::grpc::GrpcServer;
use crate::raft::RaftNode;

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// [`ElectionClient`] backed by an election-only Raft group.
///
/// The gRPC listener and the election loop are started by the first
/// campaign, so a port conflict surfaces as a campaign error that the VIP
/// manager retries.
pub struct RaftElection {
    config: ElectionConfig,
    node: Arc<RaftNode>,
    running: Mutex<Option<Running>>,
}

impl RaftElection {
    pub fn new(config: ElectionConfig) -> Result<Self> {
        let node = Arc::new(RaftNode::new(config.clone())?);
        Ok(Self {
            config,
            node,
            running: Mutex::new(None),
        })
    }

    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    async fn ensure_running(&self) -> std::result::Result<(), ElectionError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let server = GrpcServer::bind(self.config.listen_addr, self.node.clone())
            .await
            .map_err(|e| {
                ElectionError::Unavailable(format!(
                    "cannot listen on {}: {}",
                    self.config.listen_addr, e
                ))
            })?;

        let cancel = CancellationToken::new();

        let server_cancel = cancel.clone();
        let election = self.config.election.clone();
        let server_task = tokio::spawn(async move {
            if let Err(e) = server.run(server_cancel).await {
                tracing::error!(election = %election, error = %e, "Election gRPC server failed");
            }
        });

        let node = self.node.clone();
        let loop_cancel = cancel.clone();
        let loop_task = tokio::spawn(async move {
            node.run(loop_cancel).await;
        });

        *running = Some(Running {
            cancel,
            tasks: vec![server_task, loop_task],
        });
        Ok(())
    }
}

#[tonic::async_trait]
impl ElectionClient for RaftElection {
    fn candidate_id(&self) -> &str {
        &self.config.node_id
    }

    async fn campaign(&self) -> std::result::Result<(), ElectionError> {
        self.ensure_running().await?;
        self.node.set_campaigning(true);

        let id = self.config.node_id.as_str();
        let mut leader = self.node.subscribe_leader();
        leader
            .wait_for(|current| current.as_deref() == Some(id))
            .await
            .map(|_| ())
            .map_err(|_| ElectionError::Closed)
    }

    async fn resign(&self) -> std::result::Result<(), ElectionError> {
        self.node.resign().await;
        Ok(())
    }

    fn observe(&self) -> watch::Receiver<Option<String>> {
        self.node.subscribe_leader()
    }

    async fn shutdown(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.cancel.cancel();
            for task in running.tasks {
                let _ = task.await;
            }
            tracing::info!(election = %self.config.election, node_id = %self.config.node_id, "Election stopped");
        }
    }
}

/// Creates one [`RaftElection`] per VIP manager. The listener binds all
/// interfaces on the port of the node's own endpoint.
#[derive(Debug, Clone, Default)]
pub struct RaftElectionFactory {
    timing: ElectionTiming,
}

impl RaftElectionFactory {
    pub fn new(timing: ElectionTiming) -> Self {
        Self { timing }
    }
}

fn endpoint_port(endpoint: &str) -> Result<u16> {
    endpoint
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| TewError::Config(format!("invalid election endpoint {:?}", endpoint)))
}

impl ElectionFactory for RaftElectionFactory {
    fn create(
        &self,
        election: &str,
        node_id: &str,
        endpoint: &str,
        peers: &Peers,
    ) -> Result<Arc<dyn ElectionClient>> {
        let listen_addr = SocketAddr::from(([0, 0, 0, 0], endpoint_port(endpoint)?));

        let mut names: Vec<&String> = peers.keys().filter(|name| name.as_str() != node_id).collect();
        names.sort();

        let mut config = ElectionConfig::new(node_id, election, listen_addr).with_timing(&self.timing);
        for name in names {
            config = config.with_peer(name.clone(), peers[name].clone());
        }

        Ok(Arc::new(RaftElection::new(config)?))
    }
}
