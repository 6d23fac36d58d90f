use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::election::{election_name, ElectionClient, ElectionFactory, Peers};
use crate::error::Result;
use crate::vip::interface::NetworkInterface;

/// Pause between campaigns after an election backend error.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VipRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for VipRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VipRole::Follower => write!(f, "follower"),
            VipRole::Candidate => write!(f, "candidate"),
            VipRole::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VipSettings {
    /// Node role the election is held among (`controller` or `worker`).
    pub role: String,
    pub node_id: String,
    /// This node's election endpoint, `ip:port`.
    pub endpoint: String,
    pub virtual_ip: String,
    pub interface: String,
    pub peers: Peers,
}

impl VipSettings {
    pub fn is_configured(&self) -> bool {
        !self.virtual_ip.is_empty() && !self.interface.is_empty() && !self.peers.is_empty()
    }

    pub fn election(&self) -> String {
        election_name(&self.role)
    }
}

struct Inner {
    settings: VipSettings,
    election: String,
    client: Arc<dyn ElectionClient>,
    interface: Arc<dyn NetworkInterface>,
    retry_interval: Duration,
    bound: AtomicBool,
    role_tx: watch::Sender<VipRole>,
}

impl Inner {
    fn set_role(&self, role: VipRole) {
        let previous = self.role_tx.send_replace(role);
        if previous != role {
            tracing::debug!(
                election = %self.election,
                node_id = %self.settings.node_id,
                from = %previous,
                to = %role,
                "VIP manager role changed"
            );
        }
    }

    /// Bind the alias. An alias that is already on the interface, for
    /// instance left behind by a crashed run, is taken over: the leader owns
    /// it from now on and removes it when leadership ends.
    async fn bind(&self) -> Result<()> {
        let settings = &self.settings;
        let added = self
            .interface
            .add_address(&settings.virtual_ip, &settings.interface)
            .await?;
        self.bound.store(true, Ordering::SeqCst);
        if !added {
            tracing::warn!(
                election = %self.election,
                node_id = %settings.node_id,
                virtual_ip = %settings.virtual_ip,
                interface = %settings.interface,
                "Virtual IP already present, taking it over"
            );
            return Ok(());
        }
        tracing::info!(
            election = %self.election,
            node_id = %settings.node_id,
            virtual_ip = %settings.virtual_ip,
            interface = %settings.interface,
            "Bound virtual IP"
        );
        Ok(())
    }

    /// Remove the alias if this manager bound it.
    async fn unbind(&self) {
        if !self.bound.swap(false, Ordering::SeqCst) {
            return;
        }

        let settings = &self.settings;
        match self
            .interface
            .remove_address(&settings.virtual_ip, &settings.interface)
            .await
        {
            Ok(()) => tracing::info!(
                election = %self.election,
                node_id = %settings.node_id,
                virtual_ip = %settings.virtual_ip,
                "Released virtual IP"
            ),
            Err(e) => tracing::error!(
                election = %self.election,
                virtual_ip = %settings.virtual_ip,
                error = %e,
                "Failed to release virtual IP"
            ),
        }
    }

    async fn resign(&self) {
        if let Err(e) = self.client.resign().await {
            tracing::warn!(election = %self.election, error = %e, "Resign failed");
        }
    }

    /// Sleep the retry interval; false when cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.retry_interval) => true,
        }
    }

    async fn campaign_loop(&self, cancel: CancellationToken) {
        let node_id = self.settings.node_id.as_str();

        loop {
            self.set_role(VipRole::Candidate);

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.client.campaign() => result,
            };

            if let Err(e) = result {
                tracing::warn!(election = %self.election, node_id, error = %e, "Campaign failed, retrying");
                self.set_role(VipRole::Follower);
                if !self.pause(&cancel).await {
                    break;
                }
                continue;
            }

            let mut leader = self.client.observe();

            if let Err(e) = self.bind().await {
                tracing::error!(
                    election = %self.election,
                    virtual_ip = %self.settings.virtual_ip,
                    error = %e,
                    "Failed to bind virtual IP, giving up leadership"
                );
                self.resign().await;
                self.set_role(VipRole::Follower);
                if !self.pause(&cancel).await {
                    break;
                }
                continue;
            }

            self.set_role(VipRole::Leader);
            tracing::info!(election = %self.election, node_id, "Became VIP leader");

            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = leadership_lost(&mut leader, node_id) => false,
            };

            // A node that is no longer leader must not keep the address.
            self.unbind().await;
            self.resign().await;
            self.set_role(VipRole::Follower);

            if cancelled {
                break;
            }
            tracing::warn!(election = %self.election, node_id, "Lost VIP leadership");
        }

        self.unbind().await;
        self.set_role(VipRole::Follower);
    }
}

/// Resolves once `node_id` no longer leads, or the backend went away.
async fn leadership_lost(leader: &mut watch::Receiver<Option<String>>, node_id: &str) {
    let _ = leader
        .wait_for(|current| current.as_deref() != Some(node_id))
        .await
        .map(|_| ());
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Keeps a virtual IP bound on whichever node leads the election of its
/// role. Followers stand by and campaign again whenever leadership is free.
pub struct VipManager {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl VipManager {
    /// Build a manager, or `None` when the VIP, interface or peers are not
    /// configured.
    pub fn new(
        settings: VipSettings,
        elections: &dyn ElectionFactory,
        interface: Arc<dyn NetworkInterface>,
    ) -> Result<Option<Self>> {
        if !settings.is_configured() {
            return Ok(None);
        }

        let client = elections.create(
            &settings.election(),
            &settings.node_id,
            &settings.endpoint,
            &settings.peers,
        )?;
        Ok(Self::with_client(settings, client, interface))
    }

    pub fn with_client(
        settings: VipSettings,
        client: Arc<dyn ElectionClient>,
        interface: Arc<dyn NetworkInterface>,
    ) -> Option<Self> {
        if !settings.is_configured() {
            return None;
        }

        let (role_tx, _) = watch::channel(VipRole::Follower);
        Some(Self {
            inner: Arc::new(Inner {
                election: settings.election(),
                settings,
                client,
                interface,
                retry_interval: DEFAULT_RETRY_INTERVAL,
                bound: AtomicBool::new(false),
                role_tx,
            }),
            running: Mutex::new(None),
        })
    }

    /// Only effective before [`start`](Self::start).
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.retry_interval = retry_interval;
        }
        self
    }

    pub fn name(&self) -> String {
        format!("{}-vip-manager", self.inner.settings.role)
    }

    pub fn settings(&self) -> &VipSettings {
        &self.inner.settings
    }

    pub fn role(&self) -> VipRole {
        *self.inner.role_tx.borrow()
    }

    pub fn subscribe_role(&self) -> watch::Receiver<VipRole> {
        self.inner.role_tx.subscribe()
    }

    /// Whether this manager currently holds the virtual IP.
    pub fn is_bound(&self) -> bool {
        self.inner.bound.load(Ordering::SeqCst)
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Launch the campaign loop and return without waiting for leadership.
    pub fn start(&self) {
        let mut running = self.lock_running();
        if running.is_some() {
            return;
        }

        let settings = &self.inner.settings;
        tracing::info!(
            election = %self.inner.election,
            node_id = %settings.node_id,
            endpoint = %settings.endpoint,
            virtual_ip = %settings.virtual_ip,
            interface = %settings.interface,
            peers = settings.peers.len(),
            "Starting VIP manager"
        );

        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move { inner.campaign_loop(loop_cancel).await });

        *running = Some(Running { cancel, handle });
    }

    /// Cancel the campaign, release the address and resign. Idempotent.
    pub async fn stop(&self) {
        let running = self.lock_running().take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                tracing::error!(election = %self.inner.election, error = %e, "Campaign loop panicked");
            }
        }

        self.inner.unbind().await;
        self.inner.resign().await;
        self.inner.client.shutdown().await;
        self.inner.set_role(VipRole::Follower);
    }
}
