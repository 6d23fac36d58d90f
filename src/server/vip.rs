use crate::error::Result;
use crate::server::Server;
use crate::vip::VipManager;

/// Runs a [`VipManager`] as part of the supervised server list.
pub struct VipManagerServer {
    name: String,
    manager: VipManager,
}

impl VipManagerServer {
    pub fn new(manager: VipManager) -> Self {
        Self {
            name: manager.name(),
            manager,
        }
    }

    pub fn manager(&self) -> &VipManager {
        &self.manager
    }
}

#[tonic::async_trait]
impl Server for VipManagerServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        self.manager.start();
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.manager.stop().await;
        Ok(())
    }
}
