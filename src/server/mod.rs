//! Long-running units the supervisor starts and stops as a group.

pub mod process;
pub mod vip;

use crate::config::{NodeContext, ServerConfig};
use crate::error::Result;

pub use process::{ProcessServer, ProcessServerFactory};
pub use vip::VipManagerServer;

/// A startable and stoppable unit.
///
/// `start` must return once the unit runs; it does not wait for it to end.
/// `stop` is best-effort and safe to call on a unit that never started.
#[tonic::async_trait]
pub trait Server: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&mut self) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;
}

/// Builds the server of one configured entry. `path` is the augmented
/// `PATH` the server runs with.
pub trait ServerFactory: Send + Sync {
    fn create(&self, context: &NodeContext, config: &ServerConfig, path: &str) -> Result<Box<dyn Server>>;
}
