//! Administrative control: liveness and graceful evacuation.

use std::sync::Arc;

use async_trait::async_trait;
use nfsvol_common::{DriverError, DriverResult};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Something that can release all of its resources before shutdown.
#[async_trait]
pub trait Drainable: Send + Sync {
    /// Release everything.
    ///
    /// # Errors
    ///
    /// Implementations may report a failure; evacuation logs it and moves on.
    async fn drain(&self, ctx: &CancellationToken) -> DriverResult<()>;
}

/// Handle to the process serving plugin requests.
pub trait ServerProcess: Send + Sync {
    /// Ask the server to stop.
    fn interrupt(&self);
}

impl ServerProcess for CancellationToken {
    fn interrupt(&self) {
        self.cancel();
    }
}

/// Drains registered resources and stops the server on request.
#[derive(Default)]
pub struct DriverAdmin {
    server: RwLock<Option<Arc<dyn ServerProcess>>>,
    drainables: RwLock<Vec<Arc<dyn Drainable>>>,
}

impl DriverAdmin {
    /// Create an admin with nothing registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server stopped by [`DriverAdmin::evacuate`].
    pub fn set_server_process(&self, server: Arc<dyn ServerProcess>) {
        *self.server.write() = Some(server);
    }

    /// Add something to drain on evacuation.
    pub fn register_drainable(&self, drainable: Arc<dyn Drainable>) {
        self.drainables.write().push(drainable);
    }

    /// Drain everything, then interrupt the server.
    ///
    /// # Errors
    ///
    /// Fails if no server process has been registered. Drain failures are
    /// only logged.
    pub async fn evacuate(&self, ctx: &CancellationToken) -> DriverResult<()> {
        tracing::info!("Evacuate start");

        let Some(server) = self.server.read().clone() else {
            tracing::error!("Evacuate requested before the server was registered");
            return Err(DriverError::ServerNotFound);
        };

        let drainables = self.drainables.read().clone();
        for drainable in drainables {
            if let Err(e) = drainable.drain(ctx).await {
                tracing::error!(error = %e, "Failed draining");
            }
        }

        server.interrupt();
        tracing::info!("Evacuate end");
        Ok(())
    }

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn ping(&self) -> DriverResult<()> {
        tracing::debug!("Ping");
        Ok(())
    }
}
