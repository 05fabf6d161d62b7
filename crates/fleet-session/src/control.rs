use async_trait::async_trait;
use fly_api::{App, LaunchMachineRequest, Machine};
use tracing::info;

use crate::{Error, Result};

/// The cloud control plane, as far as the supervisor needs it.
///
/// Implemented for Fly.io by [`crate::fly::FlyControlPlane`]; tests substitute
/// an in-memory fake.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Create an app in the given organization.
    async fn create_app(&self, name: &str, org: &str) -> Result<()>;

    /// Look up an app; `NotFound` means it does not exist yet.
    async fn get_app(&self, name: &str) -> Result<App>;

    /// Create and boot a machine.
    async fn launch_machine(&self, app: &str, spec: &LaunchMachineRequest) -> Result<Machine>;

    /// Current descriptor of one machine.
    async fn get_machine_status(&self, app: &str, machine_id: &str) -> Result<Machine>;

    async fn start_machine(&self, app: &str, machine_id: &str) -> Result<()>;

    async fn stop_machine(&self, app: &str, machine_id: &str) -> Result<()>;

    async fn delete_machine(&self, app: &str, machine_id: &str) -> Result<()>;

    async fn list_machines(&self, app: &str) -> Result<Vec<Machine>>;
}

/// Look the app up, creating it when the control plane says it does not exist.
pub async fn ensure_app(control: &dyn ControlPlane, name: &str, org: &str) -> Result<App> {
    match control.get_app(name).await {
        Ok(app) => Ok(app),
        Err(Error::ControlPlane(e)) if e.is_not_found() => {
            info!(app = name, org, "app does not exist yet, creating it");
            control.create_app(name, org).await?;
            control.get_app(name).await
        }
        Err(e) => Err(e),
    }
}
