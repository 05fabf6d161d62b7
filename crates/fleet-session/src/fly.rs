use async_trait::async_trait;
use fly_api::{App, LaunchMachineRequest, Machine};
use tracing::info;

use crate::credentials::{self, CredentialStore};
use crate::{ControlPlane, Error, Result};

/// Fly.io Machines API control plane.
///
/// Delegates to `fly_api::FlyClient` for all HTTP calls.
pub struct FlyControlPlane {
    client: fly_api::FlyClient,
}

impl FlyControlPlane {
    pub fn new(client: fly_api::FlyClient) -> Self {
        Self { client }
    }

    /// Build from the API token held in the credential store.
    pub fn from_credentials(store: &dyn CredentialStore) -> Result<Self> {
        let token = store
            .get(credentials::FLY_API_TOKEN)
            .ok_or_else(|| Error::MissingEnv("FLY_API_TOKEN".into()))?;
        Ok(Self::new(fly_api::FlyClient::new(token)))
    }
}

#[async_trait]
impl ControlPlane for FlyControlPlane {
    async fn create_app(&self, name: &str, org: &str) -> Result<()> {
        self.client.create_app(name, org).await?;
        info!(app = name, org, "fly: app created");
        Ok(())
    }

    async fn get_app(&self, name: &str) -> Result<App> {
        Ok(self.client.get_app(name).await?)
    }

    async fn launch_machine(&self, app: &str, spec: &LaunchMachineRequest) -> Result<Machine> {
        let machine = self.client.launch_machine(app, spec).await?;
        info!(machine_id = %machine.id, state = %machine.state, "fly: machine launched");
        Ok(machine)
    }

    async fn get_machine_status(&self, app: &str, machine_id: &str) -> Result<Machine> {
        Ok(self.client.get_machine(app, machine_id).await?)
    }

    async fn start_machine(&self, app: &str, machine_id: &str) -> Result<()> {
        self.client.start_machine(app, machine_id).await?;
        info!(machine_id, "fly: machine start requested");
        Ok(())
    }

    async fn stop_machine(&self, app: &str, machine_id: &str) -> Result<()> {
        self.client.stop_machine(app, machine_id).await?;
        info!(machine_id, "fly: machine stop requested");
        Ok(())
    }

    async fn delete_machine(&self, app: &str, machine_id: &str) -> Result<()> {
        self.client.delete_machine(app, machine_id).await?;
        info!(machine_id, "fly: machine deleted");
        Ok(())
    }

    async fn list_machines(&self, app: &str) -> Result<Vec<Machine>> {
        Ok(self.client.list_machines(app).await?)
    }
}
