//! Common test utilities for deployments integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use armada_deployments::store::MemoryStore;
use armada_deployments::{
    Deployment, DeploymentConstructor, DeploymentId, DeploymentsModel, DeviceDeploymentStatus,
    DeviceId, ImageBasedGenerator, ImageLinker, ModelSettings,
};

use fixtures::{FakeCatalogue, FakeInventory};

/// Model over a memory store and fake collaborators.
///
/// Devices named `pi-*` are `rpi4`, `bb-*` are `beaglebone` and `x86-*` are
/// `x86`. The catalogue carries `App-1.0` for `rpi4` and `beaglebone` and
/// `App-2.0` for `rpi4` only; nothing matches `x86`.
pub struct TestDeployments {
    pub model: Arc<DeploymentsModel>,
    pub store: Arc<MemoryStore>,
    pub inventory: Arc<FakeInventory>,
}

impl TestDeployments {
    pub fn new() -> Self {
        Self::with_settings(ModelSettings::default())
    }

    pub fn with_settings(settings: ModelSettings) -> Self {
        Self::build(fleet(), None, settings)
    }

    pub fn with_inventory(inventory: FakeInventory, settings: ModelSettings) -> Self {
        Self::build(inventory, None, settings)
    }

    pub fn with_linker(linker: Arc<dyn ImageLinker>, settings: ModelSettings) -> Self {
        Self::build(fleet(), Some(linker), settings)
    }

    fn build(
        inventory: FakeInventory,
        linker: Option<Arc<dyn ImageLinker>>,
        settings: ModelSettings,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.ensure_text_index();

        let inventory = Arc::new(inventory);
        let catalogue = Arc::new(catalogue());
        let linker: Arc<dyn ImageLinker> = match linker {
            Some(linker) => linker,
            None => catalogue.clone(),
        };
        let generator = Arc::new(ImageBasedGenerator::new(
            inventory.clone(),
            catalogue,
            settings.collaborator_timeout,
        ));

        let model = Arc::new(DeploymentsModel::new(
            Arc::clone(&store),
            generator,
            linker,
            settings,
        ));
        Self {
            model,
            store,
            inventory,
        }
    }

    /// Create a deployment of `artifact` to `devices`.
    pub async fn create(&self, name: &str, artifact: &str, devices: &[&str]) -> DeploymentId {
        let constructor =
            DeploymentConstructor::new(name, artifact, devices.iter().map(|d| DeviceId::new(*d)));
        self.model
            .create_deployment(constructor, &CancellationToken::new())
            .await
            .expect("create failed")
    }

    /// Persisted deployment, panicking if it is missing.
    pub async fn deployment(&self, id: &DeploymentId) -> Deployment {
        self.model
            .get_deployment(id)
            .await
            .expect("get failed")
            .expect("deployment missing")
    }

    /// Report a device status, panicking on refusal.
    pub async fn report(&self, id: &DeploymentId, device: &str, status: DeviceDeploymentStatus) {
        self.model
            .update_device_deployment_status(id, &DeviceId::new(device), status)
            .await
            .expect("status update failed");
    }
}

impl Default for TestDeployments {
    fn default() -> Self {
        Self::new()
    }
}

pub fn fleet() -> FakeInventory {
    FakeInventory::new()
        .with_prefix("pi-", "rpi4")
        .with_prefix("bb-", "beaglebone")
        .with_prefix("x86-", "x86")
}

pub fn catalogue() -> FakeCatalogue {
    FakeCatalogue::new()
        .with_image("img-app1-pi", "App-1.0", &["rpi3", "rpi4"])
        .with_image("img-app1-bb", "App-1.0", &["beaglebone"])
        .with_image("img-app2-pi", "App-2.0", &["rpi4"])
}
