//! Fake collaborators and fault-injecting store wrappers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use armada_deployments::store::MemoryStore;
use armada_deployments::{
    DeploymentError, DeploymentId, DeploymentResult, DeviceDeployment, DeviceDeploymentStatus,
    DeviceDeploymentStore, DeviceId, DeviceTypeResolver, DownloadLinkExpiry, Image, ImageFinder,
    ImageId, ImageLinker, Link, Stats,
};

/// Device inventory answering from a fixed table.
#[derive(Default)]
pub struct FakeInventory {
    device_types: HashMap<String, String>,
    prefixes: Vec<(String, String)>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device_id: &str, device_type: &str) -> Self {
        self.device_types
            .insert(device_id.to_owned(), device_type.to_owned());
        self
    }

    /// Resolve every device whose id starts with `prefix`.
    pub fn with_prefix(mut self, prefix: &str, device_type: &str) -> Self {
        self.prefixes
            .push((prefix.to_owned(), device_type.to_owned()));
        self
    }

    /// Sleep before answering each lookup.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceTypeResolver for FakeInventory {
    async fn get_device_type(&self, device_id: &DeviceId) -> DeploymentResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let id = device_id.as_str();
        self.device_types
            .get(id)
            .or_else(|| {
                self.prefixes
                    .iter()
                    .find(|(prefix, _)| id.starts_with(prefix.as_str()))
                    .map(|(_, device_type)| device_type)
            })
            .cloned()
            .ok_or_else(|| DeploymentError::Inventory(format!("device {device_id} not found")))
    }
}

/// Artifact catalogue holding a fixed set of images.
#[derive(Default)]
pub struct FakeCatalogue {
    images: Vec<Image>,
}

impl FakeCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, id: &str, artifact_name: &str, device_types: &[&str]) -> Self {
        self.images.push(Image {
            id: ImageId::new(id),
            artifact_name: artifact_name.to_owned(),
            device_types_compatible: device_types.iter().map(|t| (*t).to_owned()).collect(),
        });
        self
    }
}

#[async_trait]
impl ImageFinder for FakeCatalogue {
    async fn image_by_name_and_device_type(
        &self,
        artifact_name: &str,
        device_type: &str,
    ) -> DeploymentResult<Option<Image>> {
        Ok(self
            .images
            .iter()
            .find(|i| {
                i.artifact_name == artifact_name
                    && i.device_types_compatible.iter().any(|t| t == device_type)
            })
            .cloned())
    }
}

#[async_trait]
impl ImageLinker for FakeCatalogue {
    async fn get_request(
        &self,
        image_id: &ImageId,
        expiry: DownloadLinkExpiry,
    ) -> DeploymentResult<Link> {
        let ttl = chrono::Duration::from_std(expiry.as_duration())
            .map_err(|e| DeploymentError::Link(e.to_string()))?;
        Ok(Link {
            uri: format!("https://blobs.test/{image_id}"),
            expire: Utc::now() + ttl,
            method: "GET".to_owned(),
            header: Default::default(),
        })
    }
}

/// Linker that never answers.
pub struct StuckLinker;

#[async_trait]
impl ImageLinker for StuckLinker {
    async fn get_request(
        &self,
        _image_id: &ImageId,
        _expiry: DownloadLinkExpiry,
    ) -> DeploymentResult<Link> {
        std::future::pending().await
    }
}

/// Device record store whose bulk insert always fails.
pub struct FailingInsertStore {
    inner: Arc<MemoryStore>,
}

impl FailingInsertStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl DeviceDeploymentStore for FailingInsertStore {
    async fn insert_many(&self, _records: &[DeviceDeployment]) -> DeploymentResult<()> {
        Err(DeploymentError::internal("injected insert failure"))
    }

    async fn exist_assigned_image_with_id_and_statuses(
        &self,
        image_id: &ImageId,
        statuses: &[DeviceDeploymentStatus],
    ) -> DeploymentResult<bool> {
        self.inner
            .exist_assigned_image_with_id_and_statuses(image_id, statuses)
            .await
    }

    async fn find_oldest_for_device_with_statuses(
        &self,
        device_id: &DeviceId,
        statuses: &[DeviceDeploymentStatus],
    ) -> DeploymentResult<Option<DeviceDeployment>> {
        self.inner
            .find_oldest_for_device_with_statuses(device_id, statuses)
            .await
    }

    async fn find_all_for_device_with_statuses(
        &self,
        device_id: &DeviceId,
        statuses: &[DeviceDeploymentStatus],
    ) -> DeploymentResult<Vec<DeviceDeployment>> {
        self.inner
            .find_all_for_device_with_statuses(device_id, statuses)
            .await
    }

    async fn update_status(
        &self,
        device_id: &DeviceId,
        deployment_id: &DeploymentId,
        status: DeviceDeploymentStatus,
        finished: Option<DateTime<Utc>>,
    ) -> DeploymentResult<DeviceDeploymentStatus> {
        self.inner
            .update_status(device_id, deployment_id, status, finished)
            .await
    }

    async fn get_status(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
    ) -> DeploymentResult<Option<DeviceDeploymentStatus>> {
        self.inner.get_status(deployment_id, device_id).await
    }

    async fn update_log_availability(
        &self,
        device_id: &DeviceId,
        deployment_id: &DeploymentId,
        available: bool,
    ) -> DeploymentResult<()> {
        self.inner
            .update_log_availability(device_id, deployment_id, available)
            .await
    }

    async fn aggregate_by_status(&self, deployment_id: &DeploymentId) -> DeploymentResult<Stats> {
        self.inner.aggregate_by_status(deployment_id).await
    }

    async fn get_device_statuses_for_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> DeploymentResult<Vec<DeviceDeployment>> {
        self.inner
            .get_device_statuses_for_deployment(deployment_id)
            .await
    }

    async fn has_deployment_for_device(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
    ) -> DeploymentResult<bool> {
        self.inner
            .has_deployment_for_device(deployment_id, device_id)
            .await
    }

    async fn abort_device_deployments(&self, deployment_id: &DeploymentId) -> DeploymentResult<u64> {
        self.inner.abort_device_deployments(deployment_id).await
    }

    async fn decommission_device_deployments(&self, device_id: &DeviceId) -> DeploymentResult<u64> {
        self.inner.decommission_device_deployments(device_id).await
    }

    async fn delete_by_deployment(&self, deployment_id: &DeploymentId) -> DeploymentResult<u64> {
        self.inner.delete_by_deployment(deployment_id).await
    }
}
