//! Per-device artifact resolution.
//!
//! For every target device the generator asks the inventory for the device
//! type and the image catalogue for an image of the deployment's artifact
//! built for that type. The result is the device's initial assignment record;
//! persisting it is the model's job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::deployment::Deployment;
use crate::device_deployment::{DeviceDeployment, Image};
use crate::error::{DeploymentError, DeploymentResult};
use crate::types::DeviceId;

/// Looks up a device's type.
#[async_trait]
pub trait DeviceTypeResolver: Send + Sync {
    /// Device type of `device_id`.
    async fn get_device_type(&self, device_id: &DeviceId) -> DeploymentResult<String>;
}

/// Looks up artifact images.
#[async_trait]
pub trait ImageFinder: Send + Sync {
    /// Image of `artifact_name` compatible with `device_type`, if any.
    async fn image_by_name_and_device_type(
        &self,
        artifact_name: &str,
        device_type: &str,
    ) -> DeploymentResult<Option<Image>>;
}

/// Produces the initial assignment record of one device.
#[async_trait]
pub trait DeviceDeploymentGenerator: Send + Sync {
    /// Resolve what `device_id` should install for `deployment`.
    ///
    /// Lookup failures are reported as [`DeploymentError::Generation`]; a
    /// device without a matching image is not a failure and yields a
    /// `noartifact` record.
    async fn generate(
        &self,
        device_id: &DeviceId,
        deployment: &Deployment,
    ) -> DeploymentResult<DeviceDeployment>;
}

/// Generator resolving device type first, then the image for that type.
pub struct ImageBasedGenerator {
    devices: Arc<dyn DeviceTypeResolver>,
    images: Arc<dyn ImageFinder>,
    call_timeout: Duration,
}

impl ImageBasedGenerator {
    /// Create a new generator; each collaborator call is bounded by `call_timeout`.
    pub fn new(
        devices: Arc<dyn DeviceTypeResolver>,
        images: Arc<dyn ImageFinder>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            devices,
            images,
            call_timeout,
        }
    }
}

#[async_trait]
impl DeviceDeploymentGenerator for ImageBasedGenerator {
    async fn generate(
        &self,
        device_id: &DeviceId,
        deployment: &Deployment,
    ) -> DeploymentResult<DeviceDeployment> {
        let device_type =
            tokio::time::timeout(self.call_timeout, self.devices.get_device_type(device_id))
                .await
                .map_err(|_| {
                    DeploymentError::generation(
                        device_id.as_str(),
                        DeploymentError::Timeout("device type lookup"),
                    )
                })?
                .map_err(|e| DeploymentError::generation(device_id.as_str(), e))?;

        let image = tokio::time::timeout(
            self.call_timeout,
            self.images
                .image_by_name_and_device_type(&deployment.artifact_name, &device_type),
        )
        .await
        .map_err(|_| {
            DeploymentError::generation(
                device_id.as_str(),
                DeploymentError::Timeout("image lookup"),
            )
        })?
        .map_err(|e| DeploymentError::generation(device_id.as_str(), e))?;

        let record = match image {
            Some(image) => DeviceDeployment::pending(
                deployment.id.clone(),
                device_id.clone(),
                device_type,
                image,
                deployment.created,
            ),
            None => {
                debug!(
                    deployment_id = %deployment.id,
                    device_id = %device_id,
                    device_type = %device_type,
                    "no image matches device type"
                );
                DeviceDeployment::no_artifact(
                    deployment.id.clone(),
                    device_id.clone(),
                    device_type,
                    deployment.created,
                    Utc::now(),
                )
            }
        };

        Ok(record)
    }
}

impl std::fmt::Debug for ImageBasedGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBasedGenerator")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}
