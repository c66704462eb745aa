//! HTTP client for the device inventory service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;

use crate::config::InventoryConfig;
use crate::error::{DeploymentError, DeploymentResult};
use crate::generator::DeviceTypeResolver;
use crate::types::DeviceId;

/// Inventory attribute holding the device type.
pub const DEVICE_TYPE_ATTRIBUTE: &str = "device_type";

/// Device as returned by the inventory API.
#[derive(Debug, Deserialize)]
struct InventoryDevice {
    #[serde(default)]
    attributes: Vec<InventoryAttribute>,
}

#[derive(Debug, Deserialize)]
struct InventoryAttribute {
    name: String,
    value: serde_json::Value,
}

/// HTTP client resolving device types from the inventory.
#[derive(Debug, Clone)]
pub struct InventoryClient {
    client: Client,
    base_url: Url,
}

impl InventoryClient {
    /// Create a new inventory client from configuration.
    pub fn new(config: &InventoryConfig) -> DeploymentResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(DeploymentError::Http)?;

        Ok(Self {
            client,
            base_url: parse_base_url(&config.url)?,
        })
    }

    /// Create a new inventory client with a custom base URL.
    pub fn with_url(url: impl Into<String>) -> DeploymentResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(DeploymentError::Http)?;

        Ok(Self {
            client,
            base_url: parse_base_url(&url.into())?,
        })
    }

    /// URL of a device, with the id encoded as a single path segment.
    fn device_url(&self, device_id: &DeviceId) -> DeploymentResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                DeploymentError::Config(format!("inventory url {} cannot be a base", self.base_url))
            })?
            .pop_if_empty()
            .extend(["devices", device_id.as_str()]);
        Ok(url)
    }
}

fn parse_base_url(url: &str) -> DeploymentResult<Url> {
    let parsed = Url::parse(url)
        .map_err(|e| DeploymentError::Config(format!("invalid inventory url {url}: {e}")))?;
    if parsed.cannot_be_a_base() {
        return Err(DeploymentError::Config(format!(
            "inventory url {url} cannot be a base"
        )));
    }
    Ok(parsed)
}

#[async_trait]
impl DeviceTypeResolver for InventoryClient {
    async fn get_device_type(&self, device_id: &DeviceId) -> DeploymentResult<String> {
        device_id.validate()?;
        let url = self.device_url(device_id)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(DeploymentError::Http)?;

        let device: InventoryDevice = match response.status() {
            StatusCode::OK => response.json().await.map_err(DeploymentError::Http)?,
            StatusCode::NOT_FOUND => {
                return Err(DeploymentError::Inventory(format!(
                    "device {device_id} not found"
                )))
            }
            status => {
                return Err(DeploymentError::Inventory(format!(
                    "failed to get device {device_id}: {status}"
                )))
            }
        };

        let attribute = device
            .attributes
            .into_iter()
            .find(|a| a.name == DEVICE_TYPE_ATTRIBUTE)
            .ok_or_else(|| {
                DeploymentError::Inventory(format!(
                    "device {device_id} has no {DEVICE_TYPE_ATTRIBUTE} attribute"
                ))
            })?;

        match attribute.value {
            serde_json::Value::String(device_type) => Ok(device_type),
            other => Err(DeploymentError::Inventory(format!(
                "device {device_id} has a non-string {DEVICE_TYPE_ATTRIBUTE}: {other}"
            ))),
        }
    }
}
