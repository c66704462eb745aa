//! HTTP client for the artifact catalogue.
//!
//! Resolves images by artifact name and device type, and asks the catalogue
//! for signed download links.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};

use crate::config::ArtifactsConfig;
use crate::device_deployment::{Image, Link};
use crate::error::{DeploymentError, DeploymentResult};
use crate::generator::ImageFinder;
use crate::links::{DownloadLinkExpiry, ImageLinker};
use crate::types::ImageId;

/// HTTP client for the artifact catalogue.
#[derive(Debug, Clone)]
pub struct ArtifactsClient {
    client: Client,
    base_url: Url,
}

impl ArtifactsClient {
    /// Create a new catalogue client from configuration.
    pub fn new(config: &ArtifactsConfig) -> DeploymentResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(DeploymentError::Http)?;

        Ok(Self {
            client,
            base_url: parse_base_url(&config.url)?,
        })
    }

    /// Create a new catalogue client with a custom base URL.
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

    /// Catalogue URL with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> DeploymentResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                DeploymentError::Config(format!("catalogue url {} cannot be a base", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn parse_base_url(url: &str) -> DeploymentResult<Url> {
    let parsed = Url::parse(url)
        .map_err(|e| DeploymentError::Config(format!("invalid catalogue url {url}: {e}")))?;
    if parsed.cannot_be_a_base() {
        return Err(DeploymentError::Config(format!(
            "catalogue url {url} cannot be a base"
        )));
    }
    Ok(parsed)
}

#[async_trait]
impl ImageFinder for ArtifactsClient {
    async fn image_by_name_and_device_type(
        &self,
        artifact_name: &str,
        device_type: &str,
    ) -> DeploymentResult<Option<Image>> {
        let url = self.endpoint(&["images"])?;
        let response = self
            .client
            .get(url)
            .query(&[("artifact_name", artifact_name), ("device_type", device_type)])
            .send()
            .await
            .map_err(DeploymentError::Http)?;

        if !response.status().is_success() {
            return Err(DeploymentError::ImageLookup(format!(
                "failed to list images of {artifact_name}: {}",
                response.status()
            )));
        }

        let images: Vec<Image> = response.json().await.map_err(DeploymentError::Http)?;

        Ok(images.into_iter().find(|image| {
            image
                .device_types_compatible
                .iter()
                .any(|t| t == device_type)
        }))
    }
}

#[async_trait]
impl ImageLinker for ArtifactsClient {
    async fn get_request(
        &self,
        image_id: &ImageId,
        expiry: DownloadLinkExpiry,
    ) -> DeploymentResult<Link> {
        image_id.validate()?;
        let url = self.endpoint(&["images", image_id.as_str(), "download"])?;
        let response = self
            .client
            .post(url)
            .query(&[("expire", expiry.as_duration().as_secs())])
            .send()
            .await
            .map_err(DeploymentError::Http)?;

        match response.status() {
            StatusCode::OK => response.json().await.map_err(DeploymentError::Http),
            StatusCode::NOT_FOUND => Err(DeploymentError::Link(format!(
                "image {image_id} not found"
            ))),
            status => Err(DeploymentError::Link(format!(
                "failed to sign download link for {image_id}: {status}"
            ))),
        }
    }
}
