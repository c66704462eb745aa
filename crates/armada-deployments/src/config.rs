//! Configuration for armada-deployments.

use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{DeploymentError, DeploymentResult};
use crate::links::DownloadLinkExpiry;
use crate::model::ModelSettings;

/// Top-level configuration for the deployments service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DeploymentsConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Storage backend selection.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Device inventory client configuration.
    #[serde(default)]
    pub inventory: InventoryConfig,

    /// Artifact catalogue client configuration.
    #[serde(default)]
    pub artifacts: ArtifactsConfig,

    /// Deployment model behaviour.
    #[serde(default)]
    pub model: ModelConfig,
}

impl DeploymentsConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `deployments.toml` in the current directory (if present)
    /// 3. Environment variables with `ARMADA_DEPLOYMENTS_` prefix
    pub fn load() -> DeploymentResult<Self> {
        Self::extract(Figment::new().merge(Toml::file("deployments.toml")))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> DeploymentResult<Self> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    fn extract(figment: Figment) -> DeploymentResult<Self> {
        let config: Self = figment
            .merge(Env::prefixed("ARMADA_DEPLOYMENTS_").split("__"))
            .extract()
            .map_err(|e| DeploymentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that can never work.
    pub fn validate(&self) -> DeploymentResult<()> {
        self.model.settings().map(|_| ())
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/deployments".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Which backend to use.
    #[serde(default)]
    pub backend: StorageBackend,
}

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// PostgreSQL, falling back to memory if unreachable.
    #[default]
    Postgres,

    /// In-memory store; data is lost on exit.
    Memory,
}

/// Device inventory client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryConfig {
    /// Base URL for the inventory HTTP API.
    #[serde(default = "default_inventory_url")]
    pub url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_client_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_inventory_url() -> String {
    "http://localhost:8080/api/internal/v1/inventory".to_owned()
}

const fn default_client_timeout_secs() -> u64 {
    10
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            url: default_inventory_url(),
            timeout_secs: default_client_timeout_secs(),
        }
    }
}

/// Artifact catalogue client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsConfig {
    /// Base URL for the artifact catalogue HTTP API.
    #[serde(default = "default_artifacts_url")]
    pub url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_client_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_artifacts_url() -> String {
    "http://localhost:8081/api/internal/v1/artifacts".to_owned()
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            url: default_artifacts_url(),
            timeout_secs: default_client_timeout_secs(),
        }
    }
}

/// Deployment model behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Lifetime of generated download links in seconds.
    #[serde(default = "default_download_link_expiry_secs")]
    pub download_link_expiry_secs: u64,

    /// Upper bound for each inventory or catalogue call, in seconds.
    #[serde(default = "default_collaborator_timeout_secs")]
    pub collaborator_timeout_secs: u64,

    /// Reject device status reports the lifecycle does not allow.
    #[serde(default)]
    pub strict_transitions: bool,
}

const fn default_download_link_expiry_secs() -> u64 {
    DownloadLinkExpiry::DEFAULT.as_secs()
}

const fn default_collaborator_timeout_secs() -> u64 {
    30
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            download_link_expiry_secs: default_download_link_expiry_secs(),
            collaborator_timeout_secs: default_collaborator_timeout_secs(),
            strict_transitions: false,
        }
    }
}

impl ModelConfig {
    /// Validated runtime settings.
    pub fn settings(&self) -> DeploymentResult<ModelSettings> {
        if self.collaborator_timeout_secs == 0 {
            return Err(DeploymentError::Config(
                "model.collaborator_timeout_secs must be positive".to_owned(),
            ));
        }
        let link_expiry = DownloadLinkExpiry::from_secs(self.download_link_expiry_secs)
            .map_err(|e| DeploymentError::Config(format!("model.download_link_expiry_secs: {e}")))?;

        Ok(ModelSettings {
            link_expiry,
            collaborator_timeout: Duration::from_secs(self.collaborator_timeout_secs),
            strict_transitions: self.strict_transitions,
        })
    }
}
