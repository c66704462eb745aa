//! Per-device assignment records and the values exchanged with devices.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DeploymentError, DeploymentResult};
use crate::status::DeviceDeploymentStatus;
use crate::types::{DeploymentId, DeviceDeploymentId, DeviceId, ImageId};

/// Artifact image metadata, as returned by the image collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Image identifier.
    pub id: ImageId,
    /// Artifact name the image belongs to.
    pub artifact_name: String,
    /// Device types the image can be installed on.
    pub device_types_compatible: Vec<String>,
}

/// One device's assignment within a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDeployment {
    /// Unique record identifier.
    pub id: DeviceDeploymentId,
    /// Parent deployment.
    pub deployment_id: DeploymentId,
    /// Target device.
    pub device_id: DeviceId,
    /// Current status.
    pub status: DeviceDeploymentStatus,
    /// Creation time; equal to the parent deployment's creation time.
    pub created: DateTime<Utc>,
    /// Set once the status becomes terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// Device type resolved at fan-out.
    pub device_type: String,
    /// Image assigned to the device; `None` when nothing matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    /// Whether the device uploaded a deployment log.
    #[serde(default)]
    pub is_log_available: bool,
}

impl DeviceDeployment {
    /// Create a pending assignment of `image` to a device.
    #[must_use]
    pub fn pending(
        deployment_id: DeploymentId,
        device_id: DeviceId,
        device_type: impl Into<String>,
        image: Image,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeviceDeploymentId::generate(),
            deployment_id,
            device_id,
            status: DeviceDeploymentStatus::Pending,
            created,
            finished: None,
            device_type: device_type.into(),
            image: Some(image),
            is_log_available: false,
        }
    }

    /// Create a record for a device no image matched; finished on creation.
    #[must_use]
    pub fn no_artifact(
        deployment_id: DeploymentId,
        device_id: DeviceId,
        device_type: impl Into<String>,
        created: DateTime<Utc>,
        finished: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeviceDeploymentId::generate(),
            deployment_id,
            device_id,
            status: DeviceDeploymentStatus::NoArtifact,
            created,
            finished: Some(finished),
            device_type: device_type.into(),
            image: None,
            is_log_available: false,
        }
    }
}

/// Time-limited download reference for an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Where to fetch the artifact.
    pub uri: String,
    /// When the link stops working.
    pub expire: DateTime<Utc>,
    /// HTTP method to use.
    pub method: String,
    /// Extra request headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, String>,
}

/// Artifact a device should install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInstructions {
    /// Artifact name.
    pub artifact_name: String,
    /// Download reference.
    pub source: Link,
    /// Device types the artifact supports.
    pub device_types_compatible: Vec<String>,
}

/// What a device is told to do next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentInstructions {
    /// Deployment the instructions belong to.
    pub id: DeploymentId,
    /// Artifact to install.
    pub artifact: ArtifactInstructions,
}

/// Artifact a device reports it is currently running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledArtifact {
    /// Installed artifact name.
    pub artifact_name: String,
    /// Device type reported by the device.
    pub device_type: String,
}

/// One line of a device's deployment log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    /// When the device emitted the line.
    pub timestamp: DateTime<Utc>,
    /// Log level as reported.
    pub level: String,
    /// Message text.
    pub message: String,
}

/// Execution log uploaded by a device for one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentLog {
    /// Deployment the log belongs to.
    pub deployment_id: DeploymentId,
    /// Device that produced it.
    pub device_id: DeviceId,
    /// Log lines.
    pub messages: Vec<LogMessage>,
}

impl DeploymentLog {
    /// Reject empty logs and lines without level or message.
    pub fn validate(&self) -> DeploymentResult<()> {
        self.deployment_id.validate()?;
        self.device_id.validate()?;

        if self.messages.is_empty() {
            return Err(DeploymentError::validation("messages: cannot be empty"));
        }
        for (idx, line) in self.messages.iter().enumerate() {
            if line.level.is_empty() {
                return Err(DeploymentError::validation(format!(
                    "messages[{idx}].level: cannot be empty"
                )));
            }
            if line.message.is_empty() {
                return Err(DeploymentError::validation(format!(
                    "messages[{idx}].message: cannot be empty"
                )));
            }
        }
        Ok(())
    }
}
