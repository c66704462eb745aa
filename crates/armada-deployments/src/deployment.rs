//! Fleet-wide deployment records.
//!
//! [`DeploymentConstructor`] is the write-only creation input and carries the
//! target device list; [`Deployment`] is what gets persisted and never holds
//! that list; [`DeploymentView`] is the shape handed to callers.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DeploymentError, DeploymentResult};
use crate::stats::Stats;
use crate::types::{DeploymentId, DeviceId};

/// Longest accepted deployment or artifact name.
pub const MAX_NAME_LEN: usize = 4096;

/// Lifecycle phase of a deployment, derived from its [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No device has started yet.
    Pending,
    /// Some devices are working, or some have finished while others wait.
    #[serde(rename = "inprogress")]
    InProgress,
    /// Every device reached a final outcome.
    Finished,
}

impl Phase {
    /// Get the phase name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "inprogress",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "inprogress" => Ok(Self::InProgress),
            "finished" => Ok(Self::Finished),
            _ => Err(format!("unknown deployment phase: {s}")),
        }
    }
}

/// Request to create a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConstructor {
    /// Human readable deployment name.
    pub name: String,
    /// Name of the artifact to roll out.
    pub artifact_name: String,
    /// Target devices.
    pub devices: Vec<DeviceId>,
}

impl DeploymentConstructor {
    /// Create a new constructor.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        artifact_name: impl Into<String>,
        devices: impl IntoIterator<Item = DeviceId>,
    ) -> Self {
        Self {
            name: name.into(),
            artifact_name: artifact_name.into(),
            devices: devices.into_iter().collect(),
        }
    }

    /// Check the request before any work is done for it.
    pub fn validate(&self) -> DeploymentResult<()> {
        validate_name("name", &self.name)?;
        validate_name("artifact_name", &self.artifact_name)?;

        if self.devices.is_empty() {
            return Err(DeploymentError::validation("devices: cannot be empty"));
        }

        let mut seen = HashSet::with_capacity(self.devices.len());
        for device in &self.devices {
            device.validate()?;
            if !seen.insert(device.as_str()) {
                return Err(DeploymentError::validation(format!(
                    "devices: {device} listed more than once"
                )));
            }
        }

        Ok(())
    }
}

fn validate_name(field: &str, value: &str) -> DeploymentResult<()> {
    if value.trim().is_empty() {
        return Err(DeploymentError::validation(format!("{field}: cannot be blank")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(DeploymentError::validation(format!(
            "{field}: longer than {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

/// A deployment as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// Human readable name.
    pub name: String,
    /// Artifact rolled out by this deployment.
    pub artifact_name: String,
    /// When the deployment was created.
    pub created: DateTime<Utc>,
    /// When the last device reached a final outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// Number of targeted devices.
    pub device_count: u64,
    /// Per-status device counters.
    pub stats: Stats,
}

impl Deployment {
    /// Create a deployment for `constructor` with every device pending.
    ///
    /// The device list is only counted, never stored.
    #[must_use]
    pub fn from_constructor(constructor: &DeploymentConstructor, created: DateTime<Utc>) -> Self {
        let device_count = u64::try_from(constructor.devices.len()).unwrap_or(u64::MAX);
        Self {
            id: DeploymentId::generate(),
            name: constructor.name.clone(),
            artifact_name: constructor.artifact_name.clone(),
            created,
            finished: None,
            device_count: 0,
            stats: Stats::new(),
        }
        .with_initial_stats(Stats::with_pending(device_count))
    }

    /// Replace the creation-time stats, stamping `finished` at creation time
    /// when they already describe a finished deployment.
    #[must_use]
    pub fn with_initial_stats(mut self, stats: Stats) -> Self {
        self.device_count = stats.total();
        self.stats = stats;
        self.finished = stats.is_finished().then_some(self.created);
        self
    }

    /// Current phase.
    #[must_use]
    pub fn status(&self) -> Phase {
        self.stats.phase()
    }

    /// See [`Stats::is_in_progress`].
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.stats.is_in_progress()
    }

    /// See [`Stats::is_finished`].
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.stats.is_finished()
    }

    /// See [`Stats::is_pending`].
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.stats.is_pending()
    }
}

/// Deployment as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentView {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// Human readable name.
    pub name: String,
    /// Artifact rolled out by this deployment.
    pub artifact_name: String,
    /// When the deployment was created.
    pub created: DateTime<Utc>,
    /// When the deployment finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// Derived phase.
    pub status: Phase,
    /// Number of targeted devices.
    pub device_count: u64,
}

impl From<&Deployment> for DeploymentView {
    fn from(deployment: &Deployment) -> Self {
        Self {
            id: deployment.id.clone(),
            name: deployment.name.clone(),
            artifact_name: deployment.artifact_name.clone(),
            created: deployment.created,
            finished: deployment.finished,
            status: deployment.status(),
            device_count: deployment.device_count,
        }
    }
}

impl From<Deployment> for DeploymentView {
    fn from(deployment: Deployment) -> Self {
        Self::from(&deployment)
    }
}
