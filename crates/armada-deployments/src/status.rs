//! Device deployment status vocabulary and lifecycle rules.
//!
//! A device deployment starts as `pending` (or `noartifact` when no image
//! matched the device) and moves forward until it reaches a terminal status:
//!
//! ```text
//! pending ──► downloading ──► installing ──► rebooting ──► success
//!    │             │              │              │
//!    │             └──► failure ◄─┴──────────────┘
//!    │                            └──► already-installed
//!    └──► noartifact
//!
//! any active status ──► aborted | decommissioned
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a single device within a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceDeploymentStatus {
    /// Waiting for the device to pick up the update.
    Pending,
    /// The device is fetching the artifact.
    Downloading,
    /// The device is writing the artifact.
    Installing,
    /// The device is rebooting into the new artifact.
    Rebooting,
    /// The update was applied.
    Success,
    /// The update failed on the device.
    Failure,
    /// No image matched the device's type.
    #[serde(rename = "noartifact")]
    NoArtifact,
    /// The device already ran the artifact.
    AlreadyInstalled,
    /// The deployment was aborted before the device finished.
    Aborted,
    /// The device was removed from the fleet.
    Decommissioned,
}

impl DeviceDeploymentStatus {
    /// Every status, in counter order.
    pub const ALL: [Self; 10] = [
        Self::Pending,
        Self::Downloading,
        Self::Installing,
        Self::Rebooting,
        Self::Success,
        Self::Failure,
        Self::NoArtifact,
        Self::AlreadyInstalled,
        Self::Aborted,
        Self::Decommissioned,
    ];

    /// Statuses a device can still leave: it has not reached a final outcome.
    pub const ACTIVE: [Self; 4] = [
        Self::Pending,
        Self::Downloading,
        Self::Installing,
        Self::Rebooting,
    ];

    /// Statuses in which the device is working on the update right now.
    pub const IN_FLIGHT: [Self; 3] = [Self::Downloading, Self::Installing, Self::Rebooting];

    /// Final outcomes.
    pub const TERMINAL: [Self; 6] = [
        Self::Success,
        Self::Failure,
        Self::NoArtifact,
        Self::AlreadyInstalled,
        Self::Aborted,
        Self::Decommissioned,
    ];

    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Installing => "installing",
            Self::Rebooting => "rebooting",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::NoArtifact => "noartifact",
            Self::AlreadyInstalled => "already-installed",
            Self::Aborted => "aborted",
            Self::Decommissioned => "decommissioned",
        }
    }

    /// SQL column holding this status' counter.
    #[must_use]
    pub const fn column(&self) -> &'static str {
        match self {
            Self::AlreadyInstalled => "already_installed",
            other => other.as_str(),
        }
    }

    /// Position of this status in [`Self::ALL`].
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Pending => 0,
            Self::Downloading => 1,
            Self::Installing => 2,
            Self::Rebooting => 3,
            Self::Success => 4,
            Self::Failure => 5,
            Self::NoArtifact => 6,
            Self::AlreadyInstalled => 7,
            Self::Aborted => 8,
            Self::Decommissioned => 9,
        }
    }

    /// Returns true if no further transition occurs from this status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Returns true if the device has not reached a final outcome.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Downloading | Self::Installing | Self::Rebooting
        )
    }

    /// Returns true if the device is downloading, installing or rebooting.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Downloading | Self::Installing | Self::Rebooting)
    }

    /// Returns true if `next` is reachable from this status in one step.
    ///
    /// Aborting and decommissioning are reachable from every active status.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        if matches!(next, Self::Aborted | Self::Decommissioned) {
            return self.is_active();
        }
        matches!(
            (self, next),
            (Self::Pending, Self::Downloading | Self::NoArtifact)
                | (Self::Downloading, Self::Installing | Self::Failure)
                | (
                    Self::Installing,
                    Self::Rebooting | Self::Failure | Self::AlreadyInstalled
                )
                | (Self::Rebooting, Self::Success | Self::Failure)
        )
    }
}

impl fmt::Display for DeviceDeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeviceDeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown device deployment status: {s}"))
    }
}
