//! Error types for armada-deployments.

use crate::status::DeviceDeploymentStatus;

/// Result type alias using [`DeploymentError`].
pub type DeploymentResult<T> = Result<T, DeploymentError>;

/// Errors that can occur while orchestrating deployments.
#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    /// Caller supplied malformed input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was empty or malformed.
    #[error("invalid {0} id")]
    InvalidId(&'static str),

    /// Deployment not found.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    /// No device deployment for the given pair.
    #[error("no deployment {deployment_id} assigned to device {device_id}")]
    DeviceDeploymentNotFound {
        /// Deployment identifier.
        deployment_id: String,
        /// Device identifier.
        device_id: String,
    },

    /// Resolving the artifact for one device failed during fan-out.
    #[error("preparing deployment for device {device_id}: {reason}")]
    Generation {
        /// Device that could not be resolved.
        device_id: String,
        /// Underlying failure.
        reason: String,
    },

    /// A stats transition would drive a counter below zero.
    #[error("inconsistent stats for deployment {deployment_id}: no device counted as {status}")]
    NegativeCounter {
        /// Deployment identifier.
        deployment_id: String,
        /// The counter that is already zero.
        status: DeviceDeploymentStatus,
    },

    /// An atomic update addressed a deployment that does not exist.
    #[error("update addressed missing deployment {0}")]
    MissingUpdateTarget(String),

    /// Free-text search was requested before the text index exists.
    #[error("cannot execute query: text index on deployments is not set up")]
    MissingTextIndex,

    /// The device deployment was aborted and refuses further updates.
    #[error("deployment aborted")]
    DeploymentAborted,

    /// The device was decommissioned and refuses further updates.
    #[error("device decommissioned")]
    DeviceDecommissioned,

    /// A reported status is not reachable from the current one.
    #[error("invalid status transition: cannot transition from {from} to {to}")]
    InvalidStatusTransition {
        /// Current status.
        from: DeviceDeploymentStatus,
        /// Reported status.
        to: DeviceDeploymentStatus,
    },

    /// Device inventory lookup failed.
    #[error("inventory error: {0}")]
    Inventory(String),

    /// Image lookup failed.
    #[error("image lookup error: {0}")]
    ImageLookup(String),

    /// Download link generation failed.
    #[error("download link error: {0}")]
    Link(String),

    /// A collaborator call exceeded its time budget.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`DeploymentError`].
///
/// Lets a transport layer choose a response without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input; never retried.
    Validation,
    /// The addressed entity does not exist.
    NotFound,
    /// Fan-out generation failed for a device.
    Generation,
    /// Stored aggregates disagree with the requested change.
    StorageConsistency,
    /// The persistence layer was unavailable.
    StorageTransient,
    /// The request conflicts with the entity's current state.
    Conflict,
    /// An external collaborator failed or timed out.
    Collaborator,
    /// Anything else.
    Internal,
}

impl DeploymentError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a generation error for one device.
    #[must_use]
    pub fn generation(device_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Generation {
            device_id: device_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::InvalidId(_) | Self::Config(_) => ErrorKind::Validation,
            Self::DeploymentNotFound(_) | Self::DeviceDeploymentNotFound { .. } => {
                ErrorKind::NotFound
            }
            Self::Generation { .. } => ErrorKind::Generation,
            Self::NegativeCounter { .. } | Self::MissingUpdateTarget(_) => {
                ErrorKind::StorageConsistency
            }
            Self::Database(_) | Self::MissingTextIndex => ErrorKind::StorageTransient,
            Self::DeploymentAborted
            | Self::DeviceDecommissioned
            | Self::InvalidStatusTransition { .. } => ErrorKind::Conflict,
            Self::Inventory(_)
            | Self::ImageLookup(_)
            | Self::Link(_)
            | Self::Timeout(_)
            | Self::Http(_) => ErrorKind::Collaborator,
            Self::Cancelled | Self::Serialisation(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_errors_are_classified() {
        let err = DeploymentError::NegativeCounter {
            deployment_id: "d1".to_owned(),
            status: DeviceDeploymentStatus::Pending,
        };
        assert_eq!(err.kind(), ErrorKind::StorageConsistency);
        assert_eq!(
            err.to_string(),
            "inconsistent stats for deployment d1: no device counted as pending"
        );

        let err = DeploymentError::MissingUpdateTarget("d2".to_owned());
        assert_eq!(err.kind(), ErrorKind::StorageConsistency);
    }

    #[test]
    fn generation_error_names_device() {
        let err = DeploymentError::generation("dev-7", "inventory unreachable");
        assert_eq!(err.kind(), ErrorKind::Generation);
        assert!(err.to_string().contains("dev-7"));
        assert!(err.to_string().contains("inventory unreachable"));
    }

    #[test]
    fn not_found_is_distinct_from_invalid_id() {
        assert_eq!(
            DeploymentError::DeploymentNotFound("x".to_owned()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            DeploymentError::InvalidId("deployment").kind(),
            ErrorKind::Validation
        );
    }
}
