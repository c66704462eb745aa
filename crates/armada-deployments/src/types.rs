//! Identifier types for armada-deployments.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DeploymentError, DeploymentResult};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Reject empty identifiers and ones containing whitespace.
            pub fn validate(&self) -> DeploymentResult<()> {
                if self.0.is_empty() || self.0.chars().any(char::is_whitespace) {
                    return Err(DeploymentError::InvalidId($label));
                }
                Ok(())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }
    };
}

id_type!(
    /// Unique identifier for a deployment.
    ///
    /// Generated identifiers are lowercase ULIDs, so lexical order follows creation order.
    DeploymentId,
    "deployment"
);

id_type!(
    /// Unique identifier for a single device's assignment record.
    DeviceDeploymentId,
    "device deployment"
);

id_type!(
    /// Identifier of a device in the fleet.
    DeviceId,
    "device"
);

id_type!(
    /// Identifier of an artifact image.
    ImageId,
    "image"
);

impl DeploymentId {
    /// Generate a new unique deployment ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }
}

impl DeviceDeploymentId {
    /// Generate a new unique device deployment ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }
}
