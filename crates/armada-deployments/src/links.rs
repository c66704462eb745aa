//! Download link generation for assigned images.

use std::time::Duration;

use async_trait::async_trait;

use crate::device_deployment::Link;
use crate::error::{DeploymentError, DeploymentResult};
use crate::types::ImageId;

/// Lifetime of a generated download link.
///
/// Bounded to between one minute and seven days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DownloadLinkExpiry(Duration);

impl DownloadLinkExpiry {
    /// Shortest accepted lifetime.
    pub const MIN: Duration = Duration::from_secs(60);
    /// Longest accepted lifetime.
    pub const MAX: Duration = Duration::from_secs(7 * 24 * 60 * 60);
    /// Lifetime used when nothing is configured.
    pub const DEFAULT: Duration = Duration::from_secs(24 * 60 * 60);

    /// Validate a lifetime.
    pub fn new(expiry: Duration) -> DeploymentResult<Self> {
        if expiry < Self::MIN || expiry > Self::MAX {
            return Err(DeploymentError::validation(format!(
                "download link expiry must be between {}s and {}s, got {}s",
                Self::MIN.as_secs(),
                Self::MAX.as_secs(),
                expiry.as_secs()
            )));
        }
        Ok(Self(expiry))
    }

    /// Validate a lifetime given in seconds.
    pub fn from_secs(secs: u64) -> DeploymentResult<Self> {
        Self::new(Duration::from_secs(secs))
    }

    /// The lifetime.
    #[must_use]
    pub const fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for DownloadLinkExpiry {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

/// Produces time-limited download references for images.
#[async_trait]
pub trait ImageLinker: Send + Sync {
    /// Download link for `image_id` valid for `expiry`.
    async fn get_request(
        &self,
        image_id: &ImageId,
        expiry: DownloadLinkExpiry,
    ) -> DeploymentResult<Link>;
}
