//! Deployment storage backends.
//!
//! Storage is split into three capability traits matching the three kinds of
//! records the model touches. Both provided backends implement all of them:
//! [`PostgresStore`] for production and [`MemoryStore`] for tests and as a
//! fallback when no database is reachable.
//!
//! Every method taking an identifier rejects an empty or malformed one with
//! [`DeploymentError::InvalidId`](crate::error::DeploymentError::InvalidId).
//! Lookups report absence as `Ok(None)`; only mutations of a missing record
//! return a not-found error.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::deployment::Deployment;
use crate::device_deployment::{DeploymentLog, DeviceDeployment};
use crate::error::DeploymentResult;
use crate::query::Query;
use crate::stats::Stats;
use crate::status::DeviceDeploymentStatus;
use crate::types::{DeploymentId, DeviceId, ImageId};

/// Backend for deployment headers.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a new deployment.
    ///
    /// Also makes sure the free-text index used by [`Self::find`] exists.
    async fn insert(&self, deployment: &Deployment) -> DeploymentResult<()>;

    /// Delete a deployment header.
    ///
    /// Returns `DeploymentNotFound` if it does not exist.
    async fn delete(&self, id: &DeploymentId) -> DeploymentResult<()>;

    /// Get a deployment by ID.
    async fn find_by_id(&self, id: &DeploymentId) -> DeploymentResult<Option<Deployment>>;

    /// Get a deployment by ID unless it is finished.
    async fn find_unfinished_by_id(
        &self,
        id: &DeploymentId,
    ) -> DeploymentResult<Option<Deployment>>;

    /// Atomically move one device from the `from` counter to the `to` counter.
    ///
    /// Transitioning to the same status is a no-op. Fails with
    /// `NegativeCounter` when `from` is already zero and with
    /// `MissingUpdateTarget` when the deployment does not exist. Does not
    /// decide whether the deployment finished.
    async fn update_stats(
        &self,
        id: &DeploymentId,
        from: DeviceDeploymentStatus,
        to: DeviceDeploymentStatus,
    ) -> DeploymentResult<()>;

    /// Replace the counters and, when they describe a finished deployment,
    /// stamp `finished` in the same update if it is not set yet.
    async fn update_stats_and_finish(
        &self,
        id: &DeploymentId,
        stats: Stats,
    ) -> DeploymentResult<()>;

    /// List deployments matching the query, newest first.
    ///
    /// Fails with `MissingTextIndex` when the query carries search text and
    /// the text index has not been created yet.
    async fn find(&self, query: &Query) -> DeploymentResult<Vec<Deployment>>;

    /// Stamp `finished`; a deployment already finished keeps its timestamp.
    async fn finish(&self, id: &DeploymentId, when: DateTime<Utc>) -> DeploymentResult<()>;
}

/// Backend for per-device assignment records.
#[async_trait]
pub trait DeviceDeploymentStore: Send + Sync {
    /// Insert a batch of records; either all are stored or none.
    ///
    /// Fails if any (deployment, device) pair already exists.
    async fn insert_many(&self, records: &[DeviceDeployment]) -> DeploymentResult<()>;

    /// Whether any record assigns `image_id` and has one of `statuses`.
    ///
    /// An empty status list matches every status.
    async fn exist_assigned_image_with_id_and_statuses(
        &self,
        image_id: &ImageId,
        statuses: &[DeviceDeploymentStatus],
    ) -> DeploymentResult<bool>;

    /// Oldest record of the device with one of `statuses`.
    async fn find_oldest_for_device_with_statuses(
        &self,
        device_id: &DeviceId,
        statuses: &[DeviceDeploymentStatus],
    ) -> DeploymentResult<Option<DeviceDeployment>>;

    /// Every record of the device with one of `statuses`, oldest first.
    async fn find_all_for_device_with_statuses(
        &self,
        device_id: &DeviceId,
        statuses: &[DeviceDeploymentStatus],
    ) -> DeploymentResult<Vec<DeviceDeployment>>;

    /// Set a record's status and finish time, returning the previous status.
    ///
    /// Only records in an active status are changed. Records that are
    /// `aborted` or `decommissioned` fail with `DeploymentAborted` or
    /// `DeviceDecommissioned`; any other final status fails with
    /// `InvalidStatusTransition`, unless it already equals `status`, in which
    /// case nothing changes and that status is returned.
    async fn update_status(
        &self,
        device_id: &DeviceId,
        deployment_id: &DeploymentId,
        status: DeviceDeploymentStatus,
        finished: Option<DateTime<Utc>>,
    ) -> DeploymentResult<DeviceDeploymentStatus>;

    /// Current status of one record.
    async fn get_status(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
    ) -> DeploymentResult<Option<DeviceDeploymentStatus>>;

    /// Flag whether the device uploaded a log for the deployment.
    async fn update_log_availability(
        &self,
        device_id: &DeviceId,
        deployment_id: &DeploymentId,
        available: bool,
    ) -> DeploymentResult<()>;

    /// Recompute a deployment's counters from its records.
    async fn aggregate_by_status(&self, deployment_id: &DeploymentId) -> DeploymentResult<Stats>;

    /// Every record of a deployment.
    async fn get_device_statuses_for_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> DeploymentResult<Vec<DeviceDeployment>>;

    /// Whether the device is part of the deployment.
    async fn has_deployment_for_device(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
    ) -> DeploymentResult<bool>;

    /// Move every active record of a deployment to `aborted`.
    ///
    /// Returns the number of records changed.
    async fn abort_device_deployments(&self, deployment_id: &DeploymentId) -> DeploymentResult<u64>;

    /// Move every active record of a device to `decommissioned`.
    ///
    /// Returns the number of records changed.
    async fn decommission_device_deployments(&self, device_id: &DeviceId) -> DeploymentResult<u64>;

    /// Delete every record of a deployment, returning how many were removed.
    async fn delete_by_deployment(&self, deployment_id: &DeploymentId) -> DeploymentResult<u64>;
}

/// Backend for device execution logs.
#[async_trait]
pub trait DeploymentLogStore: Send + Sync {
    /// Store a log, replacing an earlier upload for the same pair.
    async fn save_log(&self, log: &DeploymentLog) -> DeploymentResult<()>;

    /// Fetch the log of one device for one deployment.
    async fn get_log(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
    ) -> DeploymentResult<Option<DeploymentLog>>;
}
