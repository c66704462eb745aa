//! Deployment orchestration.
//!
//! [`DeploymentsModel`] owns no mutable state of its own. Every consistency
//! guarantee comes from the stores: a device status change is one atomic
//! record update followed by one atomic counter transition, so concurrent
//! reports for different devices compose without coordination.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deployment::{Deployment, DeploymentConstructor, DeploymentView};
use crate::device_deployment::{
    ArtifactInstructions, DeploymentInstructions, DeploymentLog, DeviceDeployment,
    InstalledArtifact, LogMessage,
};
use crate::error::{DeploymentError, DeploymentResult};
use crate::generator::DeviceDeploymentGenerator;
use crate::links::{DownloadLinkExpiry, ImageLinker};
use crate::query::Query;
use crate::stats::Stats;
use crate::status::DeviceDeploymentStatus;
use crate::store::{DeploymentLogStore, DeploymentStore, DeviceDeploymentStore};
use crate::types::{DeploymentId, DeviceId, ImageId};

/// Runtime settings of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSettings {
    /// Lifetime of download links handed to devices.
    pub link_expiry: DownloadLinkExpiry,
    /// Upper bound for one download link request.
    pub collaborator_timeout: Duration,
    /// Reject status reports the lifecycle table does not allow.
    pub strict_transitions: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            link_expiry: DownloadLinkExpiry::default(),
            collaborator_timeout: Duration::from_secs(30),
            strict_transitions: false,
        }
    }
}

/// Orchestrates deployment creation, device status bookkeeping and finish detection.
pub struct DeploymentsModel {
    deployments: Arc<dyn DeploymentStore>,
    device_deployments: Arc<dyn DeviceDeploymentStore>,
    logs: Arc<dyn DeploymentLogStore>,
    generator: Arc<dyn DeviceDeploymentGenerator>,
    linker: Arc<dyn ImageLinker>,
    settings: ModelSettings,
}

impl DeploymentsModel {
    /// Create a model over a store implementing every storage trait.
    pub fn new<S>(
        store: Arc<S>,
        generator: Arc<dyn DeviceDeploymentGenerator>,
        linker: Arc<dyn ImageLinker>,
        settings: ModelSettings,
    ) -> Self
    where
        S: DeploymentStore + DeviceDeploymentStore + DeploymentLogStore + 'static,
    {
        Self {
            deployments: store.clone(),
            device_deployments: store.clone(),
            logs: store,
            generator,
            linker,
            settings,
        }
    }

    /// Create a model from individually supplied stores.
    pub fn from_parts(
        deployments: Arc<dyn DeploymentStore>,
        device_deployments: Arc<dyn DeviceDeploymentStore>,
        logs: Arc<dyn DeploymentLogStore>,
        generator: Arc<dyn DeviceDeploymentGenerator>,
        linker: Arc<dyn ImageLinker>,
        settings: ModelSettings,
    ) -> Self {
        Self {
            deployments,
            device_deployments,
            logs,
            generator,
            linker,
            settings,
        }
    }

    /// Settings the model runs with.
    #[must_use]
    pub const fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// Create a deployment and one assignment record per target device.
    ///
    /// Every device is resolved before anything is written, so a generation
    /// failure or cancellation leaves no trace. The header is written first;
    /// if the device records then fail to insert, the header is deleted again.
    pub async fn create_deployment(
        &self,
        constructor: DeploymentConstructor,
        cancel: &CancellationToken,
    ) -> DeploymentResult<DeploymentId> {
        constructor.validate()?;

        let deployment = Deployment::from_constructor(&constructor, Utc::now());
        let deployment_id = deployment.id.clone();

        info!(
            deployment_id = %deployment_id,
            artifact = %deployment.artifact_name,
            devices = constructor.devices.len(),
            "creating deployment"
        );

        let mut records = Vec::with_capacity(constructor.devices.len());
        for device_id in &constructor.devices {
            let generated = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    warn!(
                        deployment_id = %deployment_id,
                        prepared = records.len(),
                        "deployment creation cancelled"
                    );
                    return Err(DeploymentError::Cancelled);
                }
                generated = self.generator.generate(device_id, &deployment) => generated,
            };

            match generated {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!(
                        deployment_id = %deployment_id,
                        device_id = %device_id,
                        error = %e,
                        "preparing device deployment failed"
                    );
                    return Err(e);
                }
            }
        }

        let stats: Stats = records.iter().map(|r| r.status).collect();
        let deployment = deployment.with_initial_stats(stats);

        self.deployments.insert(&deployment).await?;

        if let Err(e) = self.device_deployments.insert_many(&records).await {
            error!(
                deployment_id = %deployment_id,
                error = %e,
                "inserting device deployments failed, rolling back"
            );
            if let Err(rollback) = self.deployments.delete(&deployment_id).await {
                error!(
                    deployment_id = %deployment_id,
                    error = %rollback,
                    "rollback of deployment header failed"
                );
            }
            return Err(e);
        }

        info!(
            deployment_id = %deployment_id,
            pending = stats.get(DeviceDeploymentStatus::Pending),
            noartifact = stats.get(DeviceDeploymentStatus::NoArtifact),
            finished = deployment.finished.is_some(),
            "deployment created"
        );

        Ok(deployment_id)
    }

    /// Get a deployment by ID.
    pub async fn get_deployment(&self, id: &DeploymentId) -> DeploymentResult<Option<Deployment>> {
        self.deployments.find_by_id(id).await
    }

    /// Whether a deployment is finished.
    pub async fn is_deployment_finished(&self, id: &DeploymentId) -> DeploymentResult<bool> {
        if self.deployments.find_unfinished_by_id(id).await?.is_some() {
            return Ok(false);
        }
        match self.deployments.find_by_id(id).await? {
            Some(_) => Ok(true),
            None => Err(DeploymentError::DeploymentNotFound(id.to_string())),
        }
    }

    /// Counters recomputed from the device records; `None` for an unknown deployment.
    pub async fn get_deployment_stats(&self, id: &DeploymentId) -> DeploymentResult<Option<Stats>> {
        if self.deployments.find_by_id(id).await?.is_none() {
            return Ok(None);
        }
        self.device_deployments
            .aggregate_by_status(id)
            .await
            .map(Some)
    }

    /// Every device record of a deployment.
    pub async fn get_device_statuses_for_deployment(
        &self,
        id: &DeploymentId,
    ) -> DeploymentResult<Vec<DeviceDeployment>> {
        if self.deployments.find_by_id(id).await?.is_none() {
            return Err(DeploymentError::DeploymentNotFound(id.to_string()));
        }
        self.device_deployments
            .get_device_statuses_for_deployment(id)
            .await
    }

    /// List deployments, newest first.
    pub async fn lookup_deployments(&self, query: &Query) -> DeploymentResult<Vec<DeploymentView>> {
        let deployments = self.deployments.find(query).await?;
        Ok(deployments.iter().map(DeploymentView::from).collect())
    }

    /// Apply a status reported by a device.
    ///
    /// Reports for aborted or decommissioned records are refused, and a
    /// report equal to the current status changes nothing. A record in any
    /// other final status cannot be moved either. When the update leaves the
    /// deployment without active devices it is stamped finished.
    pub async fn update_device_deployment_status(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
        status: DeviceDeploymentStatus,
    ) -> DeploymentResult<()> {
        self.apply_status(
            deployment_id,
            device_id,
            status,
            self.settings.strict_transitions,
        )
        .await
    }

    async fn apply_status(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
        status: DeviceDeploymentStatus,
        enforce_table: bool,
    ) -> DeploymentResult<()> {
        let current = self
            .device_deployments
            .get_status(deployment_id, device_id)
            .await?
            .ok_or_else(|| DeploymentError::DeviceDeploymentNotFound {
                deployment_id: deployment_id.to_string(),
                device_id: device_id.to_string(),
            })?;

        match current {
            DeviceDeploymentStatus::Aborted => return Err(DeploymentError::DeploymentAborted),
            DeviceDeploymentStatus::Decommissioned => {
                return Err(DeploymentError::DeviceDecommissioned)
            }
            current if current == status => {
                debug!(
                    deployment_id = %deployment_id,
                    device_id = %device_id,
                    status = %status,
                    "status unchanged"
                );
                return Ok(());
            }
            current if current.is_terminal() => {
                return Err(DeploymentError::InvalidStatusTransition {
                    from: current,
                    to: status,
                })
            }
            current if enforce_table && !current.can_transition_to(status) => {
                return Err(DeploymentError::InvalidStatusTransition {
                    from: current,
                    to: status,
                })
            }
            _ => {}
        }

        let finished = status.is_terminal().then(Utc::now);
        let previous = self
            .device_deployments
            .update_status(device_id, deployment_id, status, finished)
            .await?;

        self.deployments
            .update_stats(deployment_id, previous, status)
            .await?;

        info!(
            deployment_id = %deployment_id,
            device_id = %device_id,
            from = %previous,
            to = %status,
            "device deployment status updated"
        );

        self.finish_if_done(deployment_id).await
    }

    async fn finish_if_done(&self, deployment_id: &DeploymentId) -> DeploymentResult<()> {
        let Some(deployment) = self.deployments.find_by_id(deployment_id).await? else {
            return Err(DeploymentError::MissingUpdateTarget(deployment_id.to_string()));
        };

        if deployment.is_finished() && deployment.finished.is_none() {
            self.deployments.finish(deployment_id, Utc::now()).await?;
            info!(deployment_id = %deployment_id, "deployment finished");
        }
        Ok(())
    }

    /// Instructions for the oldest unfinished assignment of a device.
    ///
    /// Returns `None` when the device has nothing to install. When
    /// `installed` shows the device already runs the assigned artifact, the
    /// assignment is closed as `already-installed` and `None` is returned.
    pub async fn get_deployment_for_device(
        &self,
        device_id: &DeviceId,
        installed: Option<&InstalledArtifact>,
    ) -> DeploymentResult<Option<DeploymentInstructions>> {
        let Some(record) = self
            .device_deployments
            .find_oldest_for_device_with_statuses(device_id, &DeviceDeploymentStatus::ACTIVE)
            .await?
        else {
            return Ok(None);
        };

        let Some(image) = record.image else {
            warn!(
                deployment_id = %record.deployment_id,
                device_id = %device_id,
                status = %record.status,
                "active device deployment has no image"
            );
            return Ok(None);
        };

        if installed.is_some_and(|i| i.artifact_name == image.artifact_name) {
            info!(
                deployment_id = %record.deployment_id,
                device_id = %device_id,
                artifact = %image.artifact_name,
                "artifact already installed"
            );
            self.apply_status(
                &record.deployment_id,
                device_id,
                DeviceDeploymentStatus::AlreadyInstalled,
                false,
            )
            .await?;
            return Ok(None);
        }

        let link = tokio::time::timeout(
            self.settings.collaborator_timeout,
            self.linker.get_request(&image.id, self.settings.link_expiry),
        )
        .await
        .map_err(|_| DeploymentError::Timeout("download link generation"))??;

        debug!(
            deployment_id = %record.deployment_id,
            device_id = %device_id,
            image_id = %image.id,
            expire = %link.expire,
            "download link generated"
        );

        Ok(Some(DeploymentInstructions {
            id: record.deployment_id,
            artifact: ArtifactInstructions {
                artifact_name: image.artifact_name,
                source: link,
                device_types_compatible: image.device_types_compatible,
            },
        }))
    }

    /// Whether any deployment ever assigned the image.
    pub async fn image_used_in_deployment(&self, image_id: &ImageId) -> DeploymentResult<bool> {
        self.device_deployments
            .exist_assigned_image_with_id_and_statuses(image_id, &[])
            .await
    }

    /// Whether a device still has to install the image.
    pub async fn image_used_in_active_deployment(
        &self,
        image_id: &ImageId,
    ) -> DeploymentResult<bool> {
        self.device_deployments
            .exist_assigned_image_with_id_and_statuses(image_id, &DeviceDeploymentStatus::ACTIVE)
            .await
    }

    /// Abort every unfinished device assignment of a deployment.
    pub async fn abort_deployment(&self, id: &DeploymentId) -> DeploymentResult<()> {
        if self.deployments.find_by_id(id).await?.is_none() {
            return Err(DeploymentError::DeploymentNotFound(id.to_string()));
        }

        let aborted = self.device_deployments.abort_device_deployments(id).await?;
        self.recompute_stats(id).await?;

        info!(deployment_id = %id, devices = aborted, "deployment aborted");
        Ok(())
    }

    /// Close every unfinished assignment of a device removed from the fleet.
    pub async fn decommission_device(&self, device_id: &DeviceId) -> DeploymentResult<()> {
        let changed = self
            .device_deployments
            .decommission_device_deployments(device_id)
            .await?;

        let affected: BTreeSet<DeploymentId> = self
            .device_deployments
            .find_all_for_device_with_statuses(
                device_id,
                &[DeviceDeploymentStatus::Decommissioned],
            )
            .await?
            .into_iter()
            .map(|r| r.deployment_id)
            .collect();

        for deployment_id in &affected {
            self.recompute_stats(deployment_id).await?;
        }

        info!(
            device_id = %device_id,
            records = changed,
            deployments = affected.len(),
            "device decommissioned"
        );
        Ok(())
    }

    async fn recompute_stats(&self, id: &DeploymentId) -> DeploymentResult<()> {
        let stats = self.device_deployments.aggregate_by_status(id).await?;
        self.deployments.update_stats_and_finish(id, stats).await
    }

    /// Store the execution log a device uploaded for a deployment.
    pub async fn save_device_deployment_log(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
        messages: Vec<LogMessage>,
    ) -> DeploymentResult<()> {
        let log = DeploymentLog {
            deployment_id: deployment_id.clone(),
            device_id: device_id.clone(),
            messages,
        };
        log.validate()?;

        if !self.has_deployment_for_device(deployment_id, device_id).await? {
            return Err(DeploymentError::DeviceDeploymentNotFound {
                deployment_id: deployment_id.to_string(),
                device_id: device_id.to_string(),
            });
        }

        self.logs.save_log(&log).await?;
        self.device_deployments
            .update_log_availability(device_id, deployment_id, true)
            .await?;

        debug!(
            deployment_id = %deployment_id,
            device_id = %device_id,
            lines = log.messages.len(),
            "deployment log saved"
        );
        Ok(())
    }

    /// Execution log of one device for one deployment.
    pub async fn get_device_deployment_log(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
    ) -> DeploymentResult<Option<DeploymentLog>> {
        self.logs.get_log(deployment_id, device_id).await
    }

    /// Whether the device is part of the deployment.
    pub async fn has_deployment_for_device(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
    ) -> DeploymentResult<bool> {
        self.device_deployments
            .has_deployment_for_device(deployment_id, device_id)
            .await
    }

    /// Remove a deployment and all of its device records.
    pub async fn delete_deployment(&self, id: &DeploymentId) -> DeploymentResult<()> {
        if self.deployments.find_by_id(id).await?.is_none() {
            return Err(DeploymentError::DeploymentNotFound(id.to_string()));
        }

        let records = self.device_deployments.delete_by_deployment(id).await?;
        self.deployments.delete(id).await?;

        info!(deployment_id = %id, records, "deployment deleted");
        Ok(())
    }
}

impl std::fmt::Debug for DeploymentsModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentsModel")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::device_deployment::{Image, Link};
    use crate::status::DeviceDeploymentStatus as S;
    use crate::store::MemoryStore;

    /// Every device gets an image, except ids starting with "bare".
    struct FixedGenerator;

    #[async_trait]
    impl DeviceDeploymentGenerator for FixedGenerator {
        async fn generate(
            &self,
            device_id: &DeviceId,
            deployment: &Deployment,
        ) -> DeploymentResult<DeviceDeployment> {
            if device_id.as_str().starts_with("bare") {
                return Ok(DeviceDeployment::no_artifact(
                    deployment.id.clone(),
                    device_id.clone(),
                    "x86",
                    deployment.created,
                    Utc::now(),
                ));
            }
            Ok(DeviceDeployment::pending(
                deployment.id.clone(),
                device_id.clone(),
                "rpi4",
                Image {
                    id: ImageId::new("img-1"),
                    artifact_name: deployment.artifact_name.clone(),
                    device_types_compatible: vec!["rpi4".to_owned()],
                },
                deployment.created,
            ))
        }
    }

    struct StaticLinker;

    #[async_trait]
    impl ImageLinker for StaticLinker {
        async fn get_request(
            &self,
            image_id: &ImageId,
            expiry: DownloadLinkExpiry,
        ) -> DeploymentResult<Link> {
            let expire = Utc::now()
                + ChronoDuration::from_std(expiry.as_duration())
                    .map_err(|e| DeploymentError::Link(e.to_string()))?;
            Ok(Link {
                uri: format!("https://blobs.example/{image_id}"),
                expire,
                method: "GET".to_owned(),
                header: Default::default(),
            })
        }
    }

    fn model_with(settings: ModelSettings) -> (DeploymentsModel, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let model = DeploymentsModel::new(
            Arc::clone(&store),
            Arc::new(FixedGenerator),
            Arc::new(StaticLinker),
            settings,
        );
        (model, store)
    }

    fn model() -> DeploymentsModel {
        model_with(ModelSettings::default()).0
    }

    fn constructor(devices: &[&str]) -> DeploymentConstructor {
        DeploymentConstructor::new("rollout", "App-1.0", devices.iter().map(|d| DeviceId::new(*d)))
    }

    async fn create(model: &DeploymentsModel, devices: &[&str]) -> DeploymentId {
        model
            .create_deployment(constructor(devices), &CancellationToken::new())
            .await
            .expect("create failed")
    }

    async fn stats(model: &DeploymentsModel, id: &DeploymentId) -> Stats {
        model
            .get_deployment(id)
            .await
            .expect("get failed")
            .expect("deployment missing")
            .stats
    }

    #[tokio::test]
    async fn create_rejects_invalid_constructor() {
        let err = model()
            .create_deployment(constructor(&[]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::Validation(_)));
    }

    #[tokio::test]
    async fn create_seeds_stats_from_generated_records() {
        let model = model();
        let id = create(&model, &["a", "b", "bare-c"]).await;

        let stats = stats(&model, &id).await;
        assert_eq!(stats.get(S::Pending), 2);
        assert_eq!(stats.get(S::NoArtifact), 1);
        assert_eq!(stats.total(), 3);

        let records = model.get_device_statuses_for_deployment(&id).await.unwrap();
        assert_eq!(records.len(), 3);
    }

    #[tokio::test]
    async fn create_with_only_unmatched_devices_is_finished() {
        let model = model();
        let id = create(&model, &["bare-1", "bare-2"]).await;

        let deployment = model.get_deployment(&id).await.unwrap().unwrap();
        assert_eq!(deployment.finished, Some(deployment.created));
        assert!(model.is_deployment_finished(&id).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_creation_persists_nothing() {
        let (model, store) = model_with(ModelSettings::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = model
            .create_deployment(constructor(&["a"]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::Cancelled));
        assert!(store.find(&Query::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_flow_finishes_deployment() {
        let model = model();
        let id = create(&model, &["a"]).await;
        let device = DeviceId::new("a");

        for status in [S::Downloading, S::Installing, S::Rebooting] {
            model
                .update_device_deployment_status(&id, &device, status)
                .await
                .expect("update failed");
            assert!(!model.is_deployment_finished(&id).await.unwrap());
        }
        model
            .update_device_deployment_status(&id, &device, S::Success)
            .await
            .expect("update failed");

        let deployment = model.get_deployment(&id).await.unwrap().unwrap();
        assert!(deployment.finished.is_some());
        assert_eq!(deployment.stats, Stats::new().with(S::Success, 1));
    }

    #[tokio::test]
    async fn repeated_report_is_noop() {
        let model = model();
        let id = create(&model, &["a", "b"]).await;
        let device = DeviceId::new("a");

        model
            .update_device_deployment_status(&id, &device, S::Downloading)
            .await
            .unwrap();
        let before = stats(&model, &id).await;
        model
            .update_device_deployment_status(&id, &device, S::Downloading)
            .await
            .unwrap();
        assert_eq!(stats(&model, &id).await, before);
    }

    #[tokio::test]
    async fn terminal_records_do_not_move() {
        let model = model();
        let id = create(&model, &["a", "b"]).await;
        let device = DeviceId::new("a");

        model
            .update_device_deployment_status(&id, &device, S::Failure)
            .await
            .unwrap();
        let err = model
            .update_device_deployment_status(&id, &device, S::Downloading)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeploymentError::InvalidStatusTransition { from: S::Failure, to: S::Downloading }
        ));
    }

    #[tokio::test]
    async fn lenient_mode_accepts_skipped_steps() {
        let model = model();
        let id = create(&model, &["a"]).await;

        model
            .update_device_deployment_status(&id, &DeviceId::new("a"), S::Success)
            .await
            .expect("pending -> success should be accepted");
        assert!(model.is_deployment_finished(&id).await.unwrap());
    }

    #[tokio::test]
    async fn strict_mode_rejects_skipped_steps() {
        let (model, _) = model_with(ModelSettings {
            strict_transitions: true,
            ..ModelSettings::default()
        });
        let id = create(&model, &["a"]).await;
        let device = DeviceId::new("a");

        let err = model
            .update_device_deployment_status(&id, &device, S::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::InvalidStatusTransition { .. }));
        assert_eq!(stats(&model, &id).await, Stats::with_pending(1));

        model
            .update_device_deployment_status(&id, &device, S::Downloading)
            .await
            .expect("pending -> downloading is allowed");
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let model = model();
        let id = create(&model, &["a"]).await;
        let err = model
            .update_device_deployment_status(&id, &DeviceId::new("zz"), S::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::DeviceDeploymentNotFound { .. }));
    }

    #[tokio::test]
    async fn device_instructions_and_already_installed() {
        let model = model();
        let id = create(&model, &["a"]).await;
        let device = DeviceId::new("a");

        let instructions = model
            .get_deployment_for_device(&device, None)
            .await
            .unwrap()
            .expect("expected instructions");
        assert_eq!(instructions.id, id);
        assert_eq!(instructions.artifact.artifact_name, "App-1.0");
        assert!(instructions.artifact.source.uri.ends_with("img-1"));

        let installed = InstalledArtifact {
            artifact_name: "App-1.0".to_owned(),
            device_type: "rpi4".to_owned(),
        };
        let none = model
            .get_deployment_for_device(&device, Some(&installed))
            .await
            .unwrap();
        assert!(none.is_none());

        let deployment = model.get_deployment(&id).await.unwrap().unwrap();
        assert_eq!(deployment.stats.get(S::AlreadyInstalled), 1);
        assert!(deployment.finished.is_some());
    }

    #[tokio::test]
    async fn abort_closes_active_records() {
        let model = model();
        let id = create(&model, &["a", "b", "bare-c"]).await;
        model
            .update_device_deployment_status(&id, &DeviceId::new("a"), S::Downloading)
            .await
            .unwrap();

        model.abort_deployment(&id).await.expect("abort failed");

        let deployment = model.get_deployment(&id).await.unwrap().unwrap();
        assert_eq!(deployment.stats.get(S::Aborted), 2);
        assert_eq!(deployment.stats.get(S::NoArtifact), 1);
        assert!(deployment.finished.is_some());

        let err = model
            .update_device_deployment_status(&id, &DeviceId::new("a"), S::Installing)
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::DeploymentAborted));
    }

    #[tokio::test]
    async fn decommission_updates_every_affected_deployment() {
        let model = model();
        let first = create(&model, &["a", "b"]).await;
        let second = create(&model, &["a"]).await;

        model
            .decommission_device(&DeviceId::new("a"))
            .await
            .expect("decommission failed");

        let s1 = stats(&model, &first).await;
        assert_eq!(s1.get(S::Decommissioned), 1);
        assert_eq!(s1.get(S::Pending), 1);

        let d2 = model.get_deployment(&second).await.unwrap().unwrap();
        assert_eq!(d2.stats.get(S::Decommissioned), 1);
        assert!(d2.finished.is_some());

        let err = model
            .update_device_deployment_status(&first, &DeviceId::new("a"), S::Downloading)
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::DeviceDecommissioned));
    }

    #[tokio::test]
    async fn image_usage() {
        let model = model();
        let id = create(&model, &["a"]).await;
        let image = ImageId::new("img-1");

        assert!(model.image_used_in_deployment(&image).await.unwrap());
        assert!(model.image_used_in_active_deployment(&image).await.unwrap());

        model
            .update_device_deployment_status(&id, &DeviceId::new("a"), S::Failure)
            .await
            .unwrap();
        assert!(model.image_used_in_deployment(&image).await.unwrap());
        assert!(!model.image_used_in_active_deployment(&image).await.unwrap());
    }

    #[tokio::test]
    async fn logs_require_membership() {
        let model = model();
        let id = create(&model, &["a"]).await;
        let line = LogMessage {
            timestamp: Utc::now(),
            level: "error".to_owned(),
            message: "checksum mismatch".to_owned(),
        };

        let err = model
            .save_device_deployment_log(&id, &DeviceId::new("stranger"), vec![line.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::DeviceDeploymentNotFound { .. }));

        let err = model
            .save_device_deployment_log(&id, &DeviceId::new("a"), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::Validation(_)));

        model
            .save_device_deployment_log(&id, &DeviceId::new("a"), vec![line])
            .await
            .expect("save failed");
        let log = model
            .get_device_deployment_log(&id, &DeviceId::new("a"))
            .await
            .unwrap()
            .expect("log missing");
        assert_eq!(log.messages.len(), 1);

        let records = model.get_device_statuses_for_deployment(&id).await.unwrap();
        assert!(records[0].is_log_available);
    }

    #[tokio::test]
    async fn stats_and_lookup_of_missing_deployment() {
        let model = model();
        let ghost = DeploymentId::generate();

        assert!(model.get_deployment_stats(&ghost).await.unwrap().is_none());
        assert!(matches!(
            model.get_device_statuses_for_deployment(&ghost).await,
            Err(DeploymentError::DeploymentNotFound(_))
        ));
        assert!(matches!(
            model.is_deployment_finished(&ghost).await,
            Err(DeploymentError::DeploymentNotFound(_))
        ));
        assert!(model.lookup_deployments(&Query::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_everything() {
        let model = model();
        let id = create(&model, &["a", "b"]).await;

        model.delete_deployment(&id).await.expect("delete failed");
        assert!(model.get_deployment(&id).await.unwrap().is_none());
        assert!(!model
            .has_deployment_for_device(&id, &DeviceId::new("a"))
            .await
            .unwrap());
        assert!(matches!(
            model.delete_deployment(&id).await,
            Err(DeploymentError::DeploymentNotFound(_))
        ));
    }
}
