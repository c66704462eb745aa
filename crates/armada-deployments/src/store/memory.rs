//! In-memory deployment store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::deployment::Deployment;
use crate::device_deployment::{DeploymentLog, DeviceDeployment};
use crate::error::{DeploymentError, DeploymentResult};
use crate::query::Query;
use crate::stats::Stats;
use crate::status::DeviceDeploymentStatus;
use crate::types::{DeploymentId, DeviceId, ImageId};

use super::{DeploymentLogStore, DeploymentStore, DeviceDeploymentStore};

type PairKey = (String, String);

/// In-memory store implementing every storage trait.
///
/// Each trait method runs inside a single critical section, so counter
/// transitions and status updates are atomic just like single-row updates
/// in the database. Data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    deployments: RwLock<HashMap<String, Deployment>>,
    device_deployments: RwLock<BTreeMap<PairKey, DeviceDeployment>>,
    logs: RwLock<HashMap<PairKey, DeploymentLog>>,
    text_index: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the emulated free-text index.
    pub fn ensure_text_index(&self) {
        self.text_index.store(true, Ordering::Release);
    }

    /// Whether the emulated free-text index exists.
    #[must_use]
    pub fn has_text_index(&self) -> bool {
        self.text_index.load(Ordering::Acquire)
    }
}

fn lock_poisoned<T>(_: T) -> DeploymentError {
    DeploymentError::internal("lock poisoned")
}

fn pair(deployment_id: &DeploymentId, device_id: &DeviceId) -> PairKey {
    (
        deployment_id.as_str().to_owned(),
        device_id.as_str().to_owned(),
    )
}

fn status_in(status: DeviceDeploymentStatus, statuses: &[DeviceDeploymentStatus]) -> bool {
    statuses.is_empty() || statuses.contains(&status)
}

fn oldest_first(a: &DeviceDeployment, b: &DeviceDeployment) -> std::cmp::Ordering {
    a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert(&self, deployment: &Deployment) -> DeploymentResult<()> {
        deployment.id.validate()?;
        self.ensure_text_index();

        let mut deployments = self.deployments.write().map_err(lock_poisoned)?;

        let key = deployment.id.as_str().to_owned();
        if deployments.contains_key(&key) {
            return Err(DeploymentError::internal(format!(
                "deployment {key} already exists"
            )));
        }

        deployments.insert(key, deployment.clone());
        Ok(())
    }

    async fn delete(&self, id: &DeploymentId) -> DeploymentResult<()> {
        id.validate()?;
        let mut deployments = self.deployments.write().map_err(lock_poisoned)?;

        if deployments.remove(id.as_str()).is_none() {
            return Err(DeploymentError::DeploymentNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &DeploymentId) -> DeploymentResult<Option<Deployment>> {
        id.validate()?;
        let deployments = self.deployments.read().map_err(lock_poisoned)?;

        Ok(deployments.get(id.as_str()).cloned())
    }

    async fn find_unfinished_by_id(
        &self,
        id: &DeploymentId,
    ) -> DeploymentResult<Option<Deployment>> {
        id.validate()?;
        let deployments = self.deployments.read().map_err(lock_poisoned)?;

        Ok(deployments
            .get(id.as_str())
            .filter(|d| d.finished.is_none())
            .cloned())
    }

    async fn update_stats(
        &self,
        id: &DeploymentId,
        from: DeviceDeploymentStatus,
        to: DeviceDeploymentStatus,
    ) -> DeploymentResult<()> {
        id.validate()?;
        let mut deployments = self.deployments.write().map_err(lock_poisoned)?;

        let deployment = deployments
            .get_mut(id.as_str())
            .ok_or_else(|| DeploymentError::MissingUpdateTarget(id.to_string()))?;

        if !deployment.stats.try_transition(from, to) {
            return Err(DeploymentError::NegativeCounter {
                deployment_id: id.to_string(),
                status: from,
            });
        }
        Ok(())
    }

    async fn update_stats_and_finish(
        &self,
        id: &DeploymentId,
        stats: Stats,
    ) -> DeploymentResult<()> {
        id.validate()?;
        let mut deployments = self.deployments.write().map_err(lock_poisoned)?;

        let deployment = deployments
            .get_mut(id.as_str())
            .ok_or_else(|| DeploymentError::MissingUpdateTarget(id.to_string()))?;

        deployment.stats = stats;
        if stats.is_finished() && deployment.finished.is_none() {
            deployment.finished = Some(Utc::now());
        }
        Ok(())
    }

    async fn find(&self, query: &Query) -> DeploymentResult<Vec<Deployment>> {
        query.validate()?;
        let terms = query.terms();
        if terms.is_some() && !self.has_text_index() {
            return Err(DeploymentError::MissingTextIndex);
        }

        let deployments = self.deployments.read().map_err(lock_poisoned)?;

        let mut results: Vec<_> = deployments
            .values()
            .filter(|d| query.matches(d, terms.as_deref()))
            .cloned()
            .collect();

        results.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.id.cmp(&a.id)));

        let skip = usize::try_from(query.skip).unwrap_or(usize::MAX);
        let limit = query
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));

        Ok(results.into_iter().skip(skip).take(limit).collect())
    }

    async fn finish(&self, id: &DeploymentId, when: DateTime<Utc>) -> DeploymentResult<()> {
        id.validate()?;
        let mut deployments = self.deployments.write().map_err(lock_poisoned)?;

        let deployment = deployments
            .get_mut(id.as_str())
            .ok_or_else(|| DeploymentError::MissingUpdateTarget(id.to_string()))?;

        deployment.finished.get_or_insert(when);
        Ok(())
    }
}

#[async_trait]
impl DeviceDeploymentStore for MemoryStore {
    async fn insert_many(&self, records: &[DeviceDeployment]) -> DeploymentResult<()> {
        for record in records {
            record.deployment_id.validate()?;
            record.device_id.validate()?;
        }

        let mut stored = self.device_deployments.write().map_err(lock_poisoned)?;

        let mut batch = BTreeMap::new();
        for record in records {
            let key = pair(&record.deployment_id, &record.device_id);
            if stored.contains_key(&key) || batch.contains_key(&key) {
                return Err(DeploymentError::internal(format!(
                    "device {} already assigned to deployment {}",
                    record.device_id, record.deployment_id
                )));
            }
            batch.insert(key, record.clone());
        }

        stored.extend(batch);
        Ok(())
    }

    async fn exist_assigned_image_with_id_and_statuses(
        &self,
        image_id: &ImageId,
        statuses: &[DeviceDeploymentStatus],
    ) -> DeploymentResult<bool> {
        image_id.validate()?;
        let stored = self.device_deployments.read().map_err(lock_poisoned)?;

        Ok(stored.values().any(|r| {
            r.image.as_ref().is_some_and(|image| image.id == *image_id)
                && status_in(r.status, statuses)
        }))
    }

    async fn find_oldest_for_device_with_statuses(
        &self,
        device_id: &DeviceId,
        statuses: &[DeviceDeploymentStatus],
    ) -> DeploymentResult<Option<DeviceDeployment>> {
        device_id.validate()?;
        let stored = self.device_deployments.read().map_err(lock_poisoned)?;

        Ok(stored
            .values()
            .filter(|r| r.device_id == *device_id && status_in(r.status, statuses))
            .min_by(|a, b| oldest_first(a, b))
            .cloned())
    }

    async fn find_all_for_device_with_statuses(
        &self,
        device_id: &DeviceId,
        statuses: &[DeviceDeploymentStatus],
    ) -> DeploymentResult<Vec<DeviceDeployment>> {
        device_id.validate()?;
        let stored = self.device_deployments.read().map_err(lock_poisoned)?;

        let mut records: Vec<_> = stored
            .values()
            .filter(|r| r.device_id == *device_id && status_in(r.status, statuses))
            .cloned()
            .collect();
        records.sort_by(oldest_first);
        Ok(records)
    }

    async fn update_status(
        &self,
        device_id: &DeviceId,
        deployment_id: &DeploymentId,
        status: DeviceDeploymentStatus,
        finished: Option<DateTime<Utc>>,
    ) -> DeploymentResult<DeviceDeploymentStatus> {
        device_id.validate()?;
        deployment_id.validate()?;
        let mut stored = self.device_deployments.write().map_err(lock_poisoned)?;

        let record = stored.get_mut(&pair(deployment_id, device_id)).ok_or_else(|| {
            DeploymentError::DeviceDeploymentNotFound {
                deployment_id: deployment_id.to_string(),
                device_id: device_id.to_string(),
            }
        })?;

        match record.status {
            DeviceDeploymentStatus::Aborted => return Err(DeploymentError::DeploymentAborted),
            DeviceDeploymentStatus::Decommissioned => {
                return Err(DeploymentError::DeviceDecommissioned)
            }
            current if current.is_terminal() && current == status => return Ok(current),
            current if current.is_terminal() => {
                return Err(DeploymentError::InvalidStatusTransition {
                    from: current,
                    to: status,
                })
            }
            _ => {}
        }

        let previous = record.status;
        record.status = status;
        record.finished = finished;
        Ok(previous)
    }

    async fn get_status(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
    ) -> DeploymentResult<Option<DeviceDeploymentStatus>> {
        deployment_id.validate()?;
        device_id.validate()?;
        let stored = self.device_deployments.read().map_err(lock_poisoned)?;

        Ok(stored.get(&pair(deployment_id, device_id)).map(|r| r.status))
    }

    async fn update_log_availability(
        &self,
        device_id: &DeviceId,
        deployment_id: &DeploymentId,
        available: bool,
    ) -> DeploymentResult<()> {
        device_id.validate()?;
        deployment_id.validate()?;
        let mut stored = self.device_deployments.write().map_err(lock_poisoned)?;

        let record = stored.get_mut(&pair(deployment_id, device_id)).ok_or_else(|| {
            DeploymentError::DeviceDeploymentNotFound {
                deployment_id: deployment_id.to_string(),
                device_id: device_id.to_string(),
            }
        })?;
        record.is_log_available = available;
        Ok(())
    }

    async fn aggregate_by_status(&self, deployment_id: &DeploymentId) -> DeploymentResult<Stats> {
        deployment_id.validate()?;
        let stored = self.device_deployments.read().map_err(lock_poisoned)?;

        Ok(stored
            .values()
            .filter(|r| r.deployment_id == *deployment_id)
            .map(|r| r.status)
            .collect())
    }

    async fn get_device_statuses_for_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> DeploymentResult<Vec<DeviceDeployment>> {
        deployment_id.validate()?;
        let stored = self.device_deployments.read().map_err(lock_poisoned)?;

        Ok(stored
            .values()
            .filter(|r| r.deployment_id == *deployment_id)
            .cloned()
            .collect())
    }

    async fn has_deployment_for_device(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
    ) -> DeploymentResult<bool> {
        deployment_id.validate()?;
        device_id.validate()?;
        let stored = self.device_deployments.read().map_err(lock_poisoned)?;

        Ok(stored.contains_key(&pair(deployment_id, device_id)))
    }

    async fn abort_device_deployments(&self, deployment_id: &DeploymentId) -> DeploymentResult<u64> {
        deployment_id.validate()?;
        let now = Utc::now();
        let mut stored = self.device_deployments.write().map_err(lock_poisoned)?;

        let mut changed = 0;
        for record in stored
            .values_mut()
            .filter(|r| r.deployment_id == *deployment_id && r.status.is_active())
        {
            record.status = DeviceDeploymentStatus::Aborted;
            record.finished = Some(now);
            changed += 1;
        }
        Ok(changed)
    }

    async fn decommission_device_deployments(&self, device_id: &DeviceId) -> DeploymentResult<u64> {
        device_id.validate()?;
        let now = Utc::now();
        let mut stored = self.device_deployments.write().map_err(lock_poisoned)?;

        let mut changed = 0;
        for record in stored
            .values_mut()
            .filter(|r| r.device_id == *device_id && r.status.is_active())
        {
            record.status = DeviceDeploymentStatus::Decommissioned;
            record.finished = Some(now);
            changed += 1;
        }
        Ok(changed)
    }

    async fn delete_by_deployment(&self, deployment_id: &DeploymentId) -> DeploymentResult<u64> {
        deployment_id.validate()?;
        let mut stored = self.device_deployments.write().map_err(lock_poisoned)?;

        let before = stored.len();
        stored.retain(|_, r| r.deployment_id != *deployment_id);
        Ok(u64::try_from(before - stored.len()).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl DeploymentLogStore for MemoryStore {
    async fn save_log(&self, log: &DeploymentLog) -> DeploymentResult<()> {
        log.deployment_id.validate()?;
        log.device_id.validate()?;
        let mut logs = self.logs.write().map_err(lock_poisoned)?;

        logs.insert(pair(&log.deployment_id, &log.device_id), log.clone());
        Ok(())
    }

    async fn get_log(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
    ) -> DeploymentResult<Option<DeploymentLog>> {
        deployment_id.validate()?;
        device_id.validate()?;
        let logs = self.logs.read().map_err(lock_poisoned)?;

        Ok(logs.get(&pair(deployment_id, device_id)).cloned())
    }
}
