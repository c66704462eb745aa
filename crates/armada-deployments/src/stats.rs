//! Aggregate per-status counters of a deployment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::deployment::Phase;
use crate::status::DeviceDeploymentStatus;

/// One counter per device deployment status.
///
/// Every status is always present; serialised as a map with all ten keys.
/// The counters of a deployment sum to its device count at all times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<DeviceDeploymentStatus, u64>",
    into = "BTreeMap<DeviceDeploymentStatus, u64>"
)]
pub struct Stats {
    counters: [u64; DeviceDeploymentStatus::ALL.len()],
}

impl Stats {
    /// All counters zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counters: [0; DeviceDeploymentStatus::ALL.len()],
        }
    }

    /// Initial stats of a fresh deployment: every device pending.
    #[must_use]
    pub const fn with_pending(devices: u64) -> Self {
        let mut stats = Self::new();
        stats.counters[DeviceDeploymentStatus::Pending.index()] = devices;
        stats
    }

    /// Counter for one status.
    #[must_use]
    pub const fn get(&self, status: DeviceDeploymentStatus) -> u64 {
        self.counters[status.index()]
    }

    /// Overwrite the counter for one status.
    pub fn set(&mut self, status: DeviceDeploymentStatus, count: u64) {
        self.counters[status.index()] = count;
    }

    /// Add one to the counter for `status`.
    pub fn increment(&mut self, status: DeviceDeploymentStatus) {
        self.counters[status.index()] = self.counters[status.index()].saturating_add(1);
    }

    /// Builder-style [`Self::set`].
    #[must_use]
    pub const fn with(mut self, status: DeviceDeploymentStatus, count: u64) -> Self {
        self.counters[status.index()] = count;
        self
    }

    /// Sum of all counters; equals the deployment's device count.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counters.iter().sum()
    }

    /// Iterate `(status, count)` pairs in vocabulary order.
    pub fn iter(&self) -> impl Iterator<Item = (DeviceDeploymentStatus, u64)> + '_ {
        DeviceDeploymentStatus::ALL
            .into_iter()
            .map(|status| (status, self.get(status)))
    }

    /// Move one device from `from` to `to`.
    ///
    /// A transition to the same status changes nothing. Returns `false`,
    /// leaving the counters untouched, when the `from` counter is already zero.
    #[must_use]
    pub fn try_transition(
        &mut self,
        from: DeviceDeploymentStatus,
        to: DeviceDeploymentStatus,
    ) -> bool {
        if from == to {
            return true;
        }
        let Some(decremented) = self.get(from).checked_sub(1) else {
            return false;
        };
        self.set(from, decremented);
        self.increment(to);
        true
    }

    fn sum_of(&self, statuses: &[DeviceDeploymentStatus]) -> u64 {
        statuses.iter().map(|status| self.get(*status)).sum()
    }

    /// True iff some device is downloading, installing or rebooting.
    #[must_use]
    pub fn has_active_devices(&self) -> bool {
        self.sum_of(&DeviceDeploymentStatus::IN_FLIGHT) > 0
    }

    /// True iff some device already reached a final outcome.
    #[must_use]
    pub fn has_finished_devices(&self) -> bool {
        self.sum_of(&DeviceDeploymentStatus::TERMINAL) > 0
    }

    /// Devices are being worked on, or some have finished while others still wait.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.has_active_devices()
            || (self.get(DeviceDeploymentStatus::Pending) > 0 && self.has_finished_devices())
    }

    /// Nothing in progress and nothing left pending. Holds for zero devices.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !self.is_in_progress() && self.get(DeviceDeploymentStatus::Pending) == 0
    }

    /// Every device still waits to start.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.is_in_progress() && !self.is_finished()
    }

    /// Deployment phase implied by these counters.
    #[must_use]
    pub fn phase(&self) -> Phase {
        if self.is_in_progress() {
            Phase::InProgress
        } else if self.is_pending() {
            Phase::Pending
        } else {
            Phase::Finished
        }
    }
}

impl From<BTreeMap<DeviceDeploymentStatus, u64>> for Stats {
    fn from(map: BTreeMap<DeviceDeploymentStatus, u64>) -> Self {
        let mut stats = Self::new();
        for (status, count) in map {
            stats.set(status, count);
        }
        stats
    }
}

impl From<Stats> for BTreeMap<DeviceDeploymentStatus, u64> {
    fn from(stats: Stats) -> Self {
        stats.iter().collect()
    }
}

impl FromIterator<DeviceDeploymentStatus> for Stats {
    /// Count one device per yielded status.
    fn from_iter<I: IntoIterator<Item = DeviceDeploymentStatus>>(iter: I) -> Self {
        let mut stats = Self::new();
        for status in iter {
            stats.increment(status);
        }
        stats
    }
}
