//! Armada deployments
//!
//! This crate tracks software rollouts across a device fleet. A deployment
//! assigns one artifact to a set of devices; each device gets its own
//! assignment record whose status it reports as the update progresses, and the
//! deployment keeps one counter per status so its phase can be read without
//! scanning the records.
//!
//! # Lifecycle
//!
//! Device assignments move through:
//!
//! ```text
//! pending ──▶ downloading ──▶ installing ──▶ rebooting ──▶ success
//!    │             │              │              │
//!    └─────────────┴──────────────┴──────────────┴──▶ failure
//! ```
//!
//! plus the administrative exits `aborted` and `decommissioned`, and the
//! creation-time outcome `noartifact` for devices no image matches.
//!
//! A deployment is *pending* until some device starts, *in progress* while
//! devices are working or only some have finished, and *finished* once none
//! are left to act. See [`Stats::phase`].
//!
//! # Example
//!
//! ```ignore
//! use armada_deployments::{DeploymentConstructor, DeviceDeploymentStatus, DeviceId};
//! use tokio_util::sync::CancellationToken;
//!
//! let constructor = DeploymentConstructor::new(
//!     "kiosk rollout",
//!     "kiosk-2.4.1",
//!     [DeviceId::new("dev-1"), DeviceId::new("dev-2")],
//! );
//! let id = model.create_deployment(constructor, &CancellationToken::new()).await?;
//!
//! let device = DeviceId::new("dev-1");
//! model
//!     .update_device_deployment_status(&id, &device, DeviceDeploymentStatus::Downloading)
//!     .await?;
//! ```

#![forbid(unsafe_code)]

pub mod artifacts;
pub mod config;
pub mod deployment;
pub mod device_deployment;
pub mod error;
pub mod generator;
pub mod inventory;
pub mod links;
pub mod model;
pub mod query;
pub mod service;
pub mod stats;
pub mod status;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::DeploymentsConfig;
pub use deployment::{Deployment, DeploymentConstructor, DeploymentView, Phase};
pub use device_deployment::{
    DeploymentInstructions, DeploymentLog, DeviceDeployment, Image, InstalledArtifact, Link,
    LogMessage,
};
pub use error::{DeploymentError, DeploymentResult, ErrorKind};
pub use generator::{
    DeviceDeploymentGenerator, DeviceTypeResolver, ImageBasedGenerator, ImageFinder,
};
pub use links::{DownloadLinkExpiry, ImageLinker};
pub use model::{DeploymentsModel, ModelSettings};
pub use query::{PhaseFilter, Query};
pub use service::DeploymentsService;
pub use stats::Stats;
pub use status::DeviceDeploymentStatus;
pub use store::{
    DeploymentLogStore, DeploymentStore, DeviceDeploymentStore, MemoryStore, PostgresStore,
};
pub use types::{DeploymentId, DeviceDeploymentId, DeviceId, ImageId};
