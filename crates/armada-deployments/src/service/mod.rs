//! Service lifecycle management.
//!
//! Wires configuration, storage and collaborators into a [`DeploymentsModel`]
//! and keeps it alive until a shutdown signal arrives. Embedders reach the
//! running model through [`DeploymentsService::model`].

use std::sync::{Arc, OnceLock};

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::artifacts::ArtifactsClient;
use crate::config::{DeploymentsConfig, StorageBackend};
use crate::error::DeploymentResult;
use crate::generator::{DeviceDeploymentGenerator, ImageBasedGenerator, ImageFinder};
use crate::inventory::InventoryClient;
use crate::links::ImageLinker;
use crate::model::{DeploymentsModel, ModelSettings};
use crate::store::{MemoryStore, PostgresStore};

/// The deployments service.
pub struct DeploymentsService {
    config: DeploymentsConfig,
    cancel: CancellationToken,
    model: OnceLock<Arc<DeploymentsModel>>,
}

impl DeploymentsService {
    /// Create a new service with the given configuration.
    #[must_use]
    pub fn new(config: DeploymentsConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            model: OnceLock::new(),
        }
    }

    /// Token cancelled once shutdown is requested.
    ///
    /// Pass it to long-running model calls such as deployment creation.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Build the model: storage, collaborator clients and generator.
    ///
    /// With the PostgreSQL backend selected, an unreachable database falls
    /// back to the in-memory store.
    pub async fn build_model(&self) -> DeploymentResult<Arc<DeploymentsModel>> {
        let settings = self.config.model.settings()?;

        let inventory = Arc::new(InventoryClient::new(&self.config.inventory)?);
        info!(url = %self.config.inventory.url, "inventory client configured");

        let artifacts = Arc::new(ArtifactsClient::new(&self.config.artifacts)?);
        info!(url = %self.config.artifacts.url, "artifact catalogue client configured");

        let images: Arc<dyn ImageFinder> = artifacts.clone();
        let linker: Arc<dyn ImageLinker> = artifacts;
        let generator: Arc<dyn DeviceDeploymentGenerator> = Arc::new(ImageBasedGenerator::new(
            inventory,
            images,
            settings.collaborator_timeout,
        ));

        let model = match self.config.storage.backend {
            StorageBackend::Memory => {
                info!("using in-memory store");
                memory_model(generator, linker, settings)
            }
            StorageBackend::Postgres => match self.postgres_store().await {
                Ok(store) => DeploymentsModel::new(Arc::new(store), generator, linker, settings),
                Err(e) => {
                    error!(
                        error = %e,
                        "failed to connect to PostgreSQL, using in-memory store"
                    );
                    memory_model(generator, linker, settings)
                }
            },
        };

        info!(
            strict_transitions = settings.strict_transitions,
            link_expiry_secs = settings.link_expiry.as_duration().as_secs(),
            "deployment model initialised"
        );
        Ok(Arc::new(model))
    }

    /// The model built by [`run`](Self::run), once it is up.
    #[must_use]
    pub fn model(&self) -> Option<Arc<DeploymentsModel>> {
        self.model.get().cloned()
    }

    /// Run the service until a shutdown signal arrives.
    ///
    /// The model is built once and stays reachable through
    /// [`model`](Self::model) for the lifetime of the service.
    pub async fn run(&self) -> DeploymentResult<()> {
        let model = match self.model.get() {
            Some(model) => Arc::clone(model),
            None => {
                let built = self.build_model().await?;
                Arc::clone(self.model.get_or_init(|| built))
            }
        };
        info!(settings = ?model.settings(), "deployments service running");

        shutdown_signal(self.cancel.clone()).await;
        self.cancel.cancel();

        info!("deployments service shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn postgres_store(&self) -> DeploymentResult<PostgresStore> {
        let store = PostgresStore::connect(&self.config.database).await?;
        store.ensure_text_index().await?;
        info!(url = %self.config.database.url, "connected to PostgreSQL");
        Ok(store)
    }
}

fn memory_model(
    generator: Arc<dyn DeviceDeploymentGenerator>,
    linker: Arc<dyn ImageLinker>,
    settings: ModelSettings,
) -> DeploymentsModel {
    let store = MemoryStore::new();
    store.ensure_text_index();
    DeploymentsModel::new(Arc::new(store), generator, linker, settings)
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
