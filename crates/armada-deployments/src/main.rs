//! Armada deployments service binary.

use tracing::info;
use tracing_subscriber::EnvFilter;

use armada_deployments::{DeploymentsConfig, DeploymentsService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("armada_deployments=info".parse()?),
        )
        .init();

    info!("armada deployments service starting");

    let config = DeploymentsConfig::load()?;

    info!(
        backend = ?config.storage.backend,
        database = %config.database.url,
        inventory = %config.inventory.url,
        artifacts = %config.artifacts.url,
        "configuration loaded"
    );

    DeploymentsService::new(config).run().await?;

    Ok(())
}
