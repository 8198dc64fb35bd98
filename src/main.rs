// MNEMO worker - boots the service container and runs until interrupted

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mnemo::memory::config::MemoryConfig;
use mnemo::{ServiceContainer, Transports};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = MemoryConfig::from_env();
    let transports = Transports::from_config(&config)?;
    let container = ServiceContainer::new(config, transports).await?;

    info!("mnemo worker ready");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    drop(container);
    Ok(())
}
