// Pulse daemon: runs the worker pool and scheduler over the QNTX store
// until interrupted. Domain handlers are registered by the embedding
// distribution; a bare daemon still drains schedules and surfaces
// missing-handler failures on the jobs themselves.

use anyhow::{Context, Result};
use pulse::{Config, HandlerRegistry, Pulse};
use qntx_store::Store;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pulse=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(path = %config.database_path.display(), "opening store");

    let store = Store::open(&config.database_path)
        .await
        .context("failed to open store")?;

    let registry = HandlerRegistry::new();

    let pulse = Pulse::start(store, registry, config)
        .await
        .context("failed to start pulse")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("received shutdown signal");

    pulse.shutdown().await;
    Ok(())
}
