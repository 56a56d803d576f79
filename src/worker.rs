//! mCSD Update Client — standalone directory-provider refresher (C9).
//!
//! Runs only the periodic provider reconciliation, for deployments that want
//! to scale it independently of the main scheduler daemon. Set
//! `directory_provider.enabled = false` on the main `mcsd-update-client`
//! process when running this binary alongside it, to avoid double-refreshing.

use anyhow::Context;
use mcsd_update_client::{
    config::Config,
    db::{PostgresDirectoryRegistry, PostgresProviderStore},
    logging, startup,
    provider_refresher::ProviderRefresher,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    logging::init_simple_logging();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting mCSD Update Worker (directory-provider refresher)"
    );

    if !config.directory_provider.enabled {
        tracing::warn!("directory_provider.enabled is false; nothing to do");
        return Ok(());
    }

    let pool = startup::retry_on_db_unavailable(|| startup::create_db_pool(&config))
        .await
        .context("failed to initialize database pool")?;

    let registry = Arc::new(PostgresDirectoryRegistry::new(pool.clone()));
    let providers = Arc::new(PostgresProviderStore::new(pool));
    let refresher = ProviderRefresher::new(registry, providers, config.directory_provider.clone())
        .context("failed to initialize provider refresher")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tracing::info!(
        refresh_interval_seconds = config.directory_provider.refresh_interval_seconds,
        "Worker configuration loaded"
    );
    tracing::info!("Worker running. Press Ctrl+C to stop.");

    let handle = tokio::spawn(async move { refresher.run(shutdown_rx).await });

    startup::shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "refresher ended with error"),
        Err(e) => tracing::error!(error = %e, "refresher task join error"),
    }

    tracing::info!("mCSD Update Worker shutdown complete");
    Ok(())
}
