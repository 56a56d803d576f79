//! mCSD Update Client — main daemon entry point.
//!
//! Runs the scheduler (C8): periodic update and cleanup passes over every
//! directory in the registry. The directory-provider refresher (C9) runs
//! embedded as well unless it's disabled in configuration; for independent
//! scaling of the refresher, run the separate `mcsd-update-worker` binary
//! instead and disable it here.

use anyhow::Context;
use mcsd_update_client::{config::Config, logging, startup, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let _logging_guard =
        logging::init_logging(&config.logging).context("failed to initialize logging")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = config.logging.deployment_environment,
        "Starting mCSD Update Client"
    );

    let state = startup::retry_on_db_unavailable(|| AppState::new(config.clone()))
        .await
        .context("failed to initialize application state")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let scheduler = state.scheduler.clone();
    let scheduler_handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    let refresher_handle = if state.config.directory_provider.enabled {
        let refresher = state.provider_refresher.clone();
        let rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move { refresher.run(rx).await }))
    } else {
        tracing::info!("Directory-provider refresher disabled in configuration");
        None
    };

    tracing::info!("mCSD Update Client running. Press Ctrl+C to stop.");
    startup::shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    match scheduler_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "scheduler ended with error"),
        Err(e) => tracing::error!(error = %e, "scheduler task join error"),
    }

    if let Some(handle) = refresher_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "refresher ended with error"),
            Err(e) => tracing::error!(error = %e, "refresher task join error"),
        }
    }

    tracing::info!("mCSD Update Client shutdown complete");
    Ok(())
}
