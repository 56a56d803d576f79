//! Startup orchestration: ordered initialization (database pool, with
//! DB-unavailable retry) ahead of `state::AppState::new`'s component wiring.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::time::sleep;
use uuid::Uuid;

use crate::config::Config;
use crate::{Error, Result};

pub async fn create_db_pool(config: &Config) -> Result<PgPool> {
    tracing::info!("Creating database connection pool...");

    let statement_timeout = config.database.statement_timeout_seconds;
    let lock_timeout = config.database.lock_timeout_seconds;

    let pool = PgPoolOptions::new()
        .min_connections(config.database.pool_min_size)
        .max_connections(config.database.pool_max_size)
        .acquire_timeout(Duration::from_secs(config.database.pool_timeout_seconds))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query(&format!("SET statement_timeout = '{statement_timeout}s'"))
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(&format!("SET lock_timeout = '{lock_timeout}s'"))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&config.database.url)
        .await
        .map_err(Error::Database)?;

    tracing::info!(
        min = config.database.pool_min_size,
        max = config.database.pool_max_size,
        "Database pool created"
    );

    Ok(pool)
}

/// Retries `f` with jittered exponential backoff as long as it fails with
/// `Error::Database` (spec/SPEC_FULL §B "DB-unavailable startup retry"),
/// rather than exiting on the first connection failure — appropriate for a
/// daemon expected to survive a database restart during its own startup
/// window. Any other error is returned immediately.
pub async fn retry_on_db_unavailable<F, Fut, T>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let initial = Duration::from_secs(1);
    let max = Duration::from_secs(60);
    let jitter_ratio = 0.2;

    let mut retry_delay = initial;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(Error::Database(e)) => {
                tracing::error!(
                    "Database unavailable at startup: {} (retrying in {:?})",
                    e,
                    retry_delay
                );
                sleep(jittered_duration(retry_delay, jitter_ratio)).await;
                retry_delay = (retry_delay * 2).min(max);
            }
            Err(e) => return Err(e),
        }
    }
}

fn jittered_duration(base: Duration, jitter_ratio: f64) -> Duration {
    if base.is_zero() || jitter_ratio <= 0.0 {
        return base;
    }
    let bytes = *Uuid::new_v4().as_bytes();
    let value = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
    let unit = (value as f64) / (u64::MAX as f64);
    let signed = unit * 2.0 - 1.0;
    let factor = (1.0 + signed * jitter_ratio).max(0.0);
    base.mul_f64(factor)
}

/// Waits for `SIGTERM` or `SIGINT` (Docker sends the former, Ctrl+C the
/// latter) before returning, so binaries can start a coordinated shutdown.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let sigint = tokio::signal::ctrl_c();

    tokio::select! {
        _ = sigint => {
            tracing::info!("SIGINT received, starting graceful shutdown...");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, starting graceful shutdown...");
        }
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    tracing::info!("Shutdown signal received, starting graceful shutdown...");
}
