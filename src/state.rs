//! Shared application state: wires every component behind its trait object so
//! the pipelines and scheduler stay unit-testable against in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use url::Url;

use crate::cache::MetadataCache;
use crate::config::Config;
use crate::db::{
    DirectoryRegistry, PostgresDirectoryRegistry, PostgresProviderStore, PostgresResourceMapStore,
    ProviderStore, ResourceMapStore,
};
use crate::directory_client::{DirectoryClientFactory, HttpDirectoryClientFactory, RetryPolicy};
use crate::local_writer::{HttpLocalWriter, LocalWriter};
use crate::models::EligibilityPolicy;
use crate::pipeline::{CleanupPipeline, UpdatePipeline};
use crate::provider_refresher::ProviderRefresher;
use crate::scheduler::Scheduler;
use crate::{Error, Result};

/// Everything a binary needs after startup: the DB pool (kept for health
/// checks / future admin surfaces) plus the fully wired scheduler and
/// refresher, ready to `run()`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db_pool: PgPool,
    pub registry: Arc<dyn DirectoryRegistry>,
    pub map_store: Arc<dyn ResourceMapStore>,
    pub provider_store: Arc<dyn ProviderStore>,
    pub cache: Arc<MetadataCache>,
    pub scheduler: Arc<Scheduler>,
    pub provider_refresher: Arc<ProviderRefresher>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        tracing::info!("Initializing application state...");

        let config_arc = Arc::new(config);
        let db_pool = crate::startup::create_db_pool(&config_arc).await?;

        let registry: Arc<dyn DirectoryRegistry> =
            Arc::new(PostgresDirectoryRegistry::new(db_pool.clone()));
        let map_store: Arc<dyn ResourceMapStore> =
            Arc::new(PostgresResourceMapStore::new(db_pool.clone()));
        let provider_store: Arc<dyn ProviderStore> =
            Arc::new(PostgresProviderStore::new(db_pool.clone()));
        let cache = Arc::new(MetadataCache::new(&config_arc.cache));

        let retry = RetryPolicy::from_config(&config_arc.mcsd_client);
        let client_factory: Arc<dyn DirectoryClientFactory> = Arc::new(HttpDirectoryClientFactory::new(
            Duration::from_secs(config_arc.mcsd_client.request_timeout_seconds),
            config_arc.mcsd_client.request_count,
            retry.clone(),
        ));

        let local_base_url = Url::parse(&config_arc.mcsd_client.update_client_url)
            .map_err(|e| Error::Config(format!("invalid mcsd_client.update_client_url: {e}")))?;
        let writer: Arc<dyn LocalWriter> = Arc::new(HttpLocalWriter::new(
            local_base_url,
            Duration::from_secs(config_arc.mcsd_client.request_timeout_seconds),
            retry,
        )?);

        let update_pipeline = Arc::new(UpdatePipeline::new(
            registry.clone(),
            map_store.clone(),
            client_factory,
            writer.clone(),
            Some(cache.clone()),
            config_arc.mcsd_client.strict_validation,
            config_arc
                .scheduler
                .ignore_directory_after_failed_attempts_threshold,
            Duration::from_secs(config_arc.scheduler.pass_soft_deadline_seconds),
        ));
        let cleanup_pipeline = Arc::new(CleanupPipeline::new(
            registry.clone(),
            map_store.clone(),
            writer,
        ));

        let policy = EligibilityPolicy {
            stale: chrono::Duration::seconds(config_arc.scheduler.directory_stale_timeout),
            ignore_after_success: chrono::Duration::seconds(
                config_arc.scheduler.ignore_directory_after_success_timeout,
            ),
            ignore_after_failures: config_arc
                .scheduler
                .ignore_directory_after_failed_attempts_threshold,
            cleanup_after_success: chrono::Duration::seconds(
                config_arc
                    .scheduler
                    .cleanup_client_directory_after_success_timeout,
            ),
        };

        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            update_pipeline,
            cleanup_pipeline,
            policy,
            config_arc.scheduler.clone(),
        ));

        let provider_refresher = Arc::new(ProviderRefresher::new(
            registry.clone(),
            provider_store.clone(),
            config_arc.directory_provider.clone(),
        )?);

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: config_arc,
            db_pool,
            registry,
            map_store,
            provider_store,
            cache,
            scheduler,
            provider_refresher,
        })
    }
}
