//! Layered configuration: compiled-in defaults → `config.toml` → `MCSD__`-prefixed
//! environment variables → `.env` for local development.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub mcsd_client: McsdClientConfig,
    #[serde(default)]
    pub directory_provider: DirectoryProviderConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_min_size")]
    pub pool_min_size: u32,
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout_seconds: u64,
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_seconds: u64,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_delay_input")]
    pub delay_input: u64,
    #[serde(default = "default_directory_stale_timeout")]
    pub directory_stale_timeout: i64,
    #[serde(default = "default_ignore_after_success")]
    pub ignore_directory_after_success_timeout: i64,
    #[serde(default = "default_ignore_after_failures")]
    pub ignore_directory_after_failed_attempts_threshold: i32,
    #[serde(default = "default_cleanup_after_success")]
    pub cleanup_client_directory_after_success_timeout: i64,
    #[serde(default = "default_true")]
    pub cleanup_client_directory_after_directory_delete: bool,
    #[serde(default = "default_true")]
    pub automatic_background_update: bool,
    #[serde(default = "default_true")]
    pub automatic_background_cleanup: bool,
    #[serde(default = "default_max_concurrent_updates")]
    pub max_concurrent_updates: usize,
    #[serde(default = "default_max_concurrent_cleanups")]
    pub max_concurrent_cleanups: usize,
    #[serde(default = "default_pass_soft_deadline")]
    pub pass_soft_deadline_seconds: u64,
    #[serde(default = "default_max_logs_entries")]
    pub max_logs_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McsdClientConfig {
    pub update_client_url: String,
    #[serde(default = "default_request_count")]
    pub request_count: u32,
    #[serde(default)]
    pub strict_validation: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_retry_initial")]
    pub retry_initial_backoff_seconds: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_backoff_seconds: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_jitter_ratio")]
    pub retry_jitter_ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryProviderConfig {
    pub directories_provider_url: Option<String>,
    pub directory_urls_path: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout: u64,
    #[serde(default = "default_provider_backoff")]
    pub backoff: u64,
    #[serde(default = "default_provider_refresh_interval")]
    pub refresh_interval_seconds: u64,
    #[serde(default)]
    pub enabled: bool,
}

impl Default for DirectoryProviderConfig {
    fn default() -> Self {
        Self {
            directories_provider_url: None,
            directory_urls_path: None,
            timeout: default_provider_timeout(),
            backoff: default_provider_backoff(),
            refresh_interval_seconds: default_provider_refresh_interval(),
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_host")]
    pub host: String,
    #[serde(default = "default_cache_port")]
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_object_ttl")]
    pub object_ttl: u64,
    #[serde(default = "default_cache_namespace")]
    pub default_cache_namespace: String,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_cache_host(),
            port: default_cache_port(),
            ssl: false,
            object_ttl: default_object_ttl(),
            default_cache_namespace: default_cache_namespace(),
            max_entries: default_cache_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub file_enabled: bool,
    #[serde(default = "default_log_directory")]
    pub file_directory: String,
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_log_rotation")]
    pub file_rotation: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    pub deployment_environment: Option<String>,
}

fn default_database_url() -> String {
    "postgres://localhost/mcsd_update_client".to_string()
}
fn default_pool_min_size() -> u32 {
    1
}
fn default_pool_max_size() -> u32 {
    5
}
fn default_pool_timeout() -> u64 {
    30
}
fn default_statement_timeout() -> u64 {
    300
}
fn default_lock_timeout() -> u64 {
    30
}
fn default_delay_input() -> u64 {
    60
}
fn default_directory_stale_timeout() -> i64 {
    3600
}
fn default_ignore_after_success() -> i64 {
    7 * 24 * 3600
}
fn default_ignore_after_failures() -> i32 {
    10
}
fn default_cleanup_after_success() -> i64 {
    30 * 24 * 3600
}
fn default_true() -> bool {
    true
}
fn default_max_concurrent_updates() -> usize {
    4
}
fn default_max_concurrent_cleanups() -> usize {
    2
}
fn default_pass_soft_deadline() -> u64 {
    300
}
fn default_max_logs_entries() -> usize {
    1000
}
fn default_request_count() -> u32 {
    100
}
fn default_request_timeout() -> u64 {
    30
}
fn default_retry_initial() -> u64 {
    1
}
fn default_retry_max() -> u64 {
    30
}
fn default_retry_max_attempts() -> u32 {
    5
}
fn default_jitter_ratio() -> f64 {
    0.2
}
fn default_provider_timeout() -> u64 {
    30
}
fn default_provider_backoff() -> u64 {
    5
}
fn default_provider_refresh_interval() -> u64 {
    3600
}
fn default_cache_host() -> String {
    "localhost".to_string()
}
fn default_cache_port() -> u16 {
    6379
}
fn default_object_ttl() -> u64 {
    300
}
fn default_cache_namespace() -> String {
    "mcsd".to_string()
}
fn default_cache_max_entries() -> usize {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_directory() -> String {
    "./logs".to_string()
}
fn default_log_file_prefix() -> String {
    "mcsd-update-client".to_string()
}
fn default_log_rotation() -> String {
    "daily".to_string()
}
fn default_service_name() -> String {
    "mcsd-update-client".to_string()
}

impl Config {
    /// Load configuration from environment and config files.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .set_default("database.url", default_database_url())?
            .set_default("database.pool_min_size", default_pool_min_size())?
            .set_default("database.pool_max_size", default_pool_max_size())?
            .set_default("database.pool_timeout_seconds", default_pool_timeout())?
            .set_default(
                "database.statement_timeout_seconds",
                default_statement_timeout(),
            )?
            .set_default("database.lock_timeout_seconds", default_lock_timeout())?
            .set_default("scheduler.delay_input", default_delay_input())?
            .set_default(
                "scheduler.directory_stale_timeout",
                default_directory_stale_timeout(),
            )?
            .set_default(
                "scheduler.ignore_directory_after_success_timeout",
                default_ignore_after_success(),
            )?
            .set_default(
                "scheduler.ignore_directory_after_failed_attempts_threshold",
                default_ignore_after_failures(),
            )?
            .set_default(
                "scheduler.cleanup_client_directory_after_success_timeout",
                default_cleanup_after_success(),
            )?
            .set_default(
                "scheduler.cleanup_client_directory_after_directory_delete",
                default_true(),
            )?
            .set_default("scheduler.automatic_background_update", default_true())?
            .set_default("scheduler.automatic_background_cleanup", default_true())?
            .set_default(
                "scheduler.max_concurrent_updates",
                default_max_concurrent_updates() as i64,
            )?
            .set_default(
                "scheduler.max_concurrent_cleanups",
                default_max_concurrent_cleanups() as i64,
            )?
            .set_default(
                "scheduler.pass_soft_deadline_seconds",
                default_pass_soft_deadline(),
            )?
            .set_default(
                "scheduler.max_logs_entries",
                default_max_logs_entries() as i64,
            )?
            .set_default("mcsd_client.request_count", default_request_count())?
            .set_default("mcsd_client.strict_validation", false)?
            .set_default(
                "mcsd_client.request_timeout_seconds",
                default_request_timeout(),
            )?
            .set_default(
                "mcsd_client.retry_initial_backoff_seconds",
                default_retry_initial(),
            )?
            .set_default(
                "mcsd_client.retry_max_backoff_seconds",
                default_retry_max(),
            )?
            .set_default("mcsd_client.retry_max_attempts", default_retry_max_attempts())?
            .set_default("mcsd_client.retry_jitter_ratio", default_jitter_ratio())?
            .set_default("directory_provider.timeout", default_provider_timeout())?
            .set_default("directory_provider.backoff", default_provider_backoff())?
            .set_default(
                "directory_provider.refresh_interval_seconds",
                default_provider_refresh_interval(),
            )?
            .set_default("directory_provider.enabled", false)?
            .set_default("cache.enabled", false)?
            .set_default("cache.host", default_cache_host())?
            .set_default("cache.port", default_cache_port() as i64)?
            .set_default("cache.ssl", false)?
            .set_default("cache.object_ttl", default_object_ttl())?
            .set_default("cache.default_cache_namespace", default_cache_namespace())?
            .set_default("cache.max_entries", default_cache_max_entries() as i64)?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)?
            .set_default("logging.file_enabled", false)?
            .set_default("logging.file_directory", default_log_directory())?
            .set_default("logging.file_prefix", default_log_file_prefix())?
            .set_default("logging.file_rotation", default_log_rotation())?
            .set_default("logging.service_name", default_service_name())?
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("MCSD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Self = config.try_deserialize()?;

        if std::env::var("MCSD__DATABASE__URL").is_err() {
            if let Ok(url) = std::env::var("DATABASE_URL") {
                config.database.url = url;
            }
        }

        Ok(config)
    }

    /// Rejects configuration combinations that would otherwise fail later,
    /// deep inside the scheduler or client, with a less actionable error.
    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.delay_input == 0 {
            return Err("scheduler.delay_input must be > 0".to_string());
        }
        if self.scheduler.max_concurrent_updates == 0 {
            return Err("scheduler.max_concurrent_updates must be > 0".to_string());
        }
        if self.scheduler.max_concurrent_cleanups == 0 {
            return Err("scheduler.max_concurrent_cleanups must be > 0".to_string());
        }
        if self.mcsd_client.update_client_url.is_empty() {
            return Err("mcsd_client.update_client_url must be set".to_string());
        }
        if self.mcsd_client.retry_max_backoff_seconds < self.mcsd_client.retry_initial_backoff_seconds
        {
            return Err(
                "mcsd_client.retry_max_backoff_seconds must be >= retry_initial_backoff_seconds"
                    .to_string(),
            );
        }
        if !(0.0..=1.0).contains(&self.mcsd_client.retry_jitter_ratio) {
            return Err("mcsd_client.retry_jitter_ratio must be between 0.0 and 1.0".to_string());
        }
        if self.directory_provider.enabled
            && self.directory_provider.directories_provider_url.is_none()
            && self.directory_provider.directory_urls_path.is_none()
        {
            return Err(
                "directory_provider.enabled=true requires directories_provider_url or directory_urls_path"
                    .to_string(),
            );
        }

        Ok(())
    }
}
