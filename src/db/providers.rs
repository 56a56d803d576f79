//! Directory-provider persistence (spec §3, §4.9, C9).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::models::{DirectoryProvider, ProviderDirectoryLink};
use crate::{Error, Result};

#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn list_enabled(&self) -> Result<Vec<DirectoryProvider>>;
    async fn mark_refreshed(&self, provider_id: i32, t: DateTime<Utc>) -> Result<()>;

    /// Upserts presence for `directory_id` under `provider_id`, refreshing
    /// `last_seen_at` and clearing any prior `removed_at` (spec §4.9: "new
    /// entries are inserted... last_seen_at is refreshed for present entries").
    async fn touch_seen(&self, provider_id: i32, directory_id: &str, t: DateTime<Utc>) -> Result<()>;

    /// Marks directories no longer advertised by `provider_id` as removed
    /// (spec §4.9: "missing entries are marked with removed_at").
    async fn mark_missing_removed(
        &self,
        provider_id: i32,
        still_present: &[String],
        t: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    async fn links_for_provider(&self, provider_id: i32) -> Result<Vec<ProviderDirectoryLink>>;
}

#[derive(Clone)]
pub struct PostgresProviderStore {
    pool: PgPool,
}

impl PostgresProviderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProviderStore for PostgresProviderStore {
    async fn list_enabled(&self) -> Result<Vec<DirectoryProvider>> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, enabled, last_refresh_at, created_at, modified_at
            FROM directory_providers
            WHERE enabled = true
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| DirectoryProvider {
                id: r.get("id"),
                url: r.get("url"),
                enabled: r.get("enabled"),
                last_refresh_at: r.get("last_refresh_at"),
                created_at: r.get("created_at"),
                modified_at: r.get("modified_at"),
            })
            .collect())
    }

    async fn mark_refreshed(&self, provider_id: i32, t: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE directory_providers SET last_refresh_at = $2, modified_at = now() WHERE id = $1",
        )
        .bind(provider_id)
        .bind(t)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn touch_seen(&self, provider_id: i32, directory_id: &str, t: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO directory_provider_directories
                (provider_id, directory_id, first_seen_at, last_seen_at, removed_at)
            VALUES ($1, $2, $3, $3, NULL)
            ON CONFLICT (provider_id, directory_id) DO UPDATE
                SET last_seen_at = EXCLUDED.last_seen_at,
                    removed_at = NULL
            "#,
        )
        .bind(provider_id)
        .bind(directory_id)
        .bind(t)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn mark_missing_removed(
        &self,
        provider_id: i32,
        still_present: &[String],
        t: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            UPDATE directory_provider_directories
            SET removed_at = $3
            WHERE provider_id = $1
              AND removed_at IS NULL
              AND NOT (directory_id = ANY($2))
            RETURNING directory_id
            "#,
        )
        .bind(provider_id)
        .bind(still_present)
        .bind(t)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(|r| r.get("directory_id")).collect())
    }

    async fn links_for_provider(&self, provider_id: i32) -> Result<Vec<ProviderDirectoryLink>> {
        let rows = sqlx::query(
            r#"
            SELECT provider_id, directory_id, first_seen_at, last_seen_at, removed_at
            FROM directory_provider_directories
            WHERE provider_id = $1
            ORDER BY directory_id
            "#,
        )
        .bind(provider_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| ProviderDirectoryLink {
                provider_id: r.get("provider_id"),
                directory_id: r.get("directory_id"),
                first_seen_at: r.get("first_seen_at"),
                last_seen_at: r.get("last_seen_at"),
                removed_at: r.get("removed_at"),
            })
            .collect())
    }
}
