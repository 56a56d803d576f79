//! Directory registry store (spec §4.1, C1).
//!
//! The registry is exposed as a trait so the scheduler and pipelines can be
//! unit-tested against an in-memory fake (spec §9 "Dependency injection at
//! construction time... enables in-memory test doubles"), with
//! `PostgresDirectoryRegistry` as the production implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::models::{Directory, DirectoryOrigin};
use crate::{Error, Result};

#[async_trait]
pub trait DirectoryRegistry: Send + Sync {
    async fn upsert(&self, id: &str, endpoint: &str, origin: DirectoryOrigin) -> Result<Directory>;
    async fn get(&self, id: &str) -> Result<Option<Directory>>;
    async fn list_eligible_for_update(&self, now: DateTime<Utc>) -> Result<Vec<Directory>>;
    async fn list_eligible_for_cleanup(&self, now: DateTime<Utc>) -> Result<Vec<Directory>>;
    async fn mark_success(&self, id: &str, t: DateTime<Utc>) -> Result<()>;
    async fn mark_failure(&self, id: &str, ignore_threshold: i32) -> Result<bool>;
    async fn mark_ignored(&self, id: &str) -> Result<()>;
    async fn unignore(&self, id: &str) -> Result<()>;
    async fn schedule_delete(&self, id: &str, at: DateTime<Utc>) -> Result<()>;
    async fn purge(&self, id: &str) -> Result<()>;
    /// Resets counters/flags without removing the record (spec §4.7 step 4,
    /// policy-driven cleanup as opposed to explicit `purge`).
    async fn reset_after_cleanup(&self, id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct PostgresDirectoryRegistry {
    pool: PgPool,
}

impl PostgresDirectoryRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_directory(row: &sqlx::postgres::PgRow) -> Directory {
        Directory {
            id: row.get("id"),
            endpoint_address: row.get("endpoint_address"),
            origin: row.get("origin"),
            failed_sync_count: row.get("failed_sync_count"),
            failed_attempts: row.get("failed_attempts"),
            last_success_sync: row.get("last_success_sync"),
            is_ignored: row.get("is_ignored"),
            deleted_at: row.get("deleted_at"),
            created_at: row.get("created_at"),
            modified_at: row.get("modified_at"),
        }
    }
}

#[async_trait]
impl DirectoryRegistry for PostgresDirectoryRegistry {
    async fn upsert(&self, id: &str, endpoint: &str, origin: DirectoryOrigin) -> Result<Directory> {
        let row = sqlx::query(
            r#"
            INSERT INTO directory_info (id, endpoint_address, origin)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
                SET endpoint_address = EXCLUDED.endpoint_address,
                    modified_at = now()
            RETURNING id, endpoint_address, origin, failed_sync_count, failed_attempts,
                      last_success_sync, is_ignored, deleted_at, created_at, modified_at
            "#,
        )
        .bind(id)
        .bind(endpoint)
        .bind(origin.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(Self::row_to_directory(&row))
    }

    async fn get(&self, id: &str) -> Result<Option<Directory>> {
        let row = sqlx::query(
            r#"
            SELECT id, endpoint_address, origin, failed_sync_count, failed_attempts,
                   last_success_sync, is_ignored, deleted_at, created_at, modified_at
            FROM directory_info
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|r| Self::row_to_directory(&r)))
    }

    async fn list_eligible_for_update(&self, now: DateTime<Utc>) -> Result<Vec<Directory>> {
        // spec §4.1: "Eligible for update ⇔ is_ignored = false ∧ (deleted_at is
        // null ∨ future)". Pushed into SQL so the scheduler's snapshot query
        // doesn't have to pull ignored/purged directories across the wire.
        let rows = sqlx::query(
            r#"
            SELECT id, endpoint_address, origin, failed_sync_count, failed_attempts,
                   last_success_sync, is_ignored, deleted_at, created_at, modified_at
            FROM directory_info
            WHERE is_ignored = false
              AND (deleted_at IS NULL OR deleted_at > $1)
            ORDER BY id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(Self::row_to_directory).collect())
    }

    async fn list_eligible_for_cleanup(&self, now: DateTime<Utc>) -> Result<Vec<Directory>> {
        // spec §4.1 "Must be cleaned up" is a timing predicate over two
        // independent columns (scheduled deletion vs. stale success), so this
        // only narrows down to candidate rows; `Directory::must_be_cleaned_up`
        // applies the actual `cleanup_after_success` threshold in the scheduler.
        let rows = sqlx::query(
            r#"
            SELECT id, endpoint_address, origin, failed_sync_count, failed_attempts,
                   last_success_sync, is_ignored, deleted_at, created_at, modified_at
            FROM directory_info
            WHERE deleted_at <= $1
               OR last_success_sync IS NOT NULL
            ORDER BY id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(Self::row_to_directory).collect())
    }

    async fn mark_success(&self, id: &str, t: DateTime<Utc>) -> Result<()> {
        // spec §4.1 "mark_success": reset both counters, advance the watermark,
        // clear is_ignored if a prior failure streak had set it.
        sqlx::query(
            r#"
            UPDATE directory_info
            SET failed_sync_count = 0,
                failed_attempts = 0,
                last_success_sync = $2,
                is_ignored = false,
                modified_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(t)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn mark_failure(&self, id: &str, ignore_threshold: i32) -> Result<bool> {
        // spec §8 "Ignore trigger correctness": is_ignored flips to true
        // atomically with the Nth failure, so this is one UPDATE rather than a
        // read-then-write.
        let row = sqlx::query(
            r#"
            UPDATE directory_info
            SET failed_sync_count = failed_sync_count + 1,
                failed_attempts = failed_attempts + 1,
                is_ignored = is_ignored OR (failed_attempts + 1) >= $2,
                modified_at = now()
            WHERE id = $1
            RETURNING is_ignored
            "#,
        )
        .bind(id)
        .bind(ignore_threshold)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|r| r.get::<bool, _>("is_ignored")).unwrap_or(false))
    }

    async fn mark_ignored(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE directory_info SET is_ignored = true, modified_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn unignore(&self, id: &str) -> Result<()> {
        // spec §7 "Surface behavior": "Auto-ignore lifts only on administrative
        // unignore or after a successful pass triggered manually" — this clears
        // the flag but deliberately leaves failed_attempts alone, so a directory
        // that's still actually broken trips the threshold again quickly rather
        // than needing IGNORE_AFTER_FAILURES more failures.
        sqlx::query("UPDATE directory_info SET is_ignored = false, modified_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn schedule_delete(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE directory_info SET deleted_at = $2, modified_at = now() WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn purge(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM directory_info WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn reset_after_cleanup(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE directory_info
            SET failed_sync_count = 0,
                failed_attempts = 0,
                last_success_sync = NULL,
                deleted_at = NULL,
                modified_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }
}
