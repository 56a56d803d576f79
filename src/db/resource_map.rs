//! Resource-map store (spec §4.2, C2) — the bijection between remote and local
//! resource identity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::models::{new_update_client_resource_id, ResourceKey, ResourceMap};
use crate::{Error, Result};

#[async_trait]
pub trait ResourceMapStore: Send + Sync {
    async fn lookup(&self, key: &ResourceKey) -> Result<Option<ResourceMap>>;

    /// Reserve-or-return a local id for `key` (spec §4.2 "Allocation policy").
    /// Idempotent: a concurrent `allocate` for the same key converges on the
    /// same row via the unique-key upsert (spec §5 "Database discipline").
    async fn allocate(&self, key: &ResourceKey) -> Result<ResourceMap>;

    async fn record_versions(
        &self,
        map_id: uuid::Uuid,
        directory_resource_version: Option<i32>,
        update_client_resource_version: Option<i32>,
        t: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete(&self, map_id: uuid::Uuid) -> Result<()>;

    async fn list_for_directory(&self, directory_id: &str) -> Result<Vec<ResourceMap>>;
}

#[derive(Clone)]
pub struct PostgresResourceMapStore {
    pool: PgPool,
}

impl PostgresResourceMapStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_map(row: &sqlx::postgres::PgRow) -> ResourceMap {
        ResourceMap {
            id: row.get("id"),
            directory_id: row.get("directory_id"),
            resource_type: row.get("resource_type"),
            directory_resource_id: row.get("directory_resource_id"),
            directory_resource_version: row.get("directory_resource_version"),
            update_client_resource_id: row.get("update_client_resource_id"),
            update_client_resource_version: row.get("update_client_resource_version"),
            last_update: row.get("last_update"),
            created_at: row.get("created_at"),
            modified_at: row.get("modified_at"),
        }
    }
}

#[async_trait]
impl ResourceMapStore for PostgresResourceMapStore {
    async fn lookup(&self, key: &ResourceKey) -> Result<Option<ResourceMap>> {
        let row = sqlx::query(
            r#"
            SELECT id, directory_id, resource_type, directory_resource_id,
                   directory_resource_version, update_client_resource_id,
                   update_client_resource_version, last_update, created_at, modified_at
            FROM resource_map
            WHERE directory_id = $1 AND resource_type = $2 AND directory_resource_id = $3
            "#,
        )
        .bind(&key.directory_id)
        .bind(&key.resource_type)
        .bind(&key.directory_resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|r| Self::row_to_map(&r)))
    }

    async fn allocate(&self, key: &ResourceKey) -> Result<ResourceMap> {
        // spec §4.2 "Allocation is idempotent: a concurrent allocate for the
        // same key returns the existing row." A retry loop handles the rare
        // case where the freshly generated local id itself collides with an
        // existing row (astronomically unlikely given the random token, but
        // the unique constraint on update_client_resource_id makes it a
        // correctness requirement, not just a nicety — spec invariant
        // "Cross-directory non-collision").
        for _ in 0..5 {
            let candidate_id = new_update_client_resource_id(&key.directory_id);
            let row_id = uuid::Uuid::new_v4();

            let row = sqlx::query(
                r#"
                INSERT INTO resource_map
                    (id, directory_id, resource_type, directory_resource_id, update_client_resource_id)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (directory_id, directory_resource_id) DO UPDATE
                    SET modified_at = resource_map.modified_at
                RETURNING id, directory_id, resource_type, directory_resource_id,
                          directory_resource_version, update_client_resource_id,
                          update_client_resource_version, last_update, created_at, modified_at
                "#,
            )
            .bind(row_id)
            .bind(&key.directory_id)
            .bind(&key.resource_type)
            .bind(&key.directory_resource_id)
            .bind(&candidate_id)
            .fetch_one(&self.pool)
            .await;

            match row {
                Ok(row) => return Ok(Self::row_to_map(&row)),
                Err(sqlx::Error::Database(db_err))
                    if db_err.constraint() == Some("resource_map_update_client_resource_id_key") =>
                {
                    continue;
                }
                Err(e) => return Err(Error::Database(e)),
            }
        }

        Err(Error::MapConflict {
            directory_id: key.directory_id.clone(),
            resource_type: key.resource_type.clone(),
            directory_resource_id: key.directory_resource_id.clone(),
        })
    }

    async fn record_versions(
        &self,
        map_id: uuid::Uuid,
        directory_resource_version: Option<i32>,
        update_client_resource_version: Option<i32>,
        t: DateTime<Utc>,
    ) -> Result<()> {
        // spec §5 "Ordering within a directory": "A later update never
        // regresses local version counters."
        sqlx::query(
            r#"
            UPDATE resource_map
            SET directory_resource_version = GREATEST(
                    COALESCE(directory_resource_version, 0), COALESCE($2, 0)
                ),
                update_client_resource_version = GREATEST(
                    COALESCE(update_client_resource_version, 0), COALESCE($3, 0)
                ),
                last_update = $4,
                modified_at = now()
            WHERE id = $1
            "#,
        )
        .bind(map_id)
        .bind(directory_resource_version)
        .bind(update_client_resource_version)
        .bind(t)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn delete(&self, map_id: uuid::Uuid) -> Result<()> {
        sqlx::query("DELETE FROM resource_map WHERE id = $1")
            .bind(map_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn list_for_directory(&self, directory_id: &str) -> Result<Vec<ResourceMap>> {
        // spec §4.7 step 1: "Enumerate all map rows for the directory in a
        // deterministic order."
        let rows = sqlx::query(
            r#"
            SELECT id, directory_id, resource_type, directory_resource_id,
                   directory_resource_version, update_client_resource_id,
                   update_client_resource_version, last_update, created_at, modified_at
            FROM resource_map
            WHERE directory_id = $1
            ORDER BY resource_type, directory_resource_id
            "#,
        )
        .bind(directory_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(Self::row_to_map).collect())
    }
}
