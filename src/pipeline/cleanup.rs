//! Cleanup Pipeline (C7): removes every local resource authored from a
//! directory, either because of policy-driven cleanup or an explicit purge.

use std::sync::Arc;
use std::time::Instant;

use crate::cancellation::CancellationToken;
use crate::db::{DirectoryRegistry, ResourceMapStore};
use crate::local_writer::LocalWriter;
use crate::pipeline::{PassCounters, PassOutcome, PassReport};
use crate::Result;

pub struct CleanupPipeline {
    registry: Arc<dyn DirectoryRegistry>,
    map_store: Arc<dyn ResourceMapStore>,
    writer: Arc<dyn LocalWriter>,
}

impl CleanupPipeline {
    pub fn new(
        registry: Arc<dyn DirectoryRegistry>,
        map_store: Arc<dyn ResourceMapStore>,
        writer: Arc<dyn LocalWriter>,
    ) -> Self {
        Self {
            registry,
            map_store,
            writer,
        }
    }

    /// spec §4.7. `purge` distinguishes an explicit admin purge (directory
    /// record removed on completion) from policy-driven cleanup (record
    /// retained, counters reset).
    pub async fn run(
        &self,
        directory_id: &str,
        purge: bool,
        cancel: &CancellationToken,
    ) -> Result<PassReport> {
        let started = Instant::now();
        let mut counters = PassCounters::default();

        let rows = self.map_store.list_for_directory(directory_id).await?;

        for row in rows {
            if cancel.is_cancelled() {
                counters.wall_time_ms = started.elapsed().as_millis() as u64;
                return Ok(PassReport {
                    directory_id: directory_id.to_string(),
                    outcome: PassOutcome::Cancelled,
                    counters,
                });
            }

            self.writer
                .delete(&row.resource_type, &row.update_client_resource_id)
                .await?;
            self.map_store.delete(row.id).await?;
            counters.entries_deleted += 1;
        }

        if purge {
            self.registry.purge(directory_id).await?;
        } else {
            self.registry.reset_after_cleanup(directory_id).await?;
        }

        counters.wall_time_ms = started.elapsed().as_millis() as u64;
        Ok(PassReport {
            directory_id: directory_id.to_string(),
            outcome: PassOutcome::Success,
            counters,
        })
    }
}
