//! Scheduler (C8): a single timing loop with a bounded worker pool, global
//! concurrency ceilings, and per-directory mutual exclusion via leases.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::time::interval;

use crate::cancellation::CancellationToken;
use crate::config::SchedulerConfig;
use crate::db::DirectoryRegistry;
use crate::models::EligibilityPolicy;
use crate::pipeline::{CleanupPipeline, PassOutcome, UpdatePipeline};
use crate::Result;

/// In-memory lease map keyed by directory id (spec §5 "Mutual exclusion").
/// Held only for the duration of a pass; never persisted, so a process
/// restart implicitly clears every lease.
#[derive(Default)]
struct Leases {
    held: Mutex<HashSet<String>>,
}

impl Leases {
    fn try_acquire(&self, id: &str) -> bool {
        self.held.lock().unwrap().insert(id.to_string())
    }

    fn release(&self, id: &str) {
        self.held.lock().unwrap().remove(id);
    }
}

pub struct Scheduler {
    registry: Arc<dyn DirectoryRegistry>,
    update_pipeline: Arc<UpdatePipeline>,
    cleanup_pipeline: Arc<CleanupPipeline>,
    policy: EligibilityPolicy,
    config: SchedulerConfig,
    leases: Arc<Leases>,
    update_permits: Arc<Semaphore>,
    cleanup_permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<dyn DirectoryRegistry>,
        update_pipeline: Arc<UpdatePipeline>,
        cleanup_pipeline: Arc<CleanupPipeline>,
        policy: EligibilityPolicy,
        config: SchedulerConfig,
    ) -> Self {
        let update_permits = Arc::new(Semaphore::new(config.max_concurrent_updates));
        let cleanup_permits = Arc::new(Semaphore::new(config.max_concurrent_cleanups));
        Self {
            registry,
            update_pipeline,
            cleanup_pipeline,
            policy,
            config,
            leases: Arc::new(Leases::default()),
            update_permits,
            cleanup_permits,
        }
    }

    /// Runs the tick loop until `shutdown` flips to `true` (spec §4.8, §B
    /// "Graceful shutdown"). Returns once every in-flight job this loop
    /// spawned has finished or been cancelled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = interval(Duration::from_secs(self.config.delay_input));
        let mut join_set = tokio::task::JoinSet::new();
        let (cancel_tx, cancel_token) = crate::cancellation::pair();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.dispatch_tick(&mut join_set, &cancel_token).await?;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = cancel_tx.send(true);
                        break;
                    }
                }
            }
        }

        while join_set.join_next().await.is_some() {}
        Ok(())
    }

    async fn dispatch_tick(
        &self,
        join_set: &mut tokio::task::JoinSet<()>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let now = chrono::Utc::now();

        if self.config.automatic_background_update {
            for directory in self.registry.list_eligible_for_update(now).await? {
                if !directory.is_stale(now, &self.policy) {
                    continue;
                }
                if !self.leases.try_acquire(&directory.id) {
                    continue;
                }
                self.spawn_update(join_set, directory, cancel.clone());
            }
        }

        if self.config.automatic_background_cleanup {
            for directory in self.registry.list_eligible_for_cleanup(now).await? {
                if !directory.must_be_cleaned_up(now, &self.policy) {
                    continue;
                }
                let deletion_triggered = directory.deleted_at.map(|at| at <= now).unwrap_or(false);
                if deletion_triggered && !self.config.cleanup_client_directory_after_directory_delete {
                    continue;
                }
                if !self.leases.try_acquire(&directory.id) {
                    continue;
                }
                // Policy-driven cleanup always retains the directory record
                // with counters reset; removing the record is reserved for
                // an explicit admin `purge` call (spec §4.7 step 4).
                self.spawn_cleanup(join_set, directory.id, false, cancel.clone());
            }
        }

        Ok(())
    }

    /// Admin-triggered purge (spec §4.7, "admin-issued `purge(id)`"):
    /// removes the directory record once its local resources are gone.
    pub async fn purge_directory(&self, directory_id: &str) -> Result<()> {
        let (_tx, cancel) = crate::cancellation::pair();
        self.cleanup_pipeline.run(directory_id, true, &cancel).await?;
        Ok(())
    }

    fn spawn_update(
        &self,
        join_set: &mut tokio::task::JoinSet<()>,
        directory: crate::models::Directory,
        cancel: CancellationToken,
    ) {
        let pipeline = self.update_pipeline.clone();
        let leases = self.leases.clone();
        let permits = self.update_permits.clone();

        join_set.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    leases.release(&directory.id);
                    return;
                }
            };

            match pipeline.run(&directory, &cancel).await {
                Ok(report) => {
                    tracing::info!(
                        directory_id = %report.directory_id,
                        outcome = ?report.outcome,
                        entries_seen = report.counters.entries_seen,
                        entries_written = report.counters.entries_written,
                        entries_deleted = report.counters.entries_deleted,
                        entries_skipped = report.counters.entries_skipped,
                        wall_time_ms = report.counters.wall_time_ms,
                        "update pass finished"
                    );
                    if report.outcome == PassOutcome::Cancelled {
                        tracing::info!(directory_id = %directory.id, "update pass cancelled");
                    }
                }
                Err(e) => {
                    tracing::error!(directory_id = %directory.id, error = %e, "update pass errored");
                }
            }

            leases.release(&directory.id);
        });
    }

    fn spawn_cleanup(
        &self,
        join_set: &mut tokio::task::JoinSet<()>,
        directory_id: String,
        purge: bool,
        cancel: CancellationToken,
    ) {
        let pipeline = self.cleanup_pipeline.clone();
        let leases = self.leases.clone();
        let permits = self.cleanup_permits.clone();

        join_set.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    leases.release(&directory_id);
                    return;
                }
            };

            match pipeline.run(&directory_id, purge, &cancel).await {
                Ok(report) => {
                    tracing::info!(
                        directory_id = %report.directory_id,
                        outcome = ?report.outcome,
                        entries_deleted = report.counters.entries_deleted,
                        "cleanup pass finished"
                    );
                }
                Err(e) => {
                    tracing::error!(directory_id = %directory_id, error = %e, "cleanup pass errored");
                }
            }

            leases.release(&directory_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_acquire_is_exclusive() {
        let leases = Leases::default();
        assert!(leases.try_acquire("dir-a"));
        assert!(!leases.try_acquire("dir-a"));
        leases.release("dir-a");
        assert!(leases.try_acquire("dir-a"));
    }
}
