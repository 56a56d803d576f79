//! Update (C6) and cleanup (C7) pipelines — the per-directory units of work
//! the scheduler dispatches onto worker tasks.

pub mod cleanup;
pub mod update;

pub use cleanup::CleanupPipeline;
pub use update::UpdatePipeline;

/// Counters emitted once per pass (spec §4.6 step 5).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PassCounters {
    pub entries_seen: u64,
    pub entries_written: u64,
    pub entries_deleted: u64,
    pub entries_skipped: u64,
    pub wall_time_ms: u64,
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum PassOutcome {
    Success,
    Failure,
    Cancelled,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PassReport {
    pub directory_id: String,
    pub outcome: PassOutcome,
    pub counters: PassCounters,
}
