//! Directory record and the pure eligibility predicates that drive the scheduler
//! (spec §3 "Directory record", §4.1 "Eligibility").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored as plain `varchar` in `directory_info.origin` (spec §6); this type is
/// the in-memory representation, converted at the store boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryOrigin {
    Provider,
    Manual,
}

impl std::fmt::Display for DirectoryOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryOrigin::Provider => write!(f, "provider"),
            DirectoryOrigin::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for DirectoryOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provider" => Ok(DirectoryOrigin::Provider),
            "manual" => Ok(DirectoryOrigin::Manual),
            other => Err(format!("invalid directory origin: {other}")),
        }
    }
}

/// `directory_info` row (spec §6 logical schema).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Directory {
    pub id: String,
    pub endpoint_address: String,
    pub origin: String,
    pub failed_sync_count: i32,
    pub failed_attempts: i32,
    pub last_success_sync: Option<DateTime<Utc>>,
    pub is_ignored: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Policy constants that parameterize eligibility (spec §4.1). Held on the
/// config struct in production; passed explicitly here so the predicates stay
/// pure functions of `(Directory, now, policy)`, independently testable.
#[derive(Debug, Clone, Copy)]
pub struct EligibilityPolicy {
    pub stale: chrono::Duration,
    pub ignore_after_success: chrono::Duration,
    pub ignore_after_failures: i32,
    pub cleanup_after_success: chrono::Duration,
}

impl Directory {
    /// spec §4.1: "Eligible for update ⇔ is_ignored = false ∧ (deleted_at is
    /// null ∨ future)".
    pub fn eligible_for_update(&self, now: DateTime<Utc>) -> bool {
        !self.is_ignored && self.deleted_at.map(|at| at > now).unwrap_or(true)
    }

    /// spec §4.1: "Stale ⇔ last_success_sync is null ∨ now − last_success_sync ≥ STALE".
    pub fn is_stale(&self, now: DateTime<Utc>, policy: &EligibilityPolicy) -> bool {
        match self.last_success_sync {
            None => true,
            Some(t) => now - t >= policy.stale,
        }
    }

    /// spec §4.1: "Must be auto-ignored ⇔ failed_attempts ≥ IGNORE_AFTER_FAILURES
    /// ∨ (last_success_sync non-null ∧ now − last_success_sync ≥
    /// IGNORE_AFTER_SUCCESS)".
    pub fn must_be_auto_ignored(&self, now: DateTime<Utc>, policy: &EligibilityPolicy) -> bool {
        self.failed_attempts >= policy.ignore_after_failures
            || self
                .last_success_sync
                .map(|t| now - t >= policy.ignore_after_success)
                .unwrap_or(false)
    }

    /// spec §4.1: "Must be cleaned up ⇔ deleted_at ≤ now ∨ (last_success_sync
    /// non-null ∧ now − last_success_sync ≥ CLEANUP_AFTER_SUCCESS)".
    pub fn must_be_cleaned_up(&self, now: DateTime<Utc>, policy: &EligibilityPolicy) -> bool {
        self.deleted_at.map(|at| at <= now).unwrap_or(false)
            || self
                .last_success_sync
                .map(|t| now - t >= policy.cleanup_after_success)
                .unwrap_or(false)
    }

    /// Watermark used by the update pipeline (spec §4.6 step 1): last success,
    /// or the epoch when the directory has never synced successfully.
    pub fn watermark(&self) -> DateTime<Utc> {
        self.last_success_sync.unwrap_or_else(|| DateTime::UNIX_EPOCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> EligibilityPolicy {
        EligibilityPolicy {
            stale: chrono::Duration::hours(24),
            ignore_after_success: chrono::Duration::days(30),
            ignore_after_failures: 20,
            cleanup_after_success: chrono::Duration::days(90),
        }
    }

    fn directory(overrides: impl FnOnce(&mut Directory)) -> Directory {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut d = Directory {
            id: "dir-1".into(),
            endpoint_address: "https://directory.example/fhir".into(),
            origin: "provider".into(),
            failed_sync_count: 0,
            failed_attempts: 0,
            last_success_sync: Some(now),
            is_ignored: false,
            deleted_at: None,
            created_at: now,
            modified_at: now,
        };
        overrides(&mut d);
        d
    }

    #[test]
    fn eligible_for_update_excludes_ignored() {
        let now = Utc::now();
        let d = directory(|d| d.is_ignored = true);
        assert!(!d.eligible_for_update(now));
    }

    #[test]
    fn eligible_for_update_excludes_past_deleted_at() {
        let now = Utc::now();
        let d = directory(|d| d.deleted_at = Some(now - chrono::Duration::seconds(1)));
        assert!(!d.eligible_for_update(now));
    }

    #[test]
    fn eligible_for_update_allows_future_deleted_at() {
        let now = Utc::now();
        let d = directory(|d| d.deleted_at = Some(now + chrono::Duration::days(1)));
        assert!(d.eligible_for_update(now));
    }

    #[test]
    fn ignore_trips_at_exact_failure_threshold() {
        let now = Utc::now();
        let policy = policy();
        let below = directory(|d| d.failed_attempts = policy.ignore_after_failures - 1);
        let at = directory(|d| d.failed_attempts = policy.ignore_after_failures);
        assert!(!below.must_be_auto_ignored(now, &policy));
        assert!(at.must_be_auto_ignored(now, &policy));
    }

    #[test]
    fn ignore_trips_after_success_timeout_elapses() {
        let now = Utc::now();
        let policy = policy();
        let d = directory(|d| d.last_success_sync = Some(now - policy.ignore_after_success));
        assert!(d.must_be_auto_ignored(now, &policy));
    }

    #[test]
    fn never_synced_directory_is_stale_but_not_auto_ignored_by_success_timeout() {
        let now = Utc::now();
        let policy = policy();
        let d = directory(|d| d.last_success_sync = None);
        assert!(d.is_stale(now, &policy));
        assert!(!d.must_be_auto_ignored(now, &policy));
    }

    #[test]
    fn cleanup_trips_on_scheduled_delete_even_if_recently_synced() {
        let now = Utc::now();
        let policy = policy();
        let d = directory(|d| d.deleted_at = Some(now - chrono::Duration::seconds(1)));
        assert!(d.must_be_cleaned_up(now, &policy));
    }

    #[test]
    fn cleanup_trips_on_stale_success_without_scheduled_delete() {
        let now = Utc::now();
        let policy = policy();
        let d = directory(|d| d.last_success_sync = Some(now - policy.cleanup_after_success));
        assert!(d.must_be_cleaned_up(now, &policy));
    }

    #[test]
    fn cleanup_does_not_trip_before_either_threshold() {
        let now = Utc::now();
        let policy = policy();
        let d = directory(|d| {
            d.deleted_at = Some(now + chrono::Duration::days(1));
            d.last_success_sync = Some(now);
        });
        assert!(!d.must_be_cleaned_up(now, &policy));
    }

    #[test]
    fn watermark_falls_back_to_epoch() {
        let d = directory(|d| d.last_success_sync = None);
        assert_eq!(d.watermark(), DateTime::UNIX_EPOCH);
    }
}
