//! Directory-provider and provider/directory linkage records (spec §3, §4.9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `directory_providers` row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DirectoryProvider {
    pub id: i32,
    pub url: String,
    pub enabled: bool,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// `directory_provider_directories` row — tracks churn of which directories a
/// given provider currently advertises.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProviderDirectoryLink {
    pub provider_id: i32,
    pub directory_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

/// One `{id, endpoint}` pair as returned by a provider (an `Endpoint` resource
/// in the provider's FHIR Bundle, or a row in the JSON file form — spec §4.9).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderDirectoryEntry {
    pub id: String,
    pub endpoint_address: String,
}
