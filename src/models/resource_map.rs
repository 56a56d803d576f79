//! Resource-map record (spec §3 "Resource-map record", §4.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `resource_map` row. `update_client_resource_id` is unique across the entire
/// local store (spec invariant: "prevents cross-directory collisions").
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResourceMap {
    pub id: uuid::Uuid,
    pub directory_id: String,
    pub resource_type: String,
    pub directory_resource_id: String,
    pub directory_resource_version: Option<i32>,
    pub update_client_resource_id: String,
    pub update_client_resource_version: Option<i32>,
    pub last_update: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// The natural key a map row is addressed by everywhere except the allocation
/// call itself (spec §4.2: "`(directory_id, resource_type, directory_resource_id)`
/// → unique").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub directory_id: String,
    pub resource_type: String,
    pub directory_resource_id: String,
}

impl ResourceKey {
    pub fn new(
        directory_id: impl Into<String>,
        resource_type: impl Into<String>,
        directory_resource_id: impl Into<String>,
    ) -> Self {
        Self {
            directory_id: directory_id.into(),
            resource_type: resource_type.into(),
            directory_resource_id: directory_resource_id.into(),
        }
    }
}

/// High-entropy local id generator (spec §4.2 allocation policy): a stable
/// per-directory namespace segment followed by a random token, never the raw
/// remote id — this is what makes cross-directory collision structurally
/// impossible rather than merely unlikely.
pub fn new_update_client_resource_id(directory_id: &str) -> String {
    use rand::RngCore;

    let namespace = namespace_segment(directory_id);
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{namespace}-{}", hex::encode(bytes))
}

/// Derives a short, filesystem/URL-safe namespace segment from a directory id.
/// Not meant to be reversible or unique by itself — uniqueness comes from the
/// random suffix — just a debugging aid so a local id hints at its origin.
fn namespace_segment(directory_id: &str) -> String {
    let digest = {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(directory_id.as_bytes());
        hasher.finalize()
    };
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_across_calls_and_directories() {
        let a1 = new_update_client_resource_id("dir-a");
        let a2 = new_update_client_resource_id("dir-a");
        let b1 = new_update_client_resource_id("dir-b");
        assert_ne!(a1, a2);
        assert_ne!(a1, b1);
    }

    #[test]
    fn ids_never_embed_the_raw_remote_id() {
        let id = new_update_client_resource_id("dir-a");
        assert!(!id.contains("Organization/1"));
    }

    #[test]
    fn namespace_segment_is_stable_for_same_directory() {
        assert_eq!(namespace_segment("dir-a"), namespace_segment("dir-a"));
        assert_ne!(namespace_segment("dir-a"), namespace_segment("dir-b"));
    }
}
