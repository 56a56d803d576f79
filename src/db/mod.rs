//! Persistence layer: one store per component with a storage-independent
//! trait, backed by Postgres via `sqlx`.

pub mod directories;
pub mod providers;
pub mod resource_map;

pub use directories::{DirectoryRegistry, PostgresDirectoryRegistry};
pub use providers::{PostgresProviderStore, ProviderStore};
pub use resource_map::{PostgresResourceMapStore, ResourceMapStore};
