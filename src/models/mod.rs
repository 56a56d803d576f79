//! Domain models shared across the registry, resource-map store, and pipelines.

pub mod directory;
pub mod provider;
pub mod resource_map;

pub use directory::{Directory, DirectoryOrigin, EligibilityPolicy};
pub use provider::{DirectoryProvider, ProviderDirectoryEntry, ProviderDirectoryLink};
pub use resource_map::{new_update_client_resource_id, ResourceKey, ResourceMap};

/// The fixed, ordered set of mCSD resource types (spec §4.3 "Required mCSD
/// resource types"). Processed in this order so referential dependencies
/// (e.g. `Location.partOf`, `HealthcareService.providedBy`) resolve on the
/// first pass whenever possible — not an invariant the pipeline depends on for
/// correctness (cyclic references are handled by reserve-then-fill, spec §9),
/// just an ordering that minimizes the number of "forward reference" cases.
pub const MCSD_RESOURCE_TYPES: &[&str] = &[
    "Organization",
    "Location",
    "Endpoint",
    "HealthcareService",
    "Practitioner",
    "PractitionerRole",
    "OrganizationAffiliation",
];
