//! Error types for the mCSD update client
//!
//! One variant per row of the error taxonomy table (spec §7), plus the ambient
//! transport/database/config catch-alls. `ErrorKind` is the taxonomy label the
//! pipeline uses to decide whether a failure aborts the pass or is merely logged
//! and skipped.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("auth rejected by {0}")]
    AuthRejected(String),

    #[error("invalid resource: {0}")]
    ParseInvalidResource(String),

    #[error("malformed page: {0}")]
    MalformedPage(String),

    #[error("cross-origin reference: {0}")]
    CrossOriginReference(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("map conflict for {directory_id}/{resource_type}/{directory_resource_id}")]
    MapConflict {
        directory_id: String,
        resource_type: String,
        directory_resource_id: String,
    },

    #[error("pass deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("database unavailable: {0}")]
    DbUnavailable(String),

    #[error("directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The taxonomy label from spec §7 — used by the pipeline to classify a failure
/// as pass-aborting (structural) or per-entry (recoverable, skip and continue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientNetwork,
    AuthRejected,
    ParseInvalidResource,
    MalformedPage,
    CrossOriginReference,
    ValidationFailed,
    MapConflict,
    DeadlineExceeded,
    Cancelled,
    DbUnavailable,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TransientNetwork(_) | Error::Http(_) => ErrorKind::TransientNetwork,
            Error::AuthRejected(_) => ErrorKind::AuthRejected,
            Error::ParseInvalidResource(_) => ErrorKind::ParseInvalidResource,
            Error::MalformedPage(_) => ErrorKind::MalformedPage,
            Error::CrossOriginReference(_) => ErrorKind::CrossOriginReference,
            Error::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Error::MapConflict { .. } => ErrorKind::MapConflict,
            Error::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Database(_) | Error::DbUnavailable(_) => ErrorKind::DbUnavailable,
            Error::Config(_) | Error::DirectoryNotFound(_) | Error::Internal(_) | Error::Other(_) => {
                ErrorKind::Other
            }
        }
    }

    /// Whether this error, if it occurs mid-pass, must abort the whole pass and
    /// leave the watermark unchanged (spec §4.6 "Partial-failure semantics").
    ///
    /// Per-entry problems (an individual resource fails to parse or is rejected
    /// for a cross-origin reference, spec §7's table and the worked scenario in
    /// §8.2) are recoverable: they are logged, counted, and the pass continues.
    /// Only failures that mean the *page itself* couldn't be trusted — it didn't
    /// parse as a Bundle at all, or the transport/auth layer broke — abort.
    pub fn is_structural(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AuthRejected
                | ErrorKind::MalformedPage
                | ErrorKind::DeadlineExceeded
                | ErrorKind::DbUnavailable
        )
    }
}
