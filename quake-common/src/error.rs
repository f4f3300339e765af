//! Common error types for the quake pipeline

use thiserror::Error;

/// Common result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the pipeline crates
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Corruption detected between the normalized log and the unified output.
///
/// These indicate a bug or external-store corruption and abort the current
/// fusion run before any unified or crosswalk rows are written.
#[derive(Error, Debug)]
pub enum IntegrityError {
    /// The clustering window contained the same `event_uid` twice.
    #[error("duplicate event_uid in clustering window: {0}")]
    DuplicateUid(String),

    /// A crosswalk row read for identity seeding carries an `event_uid`
    /// that is not part of the current clustering window.
    #[error("crosswalk row references event_uid {0}, which is not present in the current window")]
    CrosswalkOrphan(String),
}
