//! Store error types.

use thiserror::Error;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to open or connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// A query failed.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// An operation referenced a subtarget that has never been ingested.
    #[error("unknown subtarget {0}")]
    UnknownSubtarget(String),
}
