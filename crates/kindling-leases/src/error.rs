//! Error types for lease reconciliation.

use thiserror::Error;

/// Error type for lease store operations.
///
/// Any failure aborts the whole reconciliation call; the transaction rolls
/// back and no partial state is committed. Retry policy belongs to the
/// ingestion task that invoked us.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for lease store operations.
pub type Result<T> = std::result::Result<T, LeaseError>;
