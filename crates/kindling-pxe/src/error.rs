//! Error types for PXE configuration and image handling.

use std::path::PathBuf;
use thiserror::Error;

/// Error type for PXE operations.
#[derive(Debug, Error)]
pub enum PxeError {
    /// No boot configuration template exists anywhere on the search path,
    /// not even the generic fallback. This is a deployment error, not a
    /// per-client condition.
    #[error("no PXE template found in {search_path:?}")]
    NoTemplateFound { search_path: Vec<PathBuf> },

    /// Template rendering failed
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// The ephemeral images directory is missing or empty
    #[error("ephemeral images directory missing or empty: {root:?}; import boot images first")]
    EphemeralImagesNotFound { root: PathBuf },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for PXE operations.
pub type Result<T> = std::result::Result<T, PxeError>;
