//! Error types for the TFTP server and its read backend.

use std::net::SocketAddr;
use thiserror::Error;

/// Error type for TFTP protocol operations.
#[derive(Debug, Error)]
pub enum TftpError {
    /// Failed to bind the listening socket
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Malformed TFTP packet
    #[error("invalid TFTP packet: {0}")]
    InvalidPacket(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Client stopped acknowledging
    #[error("transfer timeout for {file_name}")]
    Timeout { file_name: String },
}

/// Result type for TFTP protocol operations.
pub type Result<T> = std::result::Result<T, TftpError>;

/// Errors from the pluggable read backend.
///
/// Only `NotFound` reaches the client as a TFTP error packet; PXE
/// firmware treats it as "try the next thing" and may fall through to
/// local boot. Everything else aborts the read without a response so the
/// client retries the transfer later.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The requested file does not exist
    #[error("file not found: {0}")]
    NotFound(String),

    /// The parameter resolution service could not be reached or answered
    /// with an HTTP error
    #[error("parameter resolution failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// The boot configuration could not be produced
    #[error("boot configuration failed: {0}")]
    Config(#[from] kindling_pxe::PxeError),

    /// I/O error reading a static file
    #[error("error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
