//! TFTP serving for PXE network boot.
//!
//! Implements RFC 1350 reads with option negotiation (RFC 2347/2348/2349)
//! on tokio, behind a pluggable [`Backend`]. The shipped [`BootBackend`]
//! is partially dynamic: bootloader and PXELINUX configuration requests
//! are answered from the parameter resolution service and rendered
//! templates, everything else from static files under the TFTP root.

pub mod backend;
pub mod error;
pub mod packet;
pub mod resolve;
pub mod server;
pub mod session;

pub use backend::{BcdPatcher, BootBackend};
pub use error::{BackendError, Result, TftpError};
pub use packet::{ErrorCode, TftpPacket, TransferMode, TransferOptions};
pub use resolve::{HttpResolver, ParamsResolver};
pub use server::{Backend, TftpEvent, TftpServer};
pub use session::{ClientSession, SessionMap};
