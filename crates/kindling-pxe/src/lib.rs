//! PXE boot support: path matching, configuration rendering, and boot
//! image installation.
//!
//! The pieces here are deliberately side-effect free or filesystem-only;
//! the TFTP serving layer composes them with the remote parameter
//! resolution service to answer boot requests.

pub mod config;
pub mod error;
pub mod install;
pub mod kernel_opts;
pub mod matcher;
pub mod paths;

pub use config::PxeConfigRenderer;
pub use error::{PxeError, Result};
pub use kernel_opts::{EphemeralImages, KernelParameters, ReleaseFamily};
pub use matcher::{match_config_path, ConfigFileMatch};
