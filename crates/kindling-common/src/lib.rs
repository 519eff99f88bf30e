//! Shared helpers for the kindling boot coordinator.
//!
//! Small, dependency-light pieces used across the lease, PXE, and TFTP
//! crates: MAC address normalization and hostname handling.

pub mod hostname;
pub mod mac;

pub use hostname::strip_domain;
pub use mac::{format_mac_hyphenated, normalize_mac, MacParseError};
