//! MAC address normalization.
//!
//! MAC addresses arrive in several shapes: colon-separated from DHCP lease
//! reports, hyphen-separated from PXELINUX config-file requests (IEEE 802
//! form), and in arbitrary case. Everything downstream works on the
//! lowercase colon-separated form; the PXE path layer converts to hyphens
//! at the protocol boundary.

use thiserror::Error;

/// Error parsing a MAC address string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacParseError {
    #[error("expected 6 octets, got {0}")]
    WrongOctetCount(usize),

    #[error("invalid octet {0:?}")]
    InvalidOctet(String),
}

/// Normalize a MAC address to lowercase colon-separated form.
///
/// Accepts colon- or hyphen-separated octets in any case.
pub fn normalize_mac(mac: &str) -> Result<String, MacParseError> {
    let octets: Vec<&str> = mac.split(|c| c == ':' || c == '-').collect();
    if octets.len() != 6 {
        return Err(MacParseError::WrongOctetCount(octets.len()));
    }
    for octet in &octets {
        if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MacParseError::InvalidOctet((*octet).to_string()));
        }
    }
    Ok(octets.join(":").to_ascii_lowercase())
}

/// Format a MAC address in the IEEE 802 hyphen-separated form that
/// PXELINUX uses when requesting its configuration file.
pub fn format_mac_hyphenated(mac: &str) -> Result<String, MacParseError> {
    Ok(normalize_mac(mac)?.replace(':', "-"))
}
