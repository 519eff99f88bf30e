//! Matching of PXELINUX configuration file paths.
//!
//! PXELINUX looks for its configuration under `pxelinux.cfg/`, first by
//! client MAC address (IEEE 802 hyphen-separated form, prefixed with the
//! ARP hardware type), then through a series of fallbacks ending in
//! `default`. Only those exact shapes are generated on the fly; every
//! other request must fall through to static file serving.
//!
//! Matching has to be narrow: PXELINUX probes many similar-looking paths
//! during one boot attempt, and handing any of those to the parameter
//! resolution service by mistake halts the machine's boot.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::paths::ARP_HTYPE_ETHERNET;

static RE_CONFIG_FILE: Lazy<Regex> = Lazy::new(|| {
    // We assume the ARP HTYPE that PXELINUX sends is always Ethernet.
    let pattern = format!(
        r"(?x)
        # Optional leading slash(es).
        ^/*
        pxelinux[.]cfg    # PXELINUX expects this.
        /
        (?: # either a MAC
            {htype:02x}    # ARP HTYPE.
            -
            (?P<mac>[0-9a-f]{{2}}(?:-[0-9a-f]{{2}}){{5}})
        | # or 'default'
            default
              (?: # perhaps with specified arch, with a separator of either
                  # '-' or '.', since both are unambiguous
                [.-](?P<arch>\w+)
                (?:-(?P<subarch>\w+))? # optional subarch
              )?
        )
        $",
        htype = ARP_HTYPE_ETHERNET
    );
    Regex::new(&pattern).unwrap()
});

/// Groups extracted from a matched PXELINUX configuration path.
///
/// A MAC match carries no architecture hints; a `default` match carries
/// no MAC. Absent groups stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFileMatch {
    /// Client MAC address, hyphen-separated and lowercase.
    pub mac: Option<String>,
    /// Requested architecture, from `default.<arch>`.
    pub arch: Option<String>,
    /// Requested sub-architecture, from `default.<arch>-<subarch>`.
    pub subarch: Option<String>,
}

/// Parse a requested TFTP path as a PXELINUX configuration file path.
///
/// Returns `None` for anything that isn't exactly a config-file request;
/// that is a normal outcome driving static-file fallback, not an error.
pub fn match_config_path(path: &str) -> Option<ConfigFileMatch> {
    let captures = RE_CONFIG_FILE.captures(path)?;
    Some(ConfigFileMatch {
        mac: captures.name("mac").map(|m| m.as_str().to_string()),
        arch: captures.name("arch").map(|m| m.as_str().to_string()),
        subarch: captures.name("subarch").map(|m| m.as_str().to_string()),
    })
}
