//! TFTP path layout for PXE files.
//!
//! Paths composed here are TFTP protocol paths, always forward-slash
//! separated, relative to the TFTP root as clients on the network see
//! them. `locate_tftp_path` maps them back to the local filesystem.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use kindling_common::{format_mac_hyphenated, MacParseError};

/// The ARP hardware type for Ethernet. PXELINUX prefixes MAC-based
/// config-file lookups with this byte in two-digit hex.
pub const ARP_HTYPE_ETHERNET: u8 = 1;

/// The TFTP path for the PXE pre-boot loader.
///
/// All Intel-like architectures use `pxelinux.0`. Other architectures
/// simulate PXELINUX and don't actually load it, but use its path to
/// figure out where configuration files live.
pub fn compose_bootloader_path() -> &'static str {
    "pxelinux.0"
}

/// The TFTP path for a machine's PXE configuration file.
///
/// `mac` may be in colon- or hyphen-separated form; the composed path
/// uses the IEEE 802 hyphen-separated form that PXELINUX requests.
pub fn compose_config_path(mac: &str) -> Result<String, MacParseError> {
    Ok(format!(
        "pxelinux.cfg/{ARP_HTYPE_ETHERNET:02x}-{}",
        format_mac_hyphenated(mac)?
    ))
}

/// The TFTP path for a PXE kernel/initrd image directory.
pub fn compose_image_path(arch: &str, subarch: &str, release: &str, purpose: &str) -> String {
    [arch, subarch, release, purpose].join("/")
}

/// The local filesystem path backing TFTP path `path`.
///
/// Pass `None` to get the root of the TFTP hierarchy.
pub fn locate_tftp_path(path: Option<&str>, tftproot: &Path) -> PathBuf {
    match path {
        None => tftproot.to_path_buf(),
        Some(path) => tftproot.join(path.trim_start_matches('/')),
    }
}

/// A boot image available under the TFTP root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BootImage {
    pub architecture: String,
    pub subarchitecture: String,
    pub release: String,
    pub purpose: String,
}

/// Non-hidden subdirectory names of `directory`.
fn list_subdirs(directory: &Path) -> io::Result<Vec<String>> {
    let mut subdirs = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with('.') && entry.path().is_dir() {
            subdirs.push(name);
        }
    }
    subdirs.sort();
    Ok(subdirs)
}

/// List the boot images available under `tftproot`.
///
/// The directory levels under the root represent architecture,
/// sub-architecture, release, and purpose; any directory that doesn't
/// extend that deep isn't a boot image.
pub fn list_boot_images(tftproot: &Path) -> io::Result<Vec<BootImage>> {
    let mut images = Vec::new();
    for arch in list_subdirs(tftproot)? {
        let arch_dir = tftproot.join(&arch);
        for subarch in list_subdirs(&arch_dir)? {
            let subarch_dir = arch_dir.join(&subarch);
            for release in list_subdirs(&subarch_dir)? {
                let release_dir = subarch_dir.join(&release);
                for purpose in list_subdirs(&release_dir)? {
                    images.push(BootImage {
                        architecture: arch.clone(),
                        subarchitecture: subarch.clone(),
                        release: release.clone(),
                        purpose,
                    });
                }
            }
        }
    }
    Ok(images)
}
