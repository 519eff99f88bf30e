//! Kernel command-line composition for PXE boot configurations.
//!
//! The resolution service hands back a [`KernelParameters`] record per
//! boot request; this module turns it into the argument string passed to
//! the booting kernel. Two release families exist: the CentOS 6 legacy
//! family boots with a kickstart line, everything else gets the
//! installer/ephemeral line.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PxeError, Result};

/// iSCSI target name prefix for ephemeral (commissioning) boots.
pub const ISCSI_TARGET_NAME_PREFIX: &str = "iqn.2004-05.net.kindling:boot";

/// Boot parameters resolved by the remote parameter resolution service.
///
/// Treated as an externally-sourced record: only the declared fields are
/// read, unknown fields in the response are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelParameters {
    /// Machine architecture, e.g. "amd64"
    pub arch: String,
    /// Machine sub-architecture, or "generic" if there is none
    pub subarch: String,
    /// OS release, e.g. "precise" or "centos6"
    pub release: String,
    /// Boot purpose, e.g. "install", "commissioning", "local"
    pub purpose: String,
    /// Machine hostname
    pub hostname: String,
    /// Machine domain name, if any
    #[serde(default)]
    pub domain: Option<String>,
    /// URL from which a preseed can be obtained
    pub preseed_url: String,
    /// Host/IP to which syslog can be streamed
    pub log_host: String,
    /// Host/IP on which ephemeral filesystems are hosted
    pub fs_host: String,
    /// Extra options appended verbatim to the kernel command line
    #[serde(default)]
    pub extra_opts: Option<String>,
}

/// Release families with distinct boot behavior.
///
/// A closed enum rather than string branching, so adding a family is a
/// compile-time-checked change everywhere it is dispatched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseFamily {
    /// CentOS 6: vmlinuz/initrd.img images, kickstart command line
    Centos6,
    /// Everything else: linux/initrd.gz images, installer command line
    Default,
}

/// Kernel and initrd filenames within an image directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootFiles {
    pub kernel: &'static str,
    pub initrd: &'static str,
}

impl ReleaseFamily {
    /// Classify a release name.
    pub fn of(release: &str) -> Self {
        match release {
            "centos6" => ReleaseFamily::Centos6,
            _ => ReleaseFamily::Default,
        }
    }

    /// Image filenames for this family.
    pub fn boot_files(self) -> BootFiles {
        match self {
            ReleaseFamily::Centos6 => BootFiles {
                kernel: "vmlinuz",
                initrd: "initrd.img",
            },
            ReleaseFamily::Default => BootFiles {
                kernel: "linux",
                initrd: "initrd.gz",
            },
        }
    }

    /// Compose the kernel command line for this family.
    pub fn compose_command_line(
        self,
        params: &KernelParameters,
        ephemeral: &EphemeralImages,
    ) -> Result<String> {
        match self {
            ReleaseFamily::Centos6 => Ok(compose_kernel_command_line_centos(params)),
            ReleaseFamily::Default => compose_kernel_command_line(params, ephemeral),
        }
    }
}

/// Locator for imported ephemeral (commissioning) images.
///
/// Import runs drop each image under
/// `<images_dir>/<release>/ephemeral/<arch>/<serial>/`, where `serial` is
/// a date stamp; the newest serial carries an `info` key file naming the
/// iSCSI target.
#[derive(Debug, Clone)]
pub struct EphemeralImages {
    images_dir: PathBuf,
}

impl EphemeralImages {
    pub fn new(images_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
        }
    }

    /// Name of the most recent ephemeral image for `release`/`arch`, as
    /// recorded in its `info` file.
    pub fn newest_image_name(&self, release: &str, arch: &str) -> Result<String> {
        let root = self.images_dir.join(release).join("ephemeral").join(arch);
        let newest = last_directory(&root)?;
        let info = fs::read_to_string(newest.join("info"))?;
        parse_key_value(&info, '=')
            .get("name")
            .cloned()
            .ok_or(PxeError::EphemeralImagesNotFound { root })
    }
}

/// Return the lexically last subdirectory of `root`.
///
/// Serial directories are date-stamped (20120424, ...) so sorting by name
/// yields the most recent import.
fn last_directory(root: &Path) -> Result<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)
        .map_err(|_| PxeError::EphemeralImagesNotFound {
            root: root.to_path_buf(),
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs.pop().ok_or(PxeError::EphemeralImagesNotFound {
        root: root.to_path_buf(),
    })
}

fn parse_key_value(content: &str, separator: char) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|line| line.split_once(separator))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// Prefix an iSCSI target name with the standard target-name prefix.
pub fn prefix_target_name(name: &str) -> String {
    format!("{ISCSI_TARGET_NAME_PREFIX}:{name}")
}

fn compose_preseed_opt(preseed_url: &str) -> String {
    format!("auto url={preseed_url}")
}

fn compose_kickstart_opt(preseed_url: &str) -> String {
    format!("ks={preseed_url}")
}

fn compose_locale_opt() -> String {
    "locale=en_US".to_string()
}

fn compose_logging_opts(log_host: &str) -> Vec<String> {
    vec![format!("log_host={log_host}"), format!("log_port={}", 514)]
}

fn compose_hostname_opts(params: &KernelParameters) -> Vec<String> {
    let mut options = vec![format!("hostname={}", params.hostname)];
    if let Some(domain) = &params.domain {
        options.push(format!("domain={domain}"));
    }
    options
}

/// The purpose-specific kernel options.
fn compose_purpose_opts(
    params: &KernelParameters,
    ephemeral: &EphemeralImages,
) -> Result<Vec<String>> {
    if params.purpose == "commissioning" || params.purpose == "xinstall" {
        // Parameters read by the ephemeral environment.
        let tname = prefix_target_name(
            &ephemeral.newest_image_name(&params.release, &params.arch)?,
        );
        Ok(vec![
            // Read by the open-iscsi initramfs code.
            format!("iscsi_target_name={tname}"),
            format!("iscsi_target_ip={}", params.fs_host),
            "iscsi_target_port=3260".to_string(),
            format!("iscsi_initiator={}", params.hostname),
            // Read by the initramfs network configuration.
            format!("ip=::::{}:BOOTIF", params.hostname),
            // kernel / udev name iscsi devices with this path
            format!(
                "ro root=/dev/disk/by-path/ip-{}:{}-iscsi-{}-lun-1",
                params.fs_host, "3260", tname
            ),
            "overlayroot=tmpfs".to_string(),
            format!("cloud-config-url={}", params.preseed_url),
        ])
    } else {
        // Options used by the Debian Installer.
        let mut options = vec![
            "netcfg/choose_interface=auto".to_string(),
            // Text installer, critical messages only.
            "text priority=critical".to_string(),
            compose_preseed_opt(&params.preseed_url),
            compose_locale_opt(),
        ];
        options.extend(compose_hostname_opts(params));
        Ok(options)
    }
}

/// Architecture-specific options.
fn compose_arch_opts(params: &KernelParameters) -> Vec<String> {
    if (params.arch.as_str(), params.subarch.as_str()) == ("armhf", "highbank") {
        vec!["console=ttyAMA0".to_string()]
    } else {
        // On Intel there are no working sane console= defaults.
        Vec::new()
    }
}

/// Generate the kernel options line for the default release family.
pub fn compose_kernel_command_line(
    params: &KernelParameters,
    ephemeral: &EphemeralImages,
) -> Result<String> {
    let mut options = Vec::new();
    // nomodeset prevents video mode switching.
    options.push("nomodeset".to_string());
    options.extend(compose_purpose_opts(params, ephemeral)?);
    options.extend(compose_logging_opts(&params.log_host));
    options.extend(compose_arch_opts(params));
    if let Some(extra) = &params.extra_opts {
        if !extra.is_empty() {
            options.push(extra.clone());
        }
    }
    Ok(options.join(" "))
}

/// Generate the kernel options line for the CentOS 6 family.
pub fn compose_kernel_command_line_centos(params: &KernelParameters) -> String {
    [
        "vga=normal".to_string(),
        "ip=dhcp".to_string(),
        compose_kickstart_opt(&params.preseed_url),
    ]
    .join(" ")
}
