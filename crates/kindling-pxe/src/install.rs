//! Installation of boot images and bootloaders into the TFTP hierarchy.
//!
//! Installs must never leave a half-written image where the TFTP server
//! can see it. New content is staged next to the destination under a
//! `.new` suffix and swapped in with renames; an identical image already
//! in place is left untouched so concurrent transfers keep working.

use std::fs;
use std::io::Read;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::paths::compose_image_path;

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// Compose and create the destination directory for a boot image.
///
/// Returns `<tftproot>/<arch>/<subarch>/<release>`; the image itself goes
/// into a `<purpose>` subdirectory of it.
pub fn make_destination(
    tftproot: &Path,
    arch: &str,
    subarch: &str,
    release: &str,
) -> Result<PathBuf> {
    let dest = tftproot.join(arch).join(subarch).join(release);
    fs::create_dir_all(&dest)?;
    Ok(dest)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut content = Vec::new();
    fs::File::open(path)?.read_to_end(&mut content)?;
    Ok(content)
}

/// Relative paths of all entries under `root`, sorted.
fn list_tree(root: &Path) -> Result<Vec<PathBuf>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            out.push(path.strip_prefix(root).unwrap_or(&path).to_path_buf());
            if path.is_dir() && !path.is_symlink() {
                walk(root, &path, out)?;
            }
        }
        Ok(())
    }
    let mut entries = Vec::new();
    walk(root, root, &mut entries)?;
    entries.sort();
    Ok(entries)
}

/// Whether `old` is a real directory with the same entries and file
/// contents as `new`.
///
/// A missing or symlinked `old` is never identical; a symlink is an
/// alternate-purpose alias and must be replaced by a real install, not
/// kept.
pub fn are_identical_dirs(old: &Path, new: &Path) -> Result<bool> {
    if !old.is_dir() || old.is_symlink() {
        return Ok(false);
    }
    let old_entries = list_tree(old)?;
    if old_entries != list_tree(new)? {
        return Ok(false);
    }
    for relative in old_entries {
        let old_path = old.join(&relative);
        let new_path = new.join(&relative);
        if old_path.is_dir() != new_path.is_dir() {
            return Ok(false);
        }
        if old_path.is_file() && read_file(&old_path)? != read_file(&new_path)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Normalize ownership-independent permissions: directories become 0755,
/// files 0644. Images arrive from downloads and tarballs with arbitrary
/// modes; the TFTP server only needs to read them.
fn normalize_permissions(root: &Path) -> Result<()> {
    fs::set_permissions(root, fs::Permissions::from_mode(DIR_MODE))?;
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() {
            normalize_permissions(&path)?;
        } else {
            fs::set_permissions(&path, fs::Permissions::from_mode(FILE_MODE))?;
        }
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    if path.is_symlink() || path.is_file() {
        fs::remove_file(path)?;
    } else if path.is_dir() {
        fs::remove_dir_all(path)?;
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Install the directory `source` as `dest`, replacing any previous
/// content.
///
/// The swap is two renames: the previous image moves aside to `.old`, the
/// staged copy moves in from `.new`. Stale `.new`/`.old` leftovers from
/// an interrupted earlier run are cleaned up first.
pub fn install_dir(source: &Path, dest: &Path) -> Result<()> {
    let staging = with_suffix(dest, ".new");
    let previous = with_suffix(dest, ".old");
    remove_if_present(&staging)?;
    remove_if_present(&previous)?;

    copy_tree(source, &staging)?;
    normalize_permissions(&staging)?;

    if dest.exists() || dest.is_symlink() {
        fs::rename(dest, &previous)?;
    }
    fs::rename(&staging, dest)?;
    remove_if_present(&previous)?;
    Ok(())
}

/// Point `link` at `target_name`, a sibling entry in the same directory.
///
/// A link already pointing at the right target is left untouched. A
/// wrong entry is replaced with the same rename discipline as images:
/// the new link is staged under `.new` and renamed in, so there is never
/// a moment with nothing at `link`.
pub fn install_symlink(target_name: &str, link: &Path) -> Result<()> {
    if let Ok(existing) = fs::read_link(link) {
        if existing == Path::new(target_name) {
            return Ok(());
        }
    }

    let staging = with_suffix(link, ".new");
    let previous = with_suffix(link, ".old");
    remove_if_present(&staging)?;
    remove_if_present(&previous)?;
    symlink(target_name, &staging)?;

    // rename() replaces a symlink or file in place, but not a directory;
    // a real directory moves aside first.
    if link.is_dir() && !link.is_symlink() {
        fs::rename(link, &previous)?;
    }
    fs::rename(&staging, link)?;
    remove_if_present(&previous)?;
    Ok(())
}

/// Install a boot image directory into the TFTP hierarchy.
///
/// If an identical image is already installed nothing is replaced. Either
/// way the source directory is removed afterwards; failure to remove it
/// is logged and ignored, the install itself has already succeeded.
pub fn install_image(
    tftproot: &Path,
    image_dir: &Path,
    arch: &str,
    subarch: &str,
    release: &str,
    purpose: &str,
    alternate_purpose: Option<&str>,
) -> Result<()> {
    let dest = make_destination(tftproot, arch, subarch, release)?.join(purpose);
    if are_identical_dirs(&dest, image_dir)? {
        debug!(
            image = %compose_image_path(arch, subarch, release, purpose),
            "image unchanged, not replacing"
        );
    } else {
        install_dir(image_dir, &dest)?;
        info!(
            image = %compose_image_path(arch, subarch, release, purpose),
            "boot image installed"
        );
    }

    if let Some(alternate) = alternate_purpose {
        // A sibling link so one image serves two purposes, e.g. xinstall
        // reusing the commissioning image.
        let link = dest.with_file_name(alternate);
        install_symlink(purpose, &link)?;
    }

    if let Err(error) = fs::remove_dir_all(image_dir) {
        warn!(source = %image_dir.display(), %error, "could not remove image source");
    }
    Ok(())
}

/// Install a single bootloader file under the TFTP root.
///
/// Same staged-rename discipline as images: if the installed copy already
/// matches byte for byte it is left alone.
pub fn install_bootloader(source: &Path, dest: &Path) -> Result<()> {
    if dest.is_file() && read_file(dest)? == read_file(source)? {
        debug!(bootloader = %dest.display(), "bootloader unchanged, not replacing");
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let staging = with_suffix(dest, ".new");
    remove_if_present(&staging)?;
    fs::copy(source, &staging)?;
    fs::set_permissions(&staging, fs::Permissions::from_mode(FILE_MODE))?;
    fs::rename(&staging, dest)?;
    info!(bootloader = %dest.display(), "bootloader installed");
    Ok(())
}
