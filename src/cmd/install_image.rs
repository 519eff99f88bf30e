//! Image management subcommands: `install-image`, `install-bootloader`,
//! and `list-images`.

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::Result;

use kindling_pxe::install::{install_bootloader, install_image};
use kindling_pxe::paths::{compose_bootloader_path, compose_image_path, list_boot_images};

#[derive(Args, Debug)]
pub struct InstallImageArgs {
    /// Directory containing the image to install; consumed on success
    pub image: PathBuf,

    /// Root of the TFTP file hierarchy
    #[arg(long, default_value = "/var/lib/kindling/tftp")]
    pub tftproot: PathBuf,

    /// Main machine architecture the image boots
    #[arg(long)]
    pub arch: String,

    /// Machine sub-architecture the image boots
    #[arg(long, default_value = "generic")]
    pub subarch: String,

    /// OS release the image boots
    #[arg(long)]
    pub release: String,

    /// Boot purpose of the image
    #[arg(long)]
    pub purpose: String,

    /// Additional purpose served by the same image through a symlink
    #[arg(long)]
    pub alternate_purpose: Option<String>,
}

pub fn run(args: InstallImageArgs) -> Result<()> {
    install_image(
        &args.tftproot,
        &args.image,
        &args.arch,
        &args.subarch,
        &args.release,
        &args.purpose,
        args.alternate_purpose.as_deref(),
    )?;
    Ok(())
}

#[derive(Args, Debug)]
pub struct InstallBootloaderArgs {
    /// The bootloader file to install
    pub loader: PathBuf,

    /// Root of the TFTP file hierarchy
    #[arg(long, default_value = "/var/lib/kindling/tftp")]
    pub tftproot: PathBuf,
}

pub fn run_bootloader(args: InstallBootloaderArgs) -> Result<()> {
    let dest = args.tftproot.join(compose_bootloader_path());
    install_bootloader(&args.loader, &dest)?;
    Ok(())
}

#[derive(Args, Debug)]
pub struct ListImagesArgs {
    /// Root of the TFTP file hierarchy
    #[arg(long, default_value = "/var/lib/kindling/tftp")]
    pub tftproot: PathBuf,
}

pub fn run_list(args: ListImagesArgs) -> Result<()> {
    for image in list_boot_images(&args.tftproot)? {
        println!(
            "{}",
            compose_image_path(
                &image.architecture,
                &image.subarchitecture,
                &image.release,
                &image.purpose,
            )
        );
    }
    Ok(())
}
