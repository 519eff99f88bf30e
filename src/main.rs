use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

mod cmd;

use cmd::install_image::{InstallBootloaderArgs, InstallImageArgs, ListImagesArgs};
use cmd::serve::ServeArgs;

#[derive(Parser, Debug)]
#[command(author, version, about = "Kindling network boot coordinator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the TFTP boot server.
    Serve(ServeArgs),
    /// Installs a netboot image directory into the TFTP hierarchy.
    InstallImage(InstallImageArgs),
    /// Installs a bootloader file under the TFTP root.
    InstallBootloader(InstallBootloaderArgs),
    /// Lists the boot images available under the TFTP root.
    ListImages(ListImagesArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let default_directive = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve(args) => cmd::serve::run(args).await,
        Commands::InstallImage(args) => cmd::install_image::run(args),
        Commands::InstallBootloader(args) => cmd::install_image::run_bootloader(args),
        Commands::ListImages(args) => cmd::install_image::run_list(args),
    }
}
