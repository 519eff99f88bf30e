//! The `serve` subcommand: the TFTP boot server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::Result;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use url::Url;

use kindling_pxe::{EphemeralImages, PxeConfigRenderer};
use kindling_tftp::{BootBackend, HttpResolver, SessionMap, TftpServer};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on. Give a concrete interface address rather
    /// than 0.0.0.0: it is reported to the generator service as the
    /// `local` endpoint of every boot request
    #[arg(long, default_value = "0.0.0.0:69")]
    pub listen: SocketAddr,

    /// Root of the TFTP file hierarchy
    #[arg(long, default_value = "/var/lib/kindling/tftp")]
    pub tftproot: PathBuf,

    /// URL of the boot parameter generation service
    #[arg(long)]
    pub generator_url: Url,

    /// UUID identifying this cluster controller to the generator
    #[arg(long)]
    pub cluster_uuid: String,

    /// Directory searched for PXE configuration templates; repeat to
    /// search several in order
    #[arg(long = "template-dir", default_value = "/usr/share/kindling/templates/pxe")]
    pub template_dirs: Vec<PathBuf>,

    /// Directory holding imported ephemeral images
    #[arg(long, default_value = "/var/lib/kindling/ephemeral")]
    pub images_dir: PathBuf,

    /// Windows remote installation share, composed into BCD load options
    #[arg(long, default_value = "")]
    pub windows_remote_path: String,
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let renderer = PxeConfigRenderer::new(
        args.template_dirs,
        EphemeralImages::new(args.images_dir),
    );
    let resolver = Arc::new(HttpResolver::new(args.generator_url));
    let backend = BootBackend::new(
        args.tftproot,
        args.cluster_uuid,
        args.windows_remote_path,
        resolver,
        renderer,
        SessionMap::new(),
    );

    let server = TftpServer::bind(args.listen, Arc::new(backend)).await?;
    info!(addr = %server.local_addr(), "serving boot requests");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("interrupt received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await?;
    Ok(())
}
