//! The partially dynamic read backend.
//!
//! Most TFTP requests are plain static files under the TFTP root. Two
//! kinds are generated on the fly instead: the bootloader request, which
//! resolves the machine's boot parameters and decides which loader it
//! gets, and PXELINUX configuration file requests, which are rendered
//! from templates using those parameters. The client cannot tell the
//! difference; everything arrives as ordinary file contents.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use kindling_pxe::matcher::{match_config_path, ConfigFileMatch};
use kindling_pxe::paths::{compose_bootloader_path, compose_image_path, locate_tftp_path};
use kindling_pxe::PxeConfigRenderer;

use crate::error::BackendError;
use crate::resolve::ParamsResolver;
use crate::server::Backend;
use crate::session::{ClientSession, SessionMap};

/// Bootloader served to machines installing a Windows release.
const WINDOWS_BOOTLOADER: &str = "pxeboot.0";

/// Path of the BCD store a Windows loader requests, in normalized form.
const BCD_PATH: &str = "boot/bcd";

/// Patches a Boot Configuration Data store with per-machine load options.
///
/// The BCD binary format is handled elsewhere; this backend only composes
/// the load-options string and hands it over.
#[async_trait]
pub trait BcdPatcher: Send + Sync {
    async fn patch(&self, load_options: &str) -> std::io::Result<Bytes>;
}

/// The boot backend behind the TFTP server.
pub struct BootBackend {
    root: PathBuf,
    cluster_uuid: String,
    windows_remote_path: String,
    resolver: Arc<dyn ParamsResolver>,
    renderer: PxeConfigRenderer,
    sessions: SessionMap,
    bcd_patcher: Option<Arc<dyn BcdPatcher>>,
}

impl BootBackend {
    pub fn new(
        root: impl Into<PathBuf>,
        cluster_uuid: impl Into<String>,
        windows_remote_path: impl Into<String>,
        resolver: Arc<dyn ParamsResolver>,
        renderer: PxeConfigRenderer,
        sessions: SessionMap,
    ) -> Self {
        Self {
            root: root.into(),
            cluster_uuid: cluster_uuid.into(),
            windows_remote_path: windows_remote_path.into(),
            resolver,
            renderer,
            sessions,
            bcd_patcher: None,
        }
    }

    pub fn with_bcd_patcher(mut self, patcher: Arc<dyn BcdPatcher>) -> Self {
        self.bcd_patcher = Some(patcher);
        self
    }

    /// Query parameters sent on every resolution request.
    fn base_query(&self, local: SocketAddr, remote: SocketAddr) -> Vec<(String, String)> {
        vec![
            ("cluster_uuid".to_string(), self.cluster_uuid.clone()),
            ("local".to_string(), local.ip().to_string()),
            ("remote".to_string(), remote.ip().to_string()),
        ]
    }

    async fn read_static(&self, requested: &str, base: &Path) -> Result<Bytes, BackendError> {
        // Requests are untrusted network input; nothing may escape the
        // base directory.
        let relative = requested.trim_start_matches('/');
        let escapes = Path::new(relative)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if escapes {
            return Err(BackendError::NotFound(requested.to_string()));
        }

        let path = locate_tftp_path(Some(relative), base);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::NotFound(requested.to_string()))
            }
            Err(source) => Err(BackendError::Io {
                path: requested.to_string(),
                source,
            }),
        }
    }

    /// Serve the bootloader request, the first thing firmware fetches.
    ///
    /// This is where the machine's fate is decided: boot parameters are
    /// resolved once and remembered in the session for the rest of the
    /// boot.
    async fn open_bootloader(
        &self,
        file_name: &str,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<Bytes, BackendError> {
        let params = match self.resolver.resolve(&self.base_query(local, remote)).await? {
            Some(params) => params,
            None => {
                // The service has no boot configuration for this machine;
                // the loader it asked for does not exist for it.
                debug!(client = %remote.ip(), "no parameters for machine");
                return Err(BackendError::NotFound(file_name.to_string()));
            }
        };

        if params.purpose == "local" {
            // Missing bootloader makes the firmware fall through to the
            // local disk, which is exactly what "local" asks for.
            debug!(client = %remote.ip(), "machine boots locally");
            return Err(BackendError::NotFound(file_name.to_string()));
        }

        if params.release.starts_with("win") {
            let base = self.root.join(compose_image_path(
                &params.arch,
                &params.subarch,
                &params.release,
                "install",
            ));
            let data = self.read_static(WINDOWS_BOOTLOADER, &base).await?;
            info!(client = %remote.ip(), release = %params.release, "Windows boot session");
            self.sessions
                .insert(
                    remote.ip(),
                    ClientSession {
                        params,
                        is_windows: true,
                        base,
                    },
                )
                .await;
            return Ok(data);
        }

        let data = self.read_static(compose_bootloader_path(), &self.root).await?;
        self.sessions
            .insert(
                remote.ip(),
                ClientSession {
                    params,
                    is_windows: false,
                    base: self.root.clone(),
                },
            )
            .await;
        Ok(data)
    }

    /// Serve a Windows BCD request by patching per-machine load options
    /// into a BCD store.
    async fn open_bcd(
        &self,
        file_name: &str,
        session: &ClientSession,
    ) -> Result<Bytes, BackendError> {
        let patcher = match &self.bcd_patcher {
            Some(patcher) => patcher,
            None => return Err(BackendError::NotFound(file_name.to_string())),
        };
        let load_options = format!(
            "{};{}\\source;{}",
            self.windows_remote_path,
            session.params.release,
            session.params.preseed_url.replace('/', "\\"),
        );
        patcher
            .patch(&load_options)
            .await
            .map_err(|source| BackendError::Io {
                path: file_name.to_string(),
                source,
            })
    }

    /// Render a PXELINUX configuration file for a matched request.
    async fn open_config(
        &self,
        file_name: &str,
        config: ConfigFileMatch,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<Bytes, BackendError> {
        let mut query = self.base_query(local, remote);
        if let Some(mac) = config.mac {
            query.push(("mac".to_string(), mac));
        }
        if let Some(arch) = config.arch {
            query.push(("arch".to_string(), arch));
        }
        if let Some(subarch) = config.subarch {
            query.push(("subarch".to_string(), subarch));
        }

        let params = match self.resolver.resolve(&query).await? {
            Some(params) => params,
            // No configuration for this machine; report the file the
            // client actually asked for as missing.
            None => return Err(BackendError::NotFound(file_name.to_string())),
        };

        let extra: BTreeMap<String, String> = query.into_iter().collect();
        let rendered = self.renderer.render(&params, &extra)?;
        Ok(Bytes::from(rendered))
    }
}

#[async_trait]
impl Backend for BootBackend {
    async fn open(
        &self,
        file_name: &str,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<Bytes, BackendError> {
        if file_name.trim_start_matches('/') == compose_bootloader_path() {
            return self.open_bootloader(file_name, local, remote).await;
        }

        let session = self.sessions.get(&remote.ip()).await;

        // Windows loaders request paths with backslashes and mixed case.
        let normalized;
        let file_name = match &session {
            Some(session) if session.is_windows => {
                normalized = file_name.to_lowercase().replace('\\', "/");
                normalized.as_str()
            }
            _ => file_name,
        };

        if let Some(session) = &session {
            if session.is_windows && file_name.trim_start_matches('/') == BCD_PATH {
                return self.open_bcd(file_name, session).await;
            }
        }

        match match_config_path(file_name) {
            Some(config) => self.open_config(file_name, config, local, remote).await,
            None => {
                let base = self.sessions.base_for(&remote.ip(), &self.root).await;
                self.read_static(file_name, &base).await
            }
        }
    }
}
