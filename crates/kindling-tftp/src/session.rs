//! Per-client boot session state.
//!
//! A session is created when a machine fetches its bootloader and is
//! consulted for the rest of that machine's transfers. Sessions are keyed
//! by the client's IP address only; TFTP clients use a fresh ephemeral
//! port per transfer, so the port carries no identity. Sessions are never
//! expired: a machine that boots again simply overwrites its entry, and
//! the map is bounded by the size of the managed network.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use kindling_pxe::KernelParameters;

/// What we learned about a client when it fetched its bootloader.
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Resolved boot parameters for the machine
    pub params: KernelParameters,
    /// Whether the machine is booting a Windows release
    pub is_windows: bool,
    /// Directory its subsequent static file requests resolve against
    pub base: PathBuf,
}

/// Shared map of client sessions, keyed by remote IP.
#[derive(Debug, Clone, Default)]
pub struct SessionMap {
    inner: Arc<RwLock<HashMap<IpAddr, ClientSession>>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, client: IpAddr, session: ClientSession) {
        self.inner.write().await.insert(client, session);
    }

    pub async fn get(&self, client: &IpAddr) -> Option<ClientSession> {
        self.inner.read().await.get(client).cloned()
    }

    /// The directory `client`'s static requests resolve against, falling
    /// back to `default_root` when the client has no session (it may have
    /// booted before this process started).
    pub async fn base_for(&self, client: &IpAddr, default_root: &Path) -> PathBuf {
        match self.inner.read().await.get(client) {
            Some(session) => session.base.clone(),
            None => default_root.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn params() -> KernelParameters {
        KernelParameters {
            arch: "amd64".to_string(),
            subarch: "generic".to_string(),
            release: "precise".to_string(),
            purpose: "install".to_string(),
            hostname: "node01".to_string(),
            domain: None,
            preseed_url: "http://localhost/preseed".to_string(),
            log_host: "10.0.0.1".to_string(),
            fs_host: "10.0.0.1".to_string(),
            extra_opts: None,
        }
    }

    #[tokio::test]
    async fn test_session_roundtrip_and_overwrite() {
        let sessions = SessionMap::new();
        let client = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        assert!(sessions.get(&client).await.is_none());

        sessions
            .insert(
                client,
                ClientSession {
                    params: params(),
                    is_windows: false,
                    base: PathBuf::from("/tftp"),
                },
            )
            .await;
        assert!(!sessions.get(&client).await.unwrap().is_windows);

        // A reboot replaces the previous session.
        sessions
            .insert(
                client,
                ClientSession {
                    params: params(),
                    is_windows: true,
                    base: PathBuf::from("/tftp/amd64/generic/win7/install"),
                },
            )
            .await;
        assert!(sessions.get(&client).await.unwrap().is_windows);
    }

    #[tokio::test]
    async fn test_base_for_falls_back_to_root() {
        let sessions = SessionMap::new();
        let known = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let unknown = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6));
        sessions
            .insert(
                known,
                ClientSession {
                    params: params(),
                    is_windows: true,
                    base: PathBuf::from("/tftp/win"),
                },
            )
            .await;

        let root = Path::new("/tftp");
        assert_eq!(sessions.base_for(&known, root).await, Path::new("/tftp/win"));
        assert_eq!(sessions.base_for(&unknown, root).await, root);
    }
}
