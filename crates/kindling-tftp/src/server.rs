//! TFTP server loop and read transfers.
//!
//! A single listening socket accepts requests; each read runs in its own
//! task on an ephemeral socket, as RFC 1350 transfer IDs require. Only
//! reads are served. Block size, transfer size, and timeout options are
//! negotiated per RFC 2347/2348/2349.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{BackendError, Result, TftpError};
use crate::packet::{ErrorCode, TftpPacket, TransferOptions};

/// Default block size (RFC 1350)
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Block size bounds (RFC 2348)
pub const MIN_BLOCK_SIZE: u16 = 8;
pub const MAX_BLOCK_SIZE: u16 = 65464;

/// Default retransmission timeout in seconds
pub const DEFAULT_TIMEOUT: u8 = 5;

/// Retransmissions before a transfer is abandoned
pub const MAX_RETRIES: u32 = 5;

/// Source of file contents for read requests.
///
/// The server never touches the filesystem itself; everything it serves,
/// static or generated, comes through this seam.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open `file_name` for the client at `remote`, which contacted the
    /// server on `local`.
    ///
    /// `local` is the server's bound address; binding a wildcard address
    /// makes it useless as an identity, so deployments that rely on it
    /// should listen on a concrete interface address.
    async fn open(
        &self,
        file_name: &str,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> std::result::Result<Bytes, BackendError>;
}

/// Event emitted by the TFTP server.
#[derive(Debug, Clone)]
pub enum TftpEvent {
    Started {
        bind_addr: SocketAddr,
    },
    TransferStarted {
        client: SocketAddr,
        file_name: String,
        size: u64,
    },
    TransferCompleted {
        client: SocketAddr,
        file_name: String,
        bytes_sent: u64,
    },
    TransferFailed {
        client: SocketAddr,
        file_name: String,
        error: String,
    },
    Stopped,
}

/// The TFTP boot server.
pub struct TftpServer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    backend: Arc<dyn Backend>,
    event_sender: broadcast::Sender<TftpEvent>,
}

impl TftpServer {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr, backend: Arc<dyn Backend>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TftpError::BindFailed { addr, source })?;
        let local_addr = socket.local_addr()?;
        let (event_sender, _) = broadcast::channel(1024);
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            backend,
            event_sender,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribe to server events.
    pub fn subscribe(&self) -> broadcast::Receiver<TftpEvent> {
        self.event_sender.subscribe()
    }

    /// Serve requests until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        info!(addr = %self.local_addr, "TFTP server started");
        let _ = self.event_sender.send(TftpEvent::Started {
            bind_addr: self.local_addr,
        });

        let mut buf = [0u8; 65535];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, client)) => {
                            let data = buf[..len].to_vec();
                            let local = self.local_addr;
                            let backend = self.backend.clone();
                            let event_sender = self.event_sender.clone();
                            tokio::spawn(async move {
                                if let Err(error) =
                                    handle_request(data, client, local, backend, event_sender).await
                                {
                                    error!(%error, %client, "error handling TFTP request");
                                }
                            });
                        }
                        Err(error) => {
                            error!(%error, "error receiving packet");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("TFTP server shutting down");
                        let _ = self.event_sender.send(TftpEvent::Stopped);
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TftpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TftpServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

async fn handle_request(
    data: Vec<u8>,
    client: SocketAddr,
    local: SocketAddr,
    backend: Arc<dyn Backend>,
    event_sender: broadcast::Sender<TftpEvent>,
) -> Result<()> {
    match TftpPacket::parse(&data)? {
        TftpPacket::ReadRequest {
            file_name,
            mode: _,
            options,
        } => handle_read(client, local, &file_name, options, backend, event_sender).await,
        TftpPacket::WriteRequest { .. } => {
            send_error(client, ErrorCode::AccessViolation, "writes not supported").await
        }
        _ => send_error(client, ErrorCode::IllegalOperation, "unexpected packet").await,
    }
}

async fn handle_read(
    client: SocketAddr,
    local: SocketAddr,
    file_name: &str,
    options: TransferOptions,
    backend: Arc<dyn Backend>,
    event_sender: broadcast::Sender<TftpEvent>,
) -> Result<()> {
    debug!(%client, file_name, "read request");

    // Per-transfer socket with its own transfer ID.
    let socket = UdpSocket::bind("0.0.0.0:0").await?;

    let data = match backend.open(file_name, local, client).await {
        Ok(data) => data,
        Err(BackendError::NotFound(name)) => {
            debug!(%client, file_name = %name, "file not found");
            let _ = event_sender.send(TftpEvent::TransferFailed {
                client,
                file_name: file_name.to_string(),
                error: format!("file not found: {name}"),
            });
            return send_error_on(&socket, client, ErrorCode::FileNotFound, "File not found")
                .await;
        }
        Err(error) => {
            // Deliberately no response: an error packet would make the
            // firmware give up, while silence makes it retry, which is
            // what a transient upstream failure wants.
            warn!(%client, file_name, %error, "read aborted");
            let _ = event_sender.send(TftpEvent::TransferFailed {
                client,
                file_name: file_name.to_string(),
                error: error.to_string(),
            });
            return Ok(());
        }
    };

    let block_size = options
        .blksize
        .map(|requested| requested.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE))
        .unwrap_or(DEFAULT_BLOCK_SIZE);
    let timeout_secs = options.timeout.unwrap_or(DEFAULT_TIMEOUT).max(1);
    let timeout_duration = Duration::from_secs(u64::from(timeout_secs));

    // RFC 2347: acknowledge only options the client sent.
    if !options.is_empty() {
        let oack = TftpPacket::oack(TransferOptions {
            blksize: options.blksize.map(|_| block_size),
            tsize: options.tsize.map(|_| data.len() as u64),
            timeout: options.timeout,
        });
        match exchange(&socket, client, &oack.encode(), 0, timeout_duration).await? {
            AckOutcome::Acked => {}
            AckOutcome::ClientError { code, message } => {
                // The client rejected the options; it will re-request
                // without them.
                debug!(%client, ?code, message, "client rejected options");
                return Ok(());
            }
            AckOutcome::Timeout => {
                return Err(TftpError::Timeout {
                    file_name: file_name.to_string(),
                });
            }
        }
    }

    let _ = event_sender.send(TftpEvent::TransferStarted {
        client,
        file_name: file_name.to_string(),
        size: data.len() as u64,
    });

    // Lockstep transfer: one DATA block, one ACK. A block shorter than
    // the negotiated size ends the transfer.
    let block_size = usize::from(block_size);
    let mut block: u16 = 1;
    let mut offset = 0;
    loop {
        let end = (offset + block_size).min(data.len());
        let chunk = data.slice(offset..end);
        let last = chunk.len() < block_size;
        let packet = TftpPacket::data(block, chunk).encode();

        match exchange(&socket, client, &packet, block, timeout_duration).await? {
            AckOutcome::Acked => {}
            AckOutcome::ClientError { code, message } => {
                warn!(%client, file_name, ?code, message, "transfer aborted by client");
                let _ = event_sender.send(TftpEvent::TransferFailed {
                    client,
                    file_name: file_name.to_string(),
                    error: message,
                });
                return Ok(());
            }
            AckOutcome::Timeout => {
                let _ = event_sender.send(TftpEvent::TransferFailed {
                    client,
                    file_name: file_name.to_string(),
                    error: "timeout".to_string(),
                });
                return Err(TftpError::Timeout {
                    file_name: file_name.to_string(),
                });
            }
        }

        offset = end;
        if last {
            break;
        }
        block = block.wrapping_add(1);
    }

    info!(%client, file_name, bytes = data.len(), "transfer completed");
    let _ = event_sender.send(TftpEvent::TransferCompleted {
        client,
        file_name: file_name.to_string(),
        bytes_sent: data.len() as u64,
    });
    Ok(())
}

enum AckOutcome {
    Acked,
    ClientError { code: ErrorCode, message: String },
    Timeout,
}

/// Send `packet` and wait for the ACK of `expected` block, retransmitting
/// on timeout. Stale ACKs from earlier blocks are ignored.
async fn exchange(
    socket: &UdpSocket,
    client: SocketAddr,
    packet: &[u8],
    expected: u16,
    timeout_duration: Duration,
) -> Result<AckOutcome> {
    let mut buf = [0u8; 512];
    for _ in 0..MAX_RETRIES {
        socket.send_to(packet, client).await?;
        loop {
            match timeout(timeout_duration, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) => match TftpPacket::parse(&buf[..len]) {
                    Ok(TftpPacket::Ack { block }) if block == expected => {
                        return Ok(AckOutcome::Acked);
                    }
                    Ok(TftpPacket::Ack { .. }) => continue,
                    Ok(TftpPacket::Error { code, message }) => {
                        return Ok(AckOutcome::ClientError { code, message });
                    }
                    Ok(_) | Err(_) => continue,
                },
                Ok(Err(error)) => return Err(error.into()),
                // Retransmit.
                Err(_) => break,
            }
        }
    }
    Ok(AckOutcome::Timeout)
}

async fn send_error(client: SocketAddr, code: ErrorCode, message: &str) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    send_error_on(&socket, client, code, message).await
}

async fn send_error_on(
    socket: &UdpSocket,
    client: SocketAddr,
    code: ErrorCode,
    message: &str,
) -> Result<()> {
    socket
        .send_to(&TftpPacket::error(code, message).encode(), client)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapBackend {
        files: HashMap<String, Bytes>,
    }

    impl MapBackend {
        fn new(files: &[(&str, &[u8])]) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|(name, data)| (name.to_string(), Bytes::copy_from_slice(data)))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl Backend for MapBackend {
        async fn open(
            &self,
            file_name: &str,
            _local: SocketAddr,
            _remote: SocketAddr,
        ) -> std::result::Result<Bytes, BackendError> {
            if let Some(rest) = file_name.strip_prefix("broken/") {
                return Err(BackendError::Io {
                    path: rest.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
                });
            }
            self.files
                .get(file_name)
                .cloned()
                .ok_or_else(|| BackendError::NotFound(file_name.to_string()))
        }
    }

    async fn start_server(backend: MapBackend) -> (SocketAddr, tokio::sync::watch::Sender<bool>) {
        let server = TftpServer::bind("127.0.0.1:0".parse().unwrap(), Arc::new(backend))
            .await
            .unwrap();
        let addr = server.local_addr();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move { server.run(shutdown_rx).await });
        (addr, shutdown_tx)
    }

    fn rrq(file_name: &str, blksize: Option<u16>) -> Bytes {
        TftpPacket::ReadRequest {
            file_name: file_name.to_string(),
            mode: crate::packet::TransferMode::Octet,
            options: TransferOptions {
                blksize,
                tsize: None,
                timeout: None,
            },
        }
        .encode()
    }

    async fn recv(socket: &UdpSocket) -> (TftpPacket, SocketAddr) {
        let mut buf = [0u8; 65535];
        let (len, from) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for server")
            .unwrap();
        (TftpPacket::parse(&buf[..len]).unwrap(), from)
    }

    /// Minimal TFTP read client for exercising the server end to end.
    async fn fetch(
        server: SocketAddr,
        file_name: &str,
        blksize: Option<u16>,
    ) -> std::result::Result<Vec<u8>, (ErrorCode, String)> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&rrq(file_name, blksize), server).await.unwrap();

        let mut content = Vec::new();
        let mut expected_block: u16 = 1;
        let block_size = usize::from(blksize.unwrap_or(DEFAULT_BLOCK_SIZE));
        loop {
            let (packet, from) = recv(&socket).await;
            match packet {
                TftpPacket::Oack { options } => {
                    assert_eq!(options.blksize, blksize);
                    socket
                        .send_to(&TftpPacket::ack(0).encode(), from)
                        .await
                        .unwrap();
                }
                TftpPacket::Data { block, data } => {
                    assert_eq!(block, expected_block);
                    content.extend_from_slice(&data);
                    socket
                        .send_to(&TftpPacket::ack(block).encode(), from)
                        .await
                        .unwrap();
                    if data.len() < block_size {
                        return Ok(content);
                    }
                    expected_block = expected_block.wrapping_add(1);
                }
                TftpPacket::Error { code, message } => return Err((code, message)),
                other => panic!("unexpected packet: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_read_small_file_without_options() {
        let (addr, _shutdown) = start_server(MapBackend::new(&[("pxelinux.0", b"loader")])).await;
        let content = fetch(addr, "pxelinux.0", None).await.unwrap();
        assert_eq!(content, b"loader");
    }

    #[tokio::test]
    async fn test_read_multi_block_with_negotiated_blksize() {
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let (addr, _shutdown) =
            start_server(MapBackend::new(&[("amd64/generic/precise/install/linux", &payload)]))
                .await;
        let content = fetch(addr, "amd64/generic/precise/install/linux", Some(768))
            .await
            .unwrap();
        assert_eq!(content, payload);
    }

    #[tokio::test]
    async fn test_read_exact_multiple_ends_with_empty_block() {
        // A file that is an exact multiple of the block size must be
        // terminated by a zero-length DATA block.
        let payload = vec![7u8; 1024];
        let (addr, _shutdown) = start_server(MapBackend::new(&[("even", &payload)])).await;
        let content = fetch(addr, "even", Some(512)).await.unwrap();
        assert_eq!(content, payload);
    }

    #[tokio::test]
    async fn test_missing_file_yields_error_packet() {
        let (addr, _shutdown) = start_server(MapBackend::new(&[])).await;
        let (code, _message) = fetch(addr, "no-such-file", None).await.unwrap_err();
        assert_eq!(code, ErrorCode::FileNotFound);
    }

    #[tokio::test]
    async fn test_write_request_is_rejected() {
        let (addr, _shutdown) = start_server(MapBackend::new(&[])).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut wrq = rrq("upload", None).to_vec();
        wrq[1] = 0x02;
        socket.send_to(&wrq, addr).await.unwrap();

        let (packet, _) = recv(&socket).await;
        assert!(matches!(
            packet,
            TftpPacket::Error {
                code: ErrorCode::AccessViolation,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_backend_failure_sends_no_packet() {
        let (addr, _shutdown) = start_server(MapBackend::new(&[])).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(&rrq("broken/disk", None), addr)
            .await
            .unwrap();

        let mut buf = [0u8; 512];
        let outcome = timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
        assert!(outcome.is_err(), "expected silence, got a packet");
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let server = TftpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(MapBackend::new(&[])),
        )
        .await
        .unwrap();
        let mut events = server.subscribe();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move { server.run(shutdown_rx).await });

        assert!(matches!(events.recv().await, Ok(TftpEvent::Started { .. })));
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(matches!(events.recv().await, Ok(TftpEvent::Stopped)));
    }
}
