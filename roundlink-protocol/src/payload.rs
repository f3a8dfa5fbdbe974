//! Payload Transfer
//!
//! Bulk data never travels over a link. A packet announces the payload with
//! `payloadSize` and `payloadTransferInfo.port`; the data itself is streamed
//! over a separate TCP connection.
//!
//! ## Protocol
//!
//! 1. Sender binds a [`PayloadServer`] on a free port (1739+ range)
//! 2. Sender writes a packet carrying the size and port over the link
//! 3. Receiver connects to the sender's address on that port
//! 4. Raw bytes are streamed
//! 5. The connection closes once `payloadSize` bytes have been transferred
//!
//! Every transfer runs in its own task and can be cancelled through a
//! [`CancellationToken`]. A failed or cancelled transfer only ends that
//! transfer; the link that announced it is not affected.
//!
//! ```rust,ignore
//! let server = PayloadServer::new().await?;
//! let packet = Packet::new("kdeconnect.share.request", json!({"filename": "a.pdf"}))
//!     .with_payload(size, server.port());
//! device.send(&packet).await?;
//! let handle = server.spawn_send_file("/path/to/a.pdf", None);
//! handle.join().await?;
//! ```

use crate::{Packet, ProtocolError, Result};
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timeout for accepting or establishing the payload connection
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for each read or write while streaming
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

const BUFFER_SIZE: usize = 65536;

/// Default port range for payload servers
pub const PAYLOAD_PORT_RANGE_START: u16 = 1739;
pub const PAYLOAD_PORT_RANGE_END: u16 = 1764;

/// [`PAYLOAD_PORT_RANGE_START`]`..=`[`PAYLOAD_PORT_RANGE_END`]
pub fn default_payload_ports() -> RangeInclusive<u16> {
    PAYLOAD_PORT_RANGE_START..=PAYLOAD_PORT_RANGE_END
}

/// Progress callback for transfers
///
/// Receives (bytes transferred, total bytes). Returning `false` cancels the
/// transfer.
pub type ProgressCallback = Box<dyn Fn(u64, u64) -> bool + Send + Sync>;

/// Where to fetch the payload a packet announces
///
/// `peer_ip` is the address of the device that sent the packet.
pub fn payload_source(packet: &Packet, peer_ip: IpAddr) -> Option<(SocketAddr, u64)> {
    let size = u64::try_from(packet.payload_size?).ok()?;
    let port = packet.payload_port()?;
    Some((SocketAddr::new(peer_ip, port), size))
}

/// A transfer running in the background
pub struct TransferHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<u64>>,
}

impl TransferHandle {
    /// Stop the transfer; `join` then reports [`ProtocolError::Cancelled`]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the transfer and return the number of bytes moved
    pub async fn join(self) -> Result<u64> {
        self.task
            .await
            .map_err(|e| ProtocolError::Cancelled(format!("transfer task ended: {}", e)))?
    }
}

/// Copy exactly `size` bytes from `reader` to `writer`
async fn stream_payload<R, W>(
    reader: &mut R,
    writer: &mut W,
    size: u64,
    cancel: &CancellationToken,
    progress: Option<&ProgressCallback>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    while total < size {
        let want = (size - total).min(BUFFER_SIZE as u64) as usize;

        let read = tokio::select! {
            read = timeout(TRANSFER_TIMEOUT, reader.read(&mut buffer[..want])) => read,
            _ = cancel.cancelled() => {
                return Err(ProtocolError::Cancelled("payload transfer".to_string()));
            }
        };
        let read = read
            .map_err(|_| ProtocolError::Timeout("payload read".to_string()))?
            .map_err(|e| ProtocolError::from_io_error(e, "reading payload"))?;

        if read == 0 {
            return Err(ProtocolError::NetworkError(format!(
                "payload ended early: {} of {} bytes",
                total, size
            )));
        }

        timeout(TRANSFER_TIMEOUT, writer.write_all(&buffer[..read]))
            .await
            .map_err(|_| ProtocolError::Timeout("payload write".to_string()))?
            .map_err(|e| ProtocolError::from_io_error(e, "writing payload"))?;
        total += read as u64;

        if let Some(callback) = progress {
            if !callback(total, size) {
                info!("Transfer cancelled by progress callback");
                return Err(ProtocolError::Cancelled("payload transfer".to_string()));
            }
        }
    }

    writer.flush().await?;
    debug!("Streamed {} payload bytes", total);
    Ok(total)
}

/// TCP server offering one payload
pub struct PayloadServer {
    listener: TcpListener,
    port: u16,
}

impl PayloadServer {
    /// Bind on 0.0.0.0 in the default payload port range
    pub async fn new() -> Result<Self> {
        Self::bind_range(default_payload_ports()).await
    }

    /// Bind on 0.0.0.0 using the first free port in `ports`
    pub async fn bind_range(ports: RangeInclusive<u16>) -> Result<Self> {
        if ports.is_empty() {
            return Err(ProtocolError::Configuration(format!(
                "empty payload port range {}-{}",
                ports.start(),
                ports.end()
            )));
        }

        for port in ports.clone() {
            if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
                info!("Payload server listening on port {}", port);
                return Ok(Self { listener, port });
            }
        }

        Err(ProtocolError::ResourceExhausted(format!(
            "all payload ports {}-{} are in use",
            ports.start(),
            ports.end()
        )))
    }

    /// Bind on a specific address
    pub async fn bind_addr(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and stream `size` bytes from `source`
    pub async fn serve<R>(
        self,
        mut source: R,
        size: u64,
        cancel: &CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let accepted = tokio::select! {
            accepted = timeout(CONNECTION_TIMEOUT, self.listener.accept()) => accepted,
            _ = cancel.cancelled() => {
                return Err(ProtocolError::Cancelled("payload server".to_string()));
            }
        };
        let (mut stream, remote) = accepted
            .map_err(|_| ProtocolError::Timeout("waiting for payload receiver".to_string()))?
            .map_err(|e| ProtocolError::from_io_error(e, "accepting payload connection"))?;

        info!("Sending {} payload bytes to {}", size, remote);
        let sent = stream_payload(&mut source, &mut stream, size, cancel, progress.as_ref()).await?;
        if let Err(e) = stream.shutdown().await {
            debug!("Payload connection to {} did not shut down cleanly: {}", remote, e);
        }
        Ok(sent)
    }

    /// Accept one connection and stream a file
    pub async fn send_file(
        self,
        path: impl AsRef<Path>,
        cancel: &CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<u64> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        self.serve(file, size, cancel, progress).await
    }

    /// Run [`send_file`](Self::send_file) in its own task
    pub fn spawn_send_file(
        self,
        path: impl Into<PathBuf>,
        progress: Option<ProgressCallback>,
    ) -> TransferHandle {
        let path = path.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.send_file(&path, &token, progress).await });
        TransferHandle { cancel, task }
    }
}

/// TCP client fetching one payload
pub struct PayloadClient {
    stream: TcpStream,
    addr: SocketAddr,
}

impl PayloadClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = timeout(CONNECTION_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to payload at {}", addr)))?
            .map_err(|e| ProtocolError::from_io_error(e, "connecting to payload server"))?;
        debug!("Connected to payload server at {}", addr);
        Ok(Self { stream, addr })
    }

    /// Read `size` bytes into `sink`
    pub async fn receive_to<W>(
        mut self,
        sink: &mut W,
        size: u64,
        cancel: &CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        stream_payload(&mut self.stream, sink, size, cancel, progress.as_ref()).await
    }

    /// Read `size` bytes into a file
    ///
    /// The file is removed again if the transfer does not complete.
    pub async fn receive_to_file(
        self,
        path: impl AsRef<Path>,
        size: u64,
        cancel: &CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<u64> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(path).await?;
        let addr = self.addr;

        let result = self.receive_to(&mut file, size, cancel, progress).await;
        match &result {
            Ok(received) => info!("Received {} bytes from {} into {:?}", received, addr, path),
            Err(e) => {
                warn!("Payload from {} failed, removing {:?}: {}", addr, path, e);
                drop(file);
                if let Err(e) = fs::remove_file(path).await {
                    warn!("Failed to clean up partial file {:?}: {}", path, e);
                }
            }
        }
        result
    }
}

/// Fetch a payload into a file in the background
pub fn download(
    addr: SocketAddr,
    path: impl Into<PathBuf>,
    size: u64,
    progress: Option<ProgressCallback>,
) -> TransferHandle {
    let path = path.into();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let client = PayloadClient::connect(addr).await?;
        client.receive_to_file(&path, size, &token, progress).await
    });
    TransferHandle { cancel, task }
}
