//! Links
//!
//! A [`Link`] is one authenticated, encrypted connection to a single peer. It
//! owns the socket, serializes writes, and runs a reader task that hands every
//! decoded packet to its owner.
//!
//! ## States
//!
//! `Connecting → Handshaking → Authenticated → Closed`
//!
//! The first two states only exist inside [`Link::connect`] and
//! [`IncomingConnection::handshake`]; a `Link` value is created
//! `Authenticated`. Any failure ends in `Closed` and is never retried here.
//! Reconnecting is up to whoever owns the device.
//!
//! ## Error handling
//!
//! - malformed frames are logged and skipped
//! - transport failures close the link and produce one [`LinkEvent::Closed`]
//! - a certificate that differs from the pinned one is reported by
//!   [`Link::verify_pin`] as [`ProtocolError::TrustViolation`]

mod handshake;
mod listener;
pub mod tls_config;

pub use listener::{IncomingConnection, LinkListener};

use crate::codec::{self, FrameReader, MAX_PACKET_SIZE};
use crate::{DeviceInfo, ErrorCategory, Packet, PeerCertificate, ProtocolError, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) type TlsStream = SslStream<TcpStream>;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Default timeout for establishing the TCP connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for each handshake step
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for writing one packet
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the TLS shutdown performed by [`Link::close`]
const CLOSE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Link lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Handshaking,
    Authenticated,
    Closed,
}

/// Why a link closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this host
    Local,
    /// The peer closed the connection cleanly
    PeerClosed,
    /// Transport failure
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::PeerClosed => f.write_str("closed by peer"),
            CloseReason::Error(msg) => write!(f, "{}", msg),
        }
    }
}

/// Events delivered by a link's reader task
#[derive(Debug)]
pub enum LinkEvent {
    /// A packet was decoded
    Packet {
        /// Link that received the packet
        link_id: u64,
        /// The decoded packet
        packet: Packet,
    },

    /// The link closed; sent exactly once
    Closed {
        /// Link that closed
        link_id: u64,
        /// Why it closed
        reason: CloseReason,
    },
}

/// Link tuning
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Timeout for establishing the TCP connection
    pub connect_timeout: Duration,

    /// Timeout for each handshake step
    pub handshake_timeout: Duration,

    /// Largest frame accepted or sent
    pub max_packet_size: usize,

    /// Timeout for writing one packet; the link closes when it expires
    pub write_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_packet_size: MAX_PACKET_SIZE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// One authenticated session with a peer
pub struct Link {
    id: u64,
    remote_addr: SocketAddr,
    peer: DeviceInfo,
    peer_certificate: PeerCertificate,
    state: Arc<watch::Sender<LinkState>>,
    close_reason: Arc<StdMutex<Option<CloseReason>>>,
    writer: Mutex<Option<WriteHalf<TlsStream>>>,
    reader: StdMutex<Option<FrameReader<ReadHalf<TlsStream>>>>,
    shutdown: CancellationToken,
    max_packet_size: usize,
    write_timeout: Duration,
}

impl Link {
    pub(crate) fn new(
        remote_addr: SocketAddr,
        peer: DeviceInfo,
        peer_certificate: PeerCertificate,
        reader: FrameReader<ReadHalf<TlsStream>>,
        writer: WriteHalf<TlsStream>,
        config: &LinkConfig,
    ) -> Self {
        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let (state, _) = watch::channel(LinkState::Authenticated);

        info!(
            "Link {} to {} ({}) at {} authenticated",
            id, peer.device_name, peer.device_id, remote_addr
        );

        Self {
            id,
            remote_addr,
            peer,
            peer_certificate,
            state: Arc::new(state),
            close_reason: Arc::new(StdMutex::new(None)),
            writer: Mutex::new(Some(writer)),
            reader: StdMutex::new(Some(reader)),
            shutdown: CancellationToken::new(),
            max_packet_size: config.max_packet_size,
            write_timeout: config.write_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Identity the peer announced during the handshake
    pub fn peer(&self) -> &DeviceInfo {
        &self.peer
    }

    pub fn device_id(&self) -> &str {
        &self.peer.device_id
    }

    /// Certificate the peer presented this session
    pub fn peer_certificate(&self) -> &PeerCertificate {
        &self.peer_certificate
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == LinkState::Authenticated
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Wait until the link is closed
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == LinkState::Closed).await;
    }

    /// Why the link closed, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        lock_reason(&self.close_reason).clone()
    }

    /// Compare the presented certificate with a pinned one
    ///
    /// Returns `Ok(())` when nothing is pinned or the certificates are
    /// byte-identical.
    pub fn verify_pin(&self, pinned: Option<&PeerCertificate>) -> Result<()> {
        match pinned {
            Some(pinned) if *pinned != self.peer_certificate => {
                Err(ProtocolError::TrustViolation {
                    device_id: self.peer.device_id.clone(),
                    expected: pinned.fingerprint(),
                    presented: self.peer_certificate.fingerprint(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Start the reader task
    ///
    /// `sink` receives every decoded packet followed by exactly one
    /// [`LinkEvent::Closed`]. Returning `false` from `sink` closes the link.
    pub fn start<F>(&self, mut sink: F) -> Result<()>
    where
        F: FnMut(LinkEvent) -> bool + Send + 'static,
    {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| ProtocolError::NetworkError("link reader poisoned".to_string()))?
            .take()
            .ok_or_else(|| {
                ProtocolError::NetworkError(format!("link {} already started", self.id))
            })?;

        let link_id = self.id;
        let device_id = self.peer.device_id.clone();
        let state = self.state.clone();
        let close_reason = self.close_reason.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let reason = loop {
                let next = tokio::select! {
                    next = reader.next_packet() => next,
                    _ = shutdown.cancelled() => break CloseReason::Local,
                };

                match next {
                    Ok(Some(packet)) => {
                        debug!("Link {} received {}", link_id, packet.packet_type);
                        if !sink(LinkEvent::Packet { link_id, packet }) {
                            break CloseReason::Local;
                        }
                    }
                    Ok(None) => break CloseReason::PeerClosed,
                    Err(e) if e.category() == ErrorCategory::Format => {
                        warn!("Dropping malformed frame from {}: {}", device_id, e);
                    }
                    Err(e) => break CloseReason::Error(e.to_string()),
                }
            };

            let mut stored = lock_reason(&close_reason);
            let reason = stored.get_or_insert(reason).clone();
            drop(stored);
            state.send_replace(LinkState::Closed);
            shutdown.cancel();

            info!("Link {} to {} closed: {}", link_id, device_id, reason);
            sink(LinkEvent::Closed { link_id, reason });
        });

        Ok(())
    }

    /// Encode and write one packet
    ///
    /// Concurrent callers are serialized so frames never interleave. A packet
    /// over the link's size limit is refused and the link stays open. Any
    /// other write failure closes the link, including a timeout or an
    /// interruption by [`Link::close`].
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        if !self.is_authenticated() {
            return Err(self.not_connected());
        }

        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = self.shutdown.cancelled() => return Err(self.not_connected()),
        };
        let writer = guard.as_mut().ok_or_else(|| self.not_connected())?;

        let result = tokio::select! {
            result = tokio::time::timeout(
                self.write_timeout,
                codec::write_packet_with_limit(writer, packet, self.max_packet_size),
            ) => result.unwrap_or_else(|_| {
                Err(ProtocolError::Timeout(format!(
                    "writing {} to {}",
                    packet.packet_type, self.peer.device_id
                )))
            }),
            _ = self.shutdown.cancelled() => Err(self.not_connected()),
        };

        match result {
            Ok(()) => {
                debug!("Link {} sent {}", self.id, packet.packet_type);
                Ok(())
            }
            Err(e) if matches!(e, ProtocolError::PacketSizeExceeded(..)) => {
                warn!(
                    "Refusing to send {} to {}: {}",
                    packet.packet_type, self.peer.device_id, e
                );
                Err(e)
            }
            Err(e) => {
                warn!("Write to {} failed: {}", self.peer.device_id, e);
                // a half-written frame leaves the stream unusable
                guard.take();
                drop(guard);
                self.mark_closed(CloseReason::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Close the link
    ///
    /// Idempotent and never waits on a stalled write: an in-flight [`send`]
    /// is interrupted and drops the socket itself.
    ///
    /// [`send`]: Link::send
    pub async fn close(&self) {
        self.mark_closed(CloseReason::Local);

        let writer = match self.writer.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(mut writer) = writer {
            match tokio::time::timeout(CLOSE_SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                Ok(Err(e)) => debug!("Error shutting down link {}: {}", self.id, e),
                Err(_) => debug!("Shutdown of link {} timed out", self.id),
                Ok(Ok(())) => {}
            }
        }
    }

    fn not_connected(&self) -> ProtocolError {
        ProtocolError::NotConnected(self.peer.device_id.clone())
    }

    fn mark_closed(&self, reason: CloseReason) {
        lock_reason(&self.close_reason).get_or_insert(reason);
        self.state.send_replace(LinkState::Closed);
        self.shutdown.cancel();
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("device_id", &self.peer.device_id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn lock_reason(
    reason: &StdMutex<Option<CloseReason>>,
) -> std::sync::MutexGuard<'_, Option<CloseReason>> {
    reason.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers that build connected link pairs over loopback TCP

    use super::*;
    use crate::{CertificateInfo, DeviceType};
    use std::net::Ipv4Addr;

    /// One side of a test connection
    pub struct TestPeer {
        pub cert: CertificateInfo,
        pub info: DeviceInfo,
    }

    impl TestPeer {
        pub fn new(id: &str, name: &str, device_type: DeviceType) -> Self {
            let cert = CertificateInfo::generate(id).unwrap();
            let info = DeviceInfo::new(id, name, device_type, 0);
            Self { cert, info }
        }
    }

    /// Connect `client` to `server`; returns (client's link, server's link)
    pub async fn link_pair(client: &TestPeer, server: &TestPeer) -> (Link, Link) {
        link_pair_with_config(client, server, &LinkConfig::default()).await
    }

    /// [`link_pair`] with the same tuning applied to both ends
    pub async fn link_pair_with_config(
        client: &TestPeer,
        server: &TestPeer,
        config: &LinkConfig,
    ) -> (Link, Link) {
        let listener = LinkListener::bind_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let mut server_info = server.info.clone();
        server_info.tcp_port = Some(addr.port());

        let server_cert = server.cert.clone();
        let server_info_task = server_info.clone();
        let server_config = config.clone();
        let accept = tokio::spawn(async move {
            let incoming = listener.accept().await.unwrap();
            incoming
                .handshake(&server_cert, &server_info_task, &server_config)
                .await
        });

        let client_link = Link::connect(addr, &client.cert, &client.info, &server_info, config)
        .await
        .unwrap();
        let server_link = accept.await.unwrap().unwrap();

        (client_link, server_link)
    }
}
