//! Session handshake
//!
//! 1. The host that opened the TCP connection sends its identity in plain
//!    text.
//! 2. The stream is upgraded to TLS with inverted roles: the TCP initiator is
//!    the TLS server, the TCP acceptor is the TLS client.
//! 3. When both sides speak protocol 8 or newer, identities are exchanged
//!    again over TLS and must agree with what was announced before.
//! 4. The peer certificate's Common Name must match the announced device id.

use super::{tls_config, Link, LinkConfig, LinkState, TlsStream};
use crate::codec::{self, FrameReader};
use crate::packet::PACKET_TYPE_IDENTITY;
use crate::{
    CertificateInfo, DeviceInfo, Packet, PeerCertificate, ProtocolError, Result,
    MIN_PROTOCOL_VERSION,
};
use openssl::ssl::Ssl;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::{debug, warn};

/// Largest plain-text identity accepted before TLS
const MAX_IDENTITY_SIZE: usize = 64 * 1024;

/// First protocol version that repeats the identity inside TLS
const SECURE_IDENTITY_VERSION: u32 = 8;

async fn with_timeout<T, F>(limit: Duration, step: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ProtocolError::Timeout(format!("{} timed out after {:?}", step, limit)))?
}

fn check_version(peer: &DeviceInfo) -> Result<()> {
    if peer.protocol_version < MIN_PROTOCOL_VERSION {
        return Err(ProtocolError::ProtocolVersionMismatch(format!(
            "{} speaks protocol {}, oldest supported is {}",
            peer.device_id, peer.protocol_version, MIN_PROTOCOL_VERSION
        )));
    }
    Ok(())
}

fn log_state(addr: SocketAddr, state: LinkState) {
    debug!("Link with {} is {:?}", addr, state);
}

impl Link {
    /// Open a session with a device learned from discovery
    ///
    /// `peer_hint` is the identity the device announced over UDP; it decides
    /// whether the in-session identity exchange takes place.
    pub async fn connect(
        addr: SocketAddr,
        our_cert: &CertificateInfo,
        local: &DeviceInfo,
        peer_hint: &DeviceInfo,
        config: &LinkConfig,
    ) -> Result<Link> {
        check_version(peer_hint)?;

        log_state(addr, LinkState::Connecting);
        let mut tcp = with_timeout(config.connect_timeout, "connect", async {
            TcpStream::connect(addr)
                .await
                .map_err(|e| ProtocolError::from_io_error(e, "connecting"))
        })
        .await?;
        tcp.set_nodelay(true)?;

        log_state(addr, LinkState::Handshaking);
        codec::write_packet(&mut tcp, &local.to_identity_packet()).await?;

        let acceptor = tls_config::create_acceptor(our_cert)?;
        let mut tls = SslStream::new(Ssl::new(acceptor.context())?, tcp)?;
        with_timeout(config.handshake_timeout, "TLS handshake", async {
            Pin::new(&mut tls).accept().await.map_err(ProtocolError::from)
        })
        .await?;

        finish(tls, addr, local, peer_hint.clone(), config).await
    }

    /// Run the acceptor side of the handshake on an inbound TCP stream
    pub(crate) async fn accept(
        mut tcp: TcpStream,
        addr: SocketAddr,
        our_cert: &CertificateInfo,
        local: &DeviceInfo,
        config: &LinkConfig,
    ) -> Result<Link> {
        log_state(addr, LinkState::Handshaking);
        tcp.set_nodelay(true)?;

        let packet = with_timeout(
            config.handshake_timeout,
            "identity",
            read_plain_identity(&mut tcp),
        )
        .await?;
        let claimed = DeviceInfo::from_identity_packet(&packet)
            .map_err(|e| ProtocolError::Handshake(format!("bad identity from {}: {}", addr, e)))?;
        if claimed.device_id == local.device_id {
            return Err(ProtocolError::Handshake(
                "connection from our own device id".to_string(),
            ));
        }
        check_version(&claimed)?;

        let connector = tls_config::create_connector(our_cert)?;
        let mut tls = SslStream::new(Ssl::new(connector.context())?, tcp)?;
        with_timeout(config.handshake_timeout, "TLS handshake", async {
            Pin::new(&mut tls).connect().await.map_err(ProtocolError::from)
        })
        .await?;

        finish(tls, addr, local, claimed, config).await
    }
}

/// Read one newline-terminated identity without buffering past it; the
/// bytes after the newline belong to the TLS handshake.
async fn read_plain_identity(tcp: &mut TcpStream) -> Result<Packet> {
    let mut line = Vec::with_capacity(512);
    let mut byte = [0u8; 1];

    loop {
        let n = tcp
            .read(&mut byte)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "reading identity"))?;
        if n == 0 {
            return Err(ProtocolError::Handshake(
                "connection closed before identity".to_string(),
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_IDENTITY_SIZE {
            return Err(ProtocolError::PacketSizeExceeded(line.len(), MAX_IDENTITY_SIZE));
        }
    }

    let packet = Packet::from_bytes(&line)
        .map_err(|e| ProtocolError::Handshake(format!("unreadable identity: {}", e)))?;
    if !packet.is_type(PACKET_TYPE_IDENTITY) {
        return Err(ProtocolError::Handshake(format!(
            "expected identity, got {}",
            packet.packet_type
        )));
    }
    Ok(packet)
}

async fn finish(
    tls: TlsStream,
    addr: SocketAddr,
    local: &DeviceInfo,
    claimed: DeviceInfo,
    config: &LinkConfig,
) -> Result<Link> {
    let certificate = tls
        .ssl()
        .peer_certificate()
        .ok_or_else(|| ProtocolError::Handshake("peer presented no certificate".to_string()))?;
    let certificate = PeerCertificate::from_x509(&certificate)?;

    let (read_half, mut write_half) = tokio::io::split(tls);
    let mut reader = FrameReader::with_max_frame_size(read_half, config.max_packet_size);

    let negotiated = claimed.protocol_version.min(local.protocol_version);
    let peer = if negotiated >= SECURE_IDENTITY_VERSION {
        codec::write_packet(&mut write_half, &local.to_identity_packet()).await?;

        let packet = with_timeout(config.handshake_timeout, "secure identity", async {
            reader.next_packet().await?.ok_or_else(|| {
                ProtocolError::Handshake("connection closed during identity exchange".to_string())
            })
        })
        .await?;
        let secure = DeviceInfo::from_identity_packet(&packet)
            .map_err(|e| ProtocolError::Handshake(format!("bad secure identity: {}", e)))?;

        if secure.device_id != claimed.device_id {
            return Err(ProtocolError::Handshake(format!(
                "device id changed from {} to {} after TLS",
                claimed.device_id, secure.device_id
            )));
        }
        if secure.protocol_version != claimed.protocol_version {
            return Err(ProtocolError::Handshake(format!(
                "protocol version changed from {} to {} after TLS",
                claimed.protocol_version, secure.protocol_version
            )));
        }

        DeviceInfo {
            tcp_port: secure.tcp_port.or(claimed.tcp_port),
            ..secure
        }
    } else {
        claimed
    };

    let common_name = certificate.common_name()?;
    if common_name != peer.device_id {
        warn!(
            "Certificate from {} names {} but device announced {}",
            addr, common_name, peer.device_id
        );
        return Err(ProtocolError::Handshake(format!(
            "certificate belongs to {}, not {}",
            common_name, peer.device_id
        )));
    }

    Ok(Link::new(addr, peer, certificate, reader, write_half, config))
}
