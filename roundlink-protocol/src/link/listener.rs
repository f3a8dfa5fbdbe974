//! Inbound session listener

use super::{Link, LinkConfig};
use crate::discovery::{DISCOVERY_PORT, PORT_RANGE_END, PORT_RANGE_START};
use crate::{CertificateInfo, DeviceInfo, ProtocolError, Result};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Listens for TCP connections from devices that discovered us
pub struct LinkListener {
    listener: TcpListener,
}

impl LinkListener {
    /// Bind on all interfaces
    ///
    /// Tries `port` first, then every port of the KDE Connect range when
    /// `port` is the standard one.
    pub async fn bind(port: u16) -> Result<Self> {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => return Self::from_listener(listener),
            Err(e) if port != DISCOVERY_PORT => {
                return Err(ProtocolError::from_io_error(e, "binding link listener"))
            }
            Err(e) => warn!("Port {} unavailable ({}), trying fallback range", port, e),
        }

        for fallback in PORT_RANGE_START..=PORT_RANGE_END {
            if fallback == port {
                continue;
            }
            if let Ok(listener) = TcpListener::bind((Ipv4Addr::UNSPECIFIED, fallback)).await {
                return Self::from_listener(listener);
            }
        }

        Err(ProtocolError::ResourceExhausted(format!(
            "no free TCP port in {}-{}",
            PORT_RANGE_START, PORT_RANGE_END
        )))
    }

    /// Bind on one exact address
    pub async fn bind_addr(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "binding link listener"))?;
        Self::from_listener(listener)
    }

    fn from_listener(listener: TcpListener) -> Result<Self> {
        info!("Link listener on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next TCP connection
    ///
    /// The handshake is not run here so a slow peer cannot hold up the
    /// accept loop; run [`IncomingConnection::handshake`] on its own task.
    pub async fn accept(&self) -> Result<IncomingConnection> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("Accepted TCP connection from {}", addr);
        Ok(IncomingConnection { stream, addr })
    }
}

/// A TCP connection that has not been authenticated yet
pub struct IncomingConnection {
    stream: TcpStream,
    addr: SocketAddr,
}

impl IncomingConnection {
    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run the acceptor side of the handshake
    pub async fn handshake(
        self,
        our_cert: &CertificateInfo,
        local: &DeviceInfo,
        config: &LinkConfig,
    ) -> Result<Link> {
        Link::accept(self.stream, self.addr, our_cert, local, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_addr_ephemeral() {
        let listener = LinkListener::bind_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_accept_reports_remote_addr() {
        let listener = LinkListener::bind_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let incoming = listener.accept().await.unwrap();

        assert_eq!(incoming.remote_addr(), client.local_addr().unwrap());
    }
}
