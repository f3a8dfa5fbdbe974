//! Async Discovery Service
//!
//! Continuously broadcasts this device's identity and listens for other
//! devices on the network.

use super::events::DiscoveryEvent;
use super::{
    DeviceInfo, DEFAULT_BROADCAST_INTERVAL, DEFAULT_DEVICE_TIMEOUT, DISCOVERY_PORT,
    PORT_RANGE_END, PORT_RANGE_START,
};
use crate::packet::PACKET_TYPE_IDENTITY;
use crate::{Packet, ProtocolError, Result};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Largest datagram accepted by the listener
const MAX_DATAGRAM_SIZE: usize = 8192;

/// Capacity of the event channel before slow subscribers start lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for discovery service
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port to listen on
    pub port: u16,

    /// Try the fallback port range when `port` is taken
    pub allow_port_fallback: bool,

    /// Destination of periodic announcements
    pub broadcast_addr: SocketAddr,

    /// How often to broadcast identity packets
    pub broadcast_interval: Duration,

    /// How long before a device is considered timed out
    pub device_timeout: Duration,

    /// Whether to enable device timeout checking
    pub enable_timeout_check: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DISCOVERY_PORT,
            allow_port_fallback: true,
            broadcast_addr: SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            device_timeout: DEFAULT_DEVICE_TIMEOUT,
            enable_timeout_check: true,
        }
    }
}

/// Async discovery service
///
/// Runs three concurrent tasks once started:
/// - Broadcaster: sends identity packets at regular intervals
/// - Listener: receives identity packets and replies to new devices
/// - Timeout checker: reports devices that went quiet
pub struct DiscoveryService {
    /// This device's announcement
    device_info: Arc<RwLock<DeviceInfo>>,

    /// UDP socket for broadcasting and receiving
    socket: Arc<UdpSocket>,

    /// Event channel sender
    event_tx: broadcast::Sender<DiscoveryEvent>,

    /// Service configuration
    config: DiscoveryConfig,

    /// Stops all background tasks
    shutdown: CancellationToken,

    /// Last time each device was heard from
    last_seen: Arc<RwLock<HashMap<String, Instant>>>,
}

impl DiscoveryService {
    /// Create a new discovery service bound according to `config`
    pub async fn new(device_info: DeviceInfo, config: DiscoveryConfig) -> Result<Self> {
        let socket = Self::bind_socket(&config).await?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            device_info: Arc::new(RwLock::new(device_info)),
            socket: Arc::new(socket),
            event_tx,
            config,
            shutdown: CancellationToken::new(),
            last_seen: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Create a discovery service with default configuration
    pub async fn with_defaults(device_info: DeviceInfo) -> Result<Self> {
        Self::new(device_info, DiscoveryConfig::default()).await
    }

    /// Bind UDP socket with fallback ports
    async fn bind_socket(config: &DiscoveryConfig) -> Result<UdpSocket> {
        let primary = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port)).await {
            Ok(socket) => Ok(socket),
            Err(e) if config.allow_port_fallback => {
                warn!(
                    "Failed to bind to primary port {}: {}. Trying fallback range...",
                    config.port, e
                );
                let mut found = None;
                for port in PORT_RANGE_START..=PORT_RANGE_END {
                    if port == config.port {
                        continue;
                    }
                    if let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                        found = Some(socket);
                        break;
                    }
                }
                found.ok_or_else(|| {
                    ProtocolError::ResourceExhausted(format!(
                        "Failed to bind to any port in range {}-{}",
                        PORT_RANGE_START, PORT_RANGE_END
                    ))
                })
            }
            Err(e) => Err(ProtocolError::from_io_error(e, "binding discovery socket")),
        }?;

        primary.set_broadcast(true)?;
        info!("Bound discovery socket to {}", primary.local_addr()?);
        Ok(primary)
    }

    /// Get the local port this service is bound to
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Get a receiver for discovery events
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }

    /// Replace the announced identity, e.g. after the plugin set changed
    pub async fn update_identity(&self, device_info: DeviceInfo) {
        *self.device_info.write().await = device_info;
    }

    /// Start the background tasks
    pub async fn start(&self) -> Result<()> {
        let port = self.local_port()?;
        info!("Starting discovery service on port {}", port);

        let _ = self.event_tx.send(DiscoveryEvent::ServiceStarted { port });

        self.spawn_broadcaster();
        self.spawn_listener();
        if self.config.enable_timeout_check {
            self.spawn_timeout_checker();
        }

        Ok(())
    }

    /// Broadcast the identity immediately, outside the regular interval
    pub async fn announce(&self) -> Result<()> {
        let info = self.device_info.read().await.clone();
        Self::send_identity(&self.socket, &info, self.config.broadcast_addr).await
    }

    /// Send the identity to one address, e.g. a manually configured peer
    pub async fn announce_to(&self, target: SocketAddr) -> Result<()> {
        let info = self.device_info.read().await.clone();
        Self::send_identity(&self.socket, &info, target).await
    }

    fn spawn_broadcaster(&self) {
        let socket = self.socket.clone();
        let device_info = self.device_info.clone();
        let target = self.config.broadcast_addr;
        let broadcast_interval = self.config.broadcast_interval;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut interval = interval(broadcast_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let info = device_info.read().await.clone();
                        if let Err(e) = Self::send_identity(&socket, &info, target).await {
                            error!("Failed to broadcast identity: {}", e);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Broadcaster shutting down");
                        break;
                    }
                }
            }
        });
    }

    async fn send_identity(socket: &UdpSocket, info: &DeviceInfo, target: SocketAddr) -> Result<()> {
        let bytes = info.to_identity_packet().to_bytes()?;
        let sent = socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "sending identity"))?;
        debug!("Sent identity packet ({} bytes) to {}", sent, target);
        Ok(())
    }

    fn spawn_listener(&self) {
        let socket = self.socket.clone();
        let event_tx = self.event_tx.clone();
        let own_info = self.device_info.clone();
        let last_seen = self.last_seen.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                let received = tokio::select! {
                    received = socket.recv_from(&mut buf) => received,
                    _ = shutdown.cancelled() => {
                        info!("Discovery listener shutting down");
                        break;
                    }
                };

                match received {
                    Ok((size, src_addr)) => {
                        if let Err(e) = Self::handle_datagram(
                            &buf[..size],
                            src_addr,
                            &own_info,
                            &socket,
                            &event_tx,
                            &last_seen,
                        )
                        .await
                        {
                            debug!("Ignoring datagram from {}: {}", src_addr, e);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        let _ = event_tx.send(DiscoveryEvent::Error {
                            message: e.to_string(),
                        });
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
    }

    async fn handle_datagram(
        data: &[u8],
        src_addr: SocketAddr,
        own_info: &RwLock<DeviceInfo>,
        socket: &UdpSocket,
        event_tx: &broadcast::Sender<DiscoveryEvent>,
        last_seen: &RwLock<HashMap<String, Instant>>,
    ) -> Result<()> {
        let packet = Packet::from_bytes(data)?;
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            debug!("Ignoring non-identity packet from {}", src_addr);
            return Ok(());
        }

        let info = DeviceInfo::from_identity_packet(&packet)?;
        let own = own_info.read().await.clone();
        if info.device_id == own.device_id {
            return Ok(());
        }

        let is_new = last_seen
            .write()
            .await
            .insert(info.device_id.clone(), Instant::now())
            .is_none();

        let event = if is_new {
            info!(
                "Discovered device: {} ({}) at {}",
                info.device_name, info.device_type, src_addr
            );
            // Only new devices get a directed reply; replying to replies would
            // bounce identities between two hosts forever.
            if let Err(e) = Self::send_identity(socket, &own, src_addr).await {
                warn!("Failed to send directed identity to {}: {}", src_addr, e);
            }
            DiscoveryEvent::DeviceDiscovered {
                info,
                address: src_addr,
            }
        } else {
            debug!("Refreshed device: {} at {}", info.device_name, src_addr);
            DiscoveryEvent::DeviceUpdated {
                info,
                address: src_addr,
            }
        };

        let _ = event_tx.send(event);
        Ok(())
    }

    fn spawn_timeout_checker(&self) {
        let last_seen = self.last_seen.clone();
        let event_tx = self.event_tx.clone();
        let timeout = self.config.device_timeout;
        let shutdown = self.shutdown.clone();
        let period = (timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(5));

        tokio::spawn(async move {
            let mut interval = interval(period);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.cancelled() => break,
                }

                let mut map = last_seen.write().await;
                let timed_out: Vec<String> = map
                    .iter()
                    .filter(|(_, seen)| seen.elapsed() > timeout)
                    .map(|(id, _)| id.clone())
                    .collect();

                for device_id in timed_out {
                    info!("Device timed out: {}", device_id);
                    map.remove(&device_id);
                    let _ = event_tx.send(DiscoveryEvent::DeviceTimeout { device_id });
                }
            }
        });
    }

    /// Stop the discovery service
    pub fn stop(&self) {
        info!("Stopping discovery service");
        self.shutdown.cancel();
        let _ = self.event_tx.send(DiscoveryEvent::ServiceStopped);
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
