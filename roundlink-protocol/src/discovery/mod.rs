//! Device Discovery
//!
//! Devices announce themselves by sending `kdeconnect.identity` packets over
//! UDP, both periodically as broadcasts and as directed replies to newly seen
//! peers. Announcements are unauthenticated and idempotent: receiving the same
//! announcement twice only refreshes the peer's last-seen time.
//!
//! ## Identity Packet Format
//!
//! - `deviceId`: UUIDv4 with underscores (e.g. `740bd4b9_b418_4ee4_97d6_caf1da8151be`)
//! - `deviceName`: human readable name
//! - `deviceType`: desktop, laptop, phone, tablet or tv
//! - `protocolVersion`: protocol version
//! - `incomingCapabilities`: packet types this device can receive
//! - `outgoingCapabilities`: packet types this device can send
//! - `tcpPort`: TCP port to connect to for the encrypted session
//!
//! ## Port Configuration
//!
//! - Primary port: UDP 1716
//! - Fallback range: 1714-1764

mod events;
mod service;

pub use events::DiscoveryEvent;
pub use service::{DiscoveryConfig, DiscoveryService};

use crate::identity::is_valid_device_id;
use crate::packet::PACKET_TYPE_IDENTITY;
use crate::{Packet, ProtocolError, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::warn;

/// Default UDP port for device discovery
pub const DISCOVERY_PORT: u16 = 1716;

/// Port range for fallback when primary port is unavailable
pub const PORT_RANGE_START: u16 = 1714;
pub const PORT_RANGE_END: u16 = 1764;

/// Default broadcast interval (5 seconds)
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Default device timeout (30 seconds)
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest device name that is announced unchanged
const MAX_DEVICE_NAME_LEN: usize = 32;

/// Device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
    /// Any type this implementation does not know about
    #[serde(other)]
    Unknown,
}

impl DeviceType {
    /// Convert device type to string
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
            DeviceType::Unknown => "unknown",
        }
    }

    /// Parse an announced device type; unrecognized values map to `Unknown`
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "desktop" => DeviceType::Desktop,
            "laptop" => DeviceType::Laptop,
            "phone" | "smartphone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            "tv" => DeviceType::Tv,
            _ => DeviceType::Unknown,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device identity information
///
/// What a device announces about itself, both over UDP discovery and inside
/// the session handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Unique device identifier
    pub device_id: String,

    /// Human-readable device name
    pub device_name: String,

    /// Type of device
    pub device_type: DeviceType,

    /// Protocol version
    pub protocol_version: u32,

    /// Packet types this device can receive
    pub incoming_capabilities: Vec<String>,

    /// Packet types this device can send
    pub outgoing_capabilities: Vec<String>,

    /// TCP port for connections, absent in some in-session announcements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
}

impl DeviceInfo {
    /// Create a DeviceInfo with explicit device ID
    ///
    /// ```
    /// use roundlink_protocol::{DeviceInfo, DeviceType};
    ///
    /// let info = DeviceInfo::new("abc_123", "My Computer", DeviceType::Desktop, 1716);
    /// assert_eq!(info.tcp_port, Some(1716));
    /// ```
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        tcp_port: u16,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port: Some(tcp_port),
        }
    }

    /// Add an incoming capability
    pub fn with_incoming_capability(mut self, capability: impl Into<String>) -> Self {
        self.incoming_capabilities.push(capability.into());
        self
    }

    /// Add an outgoing capability
    pub fn with_outgoing_capability(mut self, capability: impl Into<String>) -> Self {
        self.outgoing_capabilities.push(capability.into());
        self
    }

    /// Set all incoming capabilities at once
    pub fn with_incoming_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.incoming_capabilities = capabilities;
        self
    }

    /// Set all outgoing capabilities at once
    pub fn with_outgoing_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.outgoing_capabilities = capabilities;
        self
    }

    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Whether the device announced it can receive `packet_type`
    pub fn can_receive(&self, packet_type: &str) -> bool {
        self.incoming_capabilities.iter().any(|c| c == packet_type)
    }

    /// Whether the device announced it may send `packet_type`
    pub fn can_send(&self, packet_type: &str) -> bool {
        self.outgoing_capabilities.iter().any(|c| c == packet_type)
    }

    /// Whether both announcements advertise the same capability sets
    pub fn same_capabilities(&self, other: &DeviceInfo) -> bool {
        fn sorted(list: &[String]) -> Vec<&str> {
            let mut v: Vec<&str> = list.iter().map(String::as_str).collect();
            v.sort_unstable();
            v.dedup();
            v
        }
        sorted(&self.incoming_capabilities) == sorted(&other.incoming_capabilities)
            && sorted(&self.outgoing_capabilities) == sorted(&other.outgoing_capabilities)
    }

    /// Compare this device's protocol version with ours
    ///
    /// `Greater` means the peer speaks a newer protocol than this build.
    pub fn compare_protocol_version(&self) -> Ordering {
        self.protocol_version.cmp(&PROTOCOL_VERSION)
    }

    /// Address to open a session with, given the address the device was seen at
    pub fn connect_addr(&self, ip: IpAddr) -> Option<SocketAddr> {
        self.tcp_port.map(|port| SocketAddr::new(ip, port))
    }

    /// Convert DeviceInfo to an identity packet
    pub fn to_identity_packet(&self) -> Packet {
        let mut body = json!({
            "deviceId": self.device_id,
            "deviceName": self.device_name,
            "deviceType": self.device_type.as_str(),
            "protocolVersion": self.protocol_version,
            "incomingCapabilities": self.incoming_capabilities,
            "outgoingCapabilities": self.outgoing_capabilities,
        });
        if let (Some(port), Value::Object(map)) = (self.tcp_port, &mut body) {
            map.insert("tcpPort".to_string(), Value::from(port));
        }
        Packet::new(PACKET_TYPE_IDENTITY, body)
    }

    /// Parse DeviceInfo from an identity packet
    pub fn from_identity_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::InvalidPacket(
                "Not an identity packet".to_string(),
            ));
        }

        let device_id = packet
            .get_body_field::<String>("deviceId")
            .ok_or_else(|| ProtocolError::InvalidPacket("Missing deviceId".to_string()))?;
        if !is_valid_device_id(&device_id) {
            return Err(ProtocolError::InvalidPacket(format!(
                "Invalid deviceId: {:?}",
                device_id
            )));
        }

        let mut device_name = packet
            .get_body_field::<String>("deviceName")
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| ProtocolError::InvalidPacket("Missing deviceName".to_string()))?;
        if device_name.chars().count() > MAX_DEVICE_NAME_LEN {
            warn!("Truncating long device name from {}", device_id);
            device_name = device_name.chars().take(MAX_DEVICE_NAME_LEN).collect();
        }

        let device_type = packet
            .get_body_field::<String>("deviceType")
            .map(|t| DeviceType::parse(&t))
            .unwrap_or(DeviceType::Unknown);

        let protocol_version = packet
            .get_body_field::<u32>("protocolVersion")
            .ok_or_else(|| ProtocolError::InvalidPacket("Missing protocolVersion".to_string()))?;

        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version,
            incoming_capabilities: packet
                .get_body_field::<Vec<String>>("incomingCapabilities")
                .unwrap_or_default(),
            outgoing_capabilities: packet
                .get_body_field::<Vec<String>>("outgoingCapabilities")
                .unwrap_or_default(),
            tcp_port: packet.get_body_field::<u16>("tcpPort"),
        })
    }
}
