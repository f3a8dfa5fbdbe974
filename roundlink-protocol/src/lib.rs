//! RoundLink Protocol Implementation
//!
//! Device connection and packet routing layer speaking the KDE Connect wire
//! protocol: UDP discovery, TLS sessions authenticated by self-signed
//! certificates, certificate pinning through pairing, and capability based
//! dispatch of packets to plugins.
//!
//! The main entry points are:
//!
//! - [`CertificateInfo`]: the durable local identity
//! - [`DiscoveryService`]: UDP announcements
//! - [`Link`] and [`LinkListener`]: authenticated sessions
//! - [`DeviceRegistry`]: known devices, pairing and persistence
//! - [`PluginManager`]: plugin factories and capability negotiation

pub mod codec;
pub mod device;
pub mod discovery;
pub mod identity;
pub mod link;
pub mod packet;
pub mod payload;
pub mod plugins;
pub mod registry;

mod error;

pub use device::{Device, DeviceEvent, PairingConfig, PairingFailure, PairingStatus};
pub use discovery::{DeviceInfo, DeviceType, DiscoveryConfig, DiscoveryEvent, DiscoveryService};
pub use error::{ErrorCategory, ProtocolError, Result};
pub use identity::{CertificateInfo, PeerCertificate};
pub use link::{Link, LinkConfig, LinkListener, LinkState};
pub use packet::{current_timestamp, Packet};
pub use plugins::{Plugin, PluginContext, PluginFactory, PluginManager};
pub use registry::{DeviceRegistry, PairedDeviceStore, RegistryConfig};

/// Protocol version we implement
pub const PROTOCOL_VERSION: u32 = 8;

/// Oldest protocol version we can talk to
pub const MIN_PROTOCOL_VERSION: u32 = 7;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version_range() {
        assert!(MIN_PROTOCOL_VERSION <= PROTOCOL_VERSION);
    }
}
