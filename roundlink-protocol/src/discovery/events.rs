//! Discovery Events
//!
//! Events emitted by the discovery service.

use super::DeviceInfo;
use std::net::SocketAddr;

/// Events emitted by the discovery service
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A device was seen for the first time (or again after timing out)
    DeviceDiscovered {
        /// Information about the discovered device
        info: DeviceInfo,
        /// Address the announcement came from
        address: SocketAddr,
    },

    /// A known device announced itself again
    DeviceUpdated {
        /// Updated device information
        info: DeviceInfo,
        /// Address the announcement came from
        address: SocketAddr,
    },

    /// A device has not been heard from for the configured timeout
    DeviceTimeout {
        /// ID of the device that timed out
        device_id: String,
    },

    /// Discovery service started successfully
    ServiceStarted {
        /// Port the discovery service is listening on
        port: u16,
    },

    /// Discovery service stopped
    ServiceStopped,

    /// An error occurred during discovery
    Error {
        /// Error message
        message: String,
    },
}

impl DiscoveryEvent {
    /// Device info carried by the event, if any
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        match self {
            DiscoveryEvent::DeviceDiscovered { info, .. }
            | DiscoveryEvent::DeviceUpdated { info, .. } => Some(info),
            _ => None,
        }
    }

    /// TCP address to open a session with, for announcement events
    pub fn connect_addr(&self) -> Option<SocketAddr> {
        match self {
            DiscoveryEvent::DeviceDiscovered { info, address }
            | DiscoveryEvent::DeviceUpdated { info, address } => info.connect_addr(address.ip()),
            _ => None,
        }
    }
}
