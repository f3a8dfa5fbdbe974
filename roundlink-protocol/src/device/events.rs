//! Device Event System
//!
//! Events published by devices and the registry. A UI subscribes through
//! [`DeviceRegistry::subscribe`](crate::DeviceRegistry::subscribe) and never
//! has to poll.

use super::{PairingFailure, PairingStatus};

/// Events about known devices
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A device became known
    Added {
        device_id: String,
    },

    /// A device was forgotten
    Removed {
        device_id: String,
    },

    /// A link to the device was attached or lost
    ReachabilityChanged {
        device_id: String,
        reachable: bool,
    },

    /// Pairing status changed
    PairingStateChanged {
        device_id: String,
        status: PairingStatus,
    },

    /// The peer asked to pair; the user has to accept or reject
    PairingRequested {
        device_id: String,
        /// Name of the device requesting pairing
        device_name: String,
        /// Certificate fingerprint for user verification
        fingerprint: String,
    },

    /// A pairing attempt ended without pairing
    PairingFailed {
        device_id: String,
        reason: PairingFailure,
    },

    /// The peer presented a certificate other than the pinned one
    ///
    /// The link was closed and the pairing revoked.
    TrustViolation {
        device_id: String,
        /// Fingerprint of the pinned certificate
        expected: String,
        /// Fingerprint of the certificate presented
        presented: String,
    },

    /// A peer failed the handshake or speaks an unsupported protocol
    IncompatiblePeer {
        /// Device id, when the peer got far enough to announce one
        device_id: Option<String>,
        reason: String,
    },

    /// The set of active plugins changed
    PluginsChanged {
        device_id: String,
        /// Active plugin names in delivery order
        plugins: Vec<String>,
    },
}

impl DeviceEvent {
    /// Get device ID if the event names one
    pub fn device_id(&self) -> Option<&str> {
        match self {
            DeviceEvent::Added { device_id }
            | DeviceEvent::Removed { device_id }
            | DeviceEvent::ReachabilityChanged { device_id, .. }
            | DeviceEvent::PairingStateChanged { device_id, .. }
            | DeviceEvent::PairingRequested { device_id, .. }
            | DeviceEvent::PairingFailed { device_id, .. }
            | DeviceEvent::TrustViolation { device_id, .. }
            | DeviceEvent::PluginsChanged { device_id, .. } => Some(device_id),
            DeviceEvent::IncompatiblePeer { device_id, .. } => device_id.as_deref(),
        }
    }

    /// Whether the user has to be told about this event
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            DeviceEvent::PairingRequested { .. }
                | DeviceEvent::PairingFailed { .. }
                | DeviceEvent::TrustViolation { .. }
                | DeviceEvent::IncompatiblePeer { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id() {
        let event = DeviceEvent::ReachabilityChanged {
            device_id: "abc".to_string(),
            reachable: true,
        };
        assert_eq!(event.device_id(), Some("abc"));

        let event = DeviceEvent::IncompatiblePeer {
            device_id: None,
            reason: "protocol 5".to_string(),
        };
        assert_eq!(event.device_id(), None);
    }

    #[test]
    fn test_needs_attention() {
        assert!(DeviceEvent::PairingFailed {
            device_id: "abc".to_string(),
            reason: PairingFailure::TimedOut,
        }
        .needs_attention());

        assert!(!DeviceEvent::PluginsChanged {
            device_id: "abc".to_string(),
            plugins: vec![],
        }
        .needs_attention());
    }
}
