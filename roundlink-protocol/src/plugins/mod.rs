//! Plugin Architecture
//!
//! Plugins are the feature handlers that sit behind a paired device. Each
//! plugin declares the packet types it receives and the packet types it sends;
//! a device only instantiates the plugins that make sense for what the peer
//! announced.
//!
//! ## Capability negotiation
//!
//! A [`PluginFactory`] is compatible with a peer when:
//!
//! - its incoming types are empty or intersect the peer's outgoing types,
//! - its outgoing types are empty or intersect the peer's incoming types,
//! - at least one of those intersections is non-empty, and
//! - [`PluginFactory::is_compatible`] accepts the peer.
//!
//! Negotiation runs every time a device becomes paired while reachable and
//! again whenever the peer re-announces different capabilities. Ending up
//! with no compatible plugin is not an error; the device simply has no
//! features.
//!
//! ## Plugin Lifecycle
//!
//! ```text
//! Created → init(context) → start() → handle_packet()* → stop()
//! ```
//!
//! Plugins live as long as the device is paired and has a link. When the link
//! goes away they are stopped and dropped; a new set is created for the next
//! link.
//!
//! ## Dispatch
//!
//! Delivery is multicast. Every plugin that lists a packet type as incoming
//! receives each packet of that type, whatever the others return. Plugin
//! handlers of one device run one at a time on the device's dispatch task, so
//! plugin state needs no locking of its own.
//!
//! ## Example Plugin
//!
//! ```rust
//! use async_trait::async_trait;
//! use roundlink_protocol::plugins::{Plugin, PluginContext};
//! use roundlink_protocol::{Packet, Result};
//! use std::any::Any;
//!
//! #[derive(Default)]
//! struct BatteryPlugin {
//!     charge: Option<i64>,
//! }
//!
//! #[async_trait]
//! impl Plugin for BatteryPlugin {
//!     fn name(&self) -> &str {
//!         "battery"
//!     }
//!
//!     fn as_any(&self) -> &dyn Any {
//!         self
//!     }
//!
//!     fn as_any_mut(&mut self) -> &mut dyn Any {
//!         self
//!     }
//!
//!     fn incoming_capabilities(&self) -> Vec<String> {
//!         vec!["kdeconnect.battery".to_string()]
//!     }
//!
//!     fn outgoing_capabilities(&self) -> Vec<String> {
//!         vec![]
//!     }
//!
//!     async fn init(&mut self, _context: PluginContext) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn handle_packet(&mut self, packet: &Packet) -> Result<bool> {
//!         self.charge = packet.get_body_field("currentCharge");
//!         Ok(self.charge.is_some())
//!     }
//! }
//! ```

pub mod findremote;
pub mod ping;
pub mod presenter;

mod set;

pub use set::PluginSet;

use crate::payload::{default_payload_ports, PayloadServer};
use crate::{DeviceInfo, Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Channel plugins use to queue packets for their device
pub type PacketSender = mpsc::UnboundedSender<Packet>;

/// What a plugin gets to know about the device it is attached to
#[derive(Debug, Clone)]
pub struct PluginContext {
    peer: DeviceInfo,
    sender: PacketSender,
    payload_ports: RangeInclusive<u16>,
}

impl PluginContext {
    pub(crate) fn new(peer: DeviceInfo, sender: PacketSender) -> Self {
        Self {
            peer,
            sender,
            payload_ports: default_payload_ports(),
        }
    }

    pub(crate) fn with_payload_ports(mut self, ports: RangeInclusive<u16>) -> Self {
        self.payload_ports = ports;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.peer.device_id
    }

    /// The peer's identity at the time the plugin was created
    pub fn peer(&self) -> &DeviceInfo {
        &self.peer
    }

    /// Ports this host offers payloads on
    pub fn payload_ports(&self) -> RangeInclusive<u16> {
        self.payload_ports.clone()
    }

    /// Bind a payload server in the configured port range
    pub async fn payload_server(&self) -> Result<PayloadServer> {
        PayloadServer::bind_range(self.payload_ports()).await
    }

    /// Queue a packet for the device
    ///
    /// Packets are written in order by the device's outbox. Failures to write
    /// are logged there; this only fails once the device is gone.
    pub fn send(&self, packet: Packet) -> Result<()> {
        self.sender.send(packet).map_err(|e| {
            ProtocolError::NotConnected(format!(
                "{} (dropped {})",
                self.peer.device_id, e.0.packet_type
            ))
        })
    }
}

/// How a UI should present an action a plugin offers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffordanceKind {
    /// Entry in the device's menu
    MenuEntry,
    /// Button on the device page
    Button,
}

/// An action a plugin offers to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Affordance {
    pub kind: AffordanceKind,
    /// Human readable label
    pub label: String,
    /// Identifier passed back to [`Plugin::activate`]
    pub action: String,
    /// Freedesktop icon name
    pub icon: Option<String>,
}

impl Affordance {
    pub fn menu_entry(label: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            kind: AffordanceKind::MenuEntry,
            label: label.into(),
            action: action.into(),
            icon: None,
        }
    }

    pub fn button(label: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            kind: AffordanceKind::Button,
            label: label.into(),
            action: action.into(),
            icon: None,
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }
}

/// Factory for creating plugin instances
///
/// One factory is registered per plugin kind; every compatible paired device
/// gets its own instance.
pub trait PluginFactory: Send + Sync {
    /// Get the plugin name this factory creates
    fn name(&self) -> &str;

    /// Packet types the plugin receives
    fn incoming_capabilities(&self) -> Vec<String>;

    /// Packet types the plugin sends
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Extra gating beyond packet types, e.g. by device type
    fn is_compatible(&self, _peer: &DeviceInfo) -> bool {
        true
    }

    /// Create a new plugin instance
    fn create(&self) -> Box<dyn Plugin>;
}

/// A feature handler attached to one device
///
/// ## Packet Handling
///
/// Plugins should:
/// - Handle packets idempotently (repeated packets should not cause errors)
/// - Not depend on receiving responses to sent packets
/// - Return `Ok(false)` for packets they chose to ignore
///
/// Errors and panics are caught and logged by the device; they never stop
/// delivery to other plugins.
#[async_trait]
pub trait Plugin: Send + Sync + Any {
    /// Short, lowercase identifier like "ping" or "presenter"
    fn name(&self) -> &str;

    /// Downcast to Any for type-specific queries
    fn as_any(&self) -> &dyn Any;

    /// Downcast to mutable Any for type-specific commands
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Packet types this plugin receives
    fn incoming_capabilities(&self) -> Vec<String>;

    /// Packet types this plugin sends
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Attach the plugin to its device
    async fn init(&mut self, context: PluginContext) -> Result<()>;

    /// Begin processing; called after a successful `init`
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release resources; the plugin is dropped afterwards
    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handle an incoming packet of one of the incoming types
    ///
    /// Returns whether the packet was handled.
    async fn handle_packet(&mut self, packet: &Packet) -> Result<bool>;

    /// Actions to show for this plugin
    fn affordances(&self) -> Vec<Affordance> {
        Vec::new()
    }

    /// Run one of the actions from [`Plugin::affordances`]
    fn activate(&mut self, action: &str) -> Result<()> {
        Err(ProtocolError::Plugin(format!(
            "{} has no action {}",
            self.name(),
            action
        )))
    }

    /// The device became reachable or unreachable
    async fn on_reachability_changed(&mut self, _reachable: bool) {}
}

/// Whether `factory` should be instantiated for `peer`
pub fn is_factory_compatible(factory: &dyn PluginFactory, peer: &DeviceInfo) -> bool {
    let incoming = factory.incoming_capabilities();
    let outgoing = factory.outgoing_capabilities();

    let receives = incoming.iter().any(|t| peer.can_send(t));
    let sends = outgoing.iter().any(|t| peer.can_receive(t));

    (incoming.is_empty() || receives)
        && (outgoing.is_empty() || sends)
        && (receives || sends)
        && factory.is_compatible(peer)
}

/// Registry of plugin kinds
///
/// Holds the factories in registration order; that order is also the
/// delivery order for multicast packets.
#[derive(Default)]
pub struct PluginManager {
    factories: Vec<Arc<dyn PluginFactory>>,
}

impl PluginManager {
    /// Create a new empty plugin manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin factory
    ///
    /// # Errors
    ///
    /// Returns error if a factory with the same name is already registered.
    pub fn register_factory(&mut self, factory: Arc<dyn PluginFactory>) -> Result<()> {
        let name = factory.name().to_string();
        if self.factories.iter().any(|f| f.name() == name) {
            return Err(ProtocolError::Plugin(format!(
                "Plugin factory '{}' is already registered",
                name
            )));
        }

        info!("Registered plugin factory: {}", name);
        self.factories.push(factory);
        Ok(())
    }

    /// Unregister a factory by name; existing instances are unaffected
    pub fn unregister_factory(&mut self, name: &str) -> Option<Arc<dyn PluginFactory>> {
        let index = self.factories.iter().position(|f| f.name() == name)?;
        Some(self.factories.remove(index))
    }

    /// Names of registered factories
    pub fn list_plugins(&self) -> Vec<String> {
        self.factories.iter().map(|f| f.name().to_string()).collect()
    }

    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }

    /// Union of incoming types, for the local identity announcement
    pub fn incoming_capabilities(&self) -> Vec<String> {
        union(self.factories.iter().flat_map(|f| f.incoming_capabilities()))
    }

    /// Union of outgoing types, for the local identity announcement
    pub fn outgoing_capabilities(&self) -> Vec<String> {
        union(self.factories.iter().flat_map(|f| f.outgoing_capabilities()))
    }

    /// Factories compatible with `peer`, in registration order
    pub fn compatible_factories(&self, peer: &DeviceInfo) -> Vec<Arc<dyn PluginFactory>> {
        let compatible: Vec<_> = self
            .factories
            .iter()
            .filter(|f| is_factory_compatible(f.as_ref(), peer))
            .cloned()
            .collect();

        debug!(
            "{} of {} plugins compatible with {}",
            compatible.len(),
            self.factories.len(),
            peer.device_id
        );
        compatible
    }
}

fn union(types: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    types.filter(|t| seen.insert(t.clone())).collect()
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingFactory;
    use super::*;
    use crate::DeviceType;

    fn peer(incoming: &[&str], outgoing: &[&str]) -> DeviceInfo {
        DeviceInfo::new("peer_device", "Peer", DeviceType::Phone, 1716)
            .with_incoming_capabilities(incoming.iter().map(|s| s.to_string()).collect())
            .with_outgoing_capabilities(outgoing.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_register_rejects_duplicate_names() {
        let mut manager = PluginManager::new();
        manager
            .register_factory(Arc::new(RecordingFactory::new("a", &["x.a"], &[])))
            .unwrap();
        let err = manager
            .register_factory(Arc::new(RecordingFactory::new("a", &["x.b"], &[])))
            .unwrap_err();

        assert!(matches!(err, ProtocolError::Plugin(_)));
        assert_eq!(manager.factory_count(), 1);
    }

    #[test]
    fn test_incoming_only_plugin_needs_peer_to_send() {
        let factory = RecordingFactory::new("battery", &["x.battery"], &[]);

        assert!(is_factory_compatible(&factory, &peer(&[], &["x.battery"])));
        assert!(!is_factory_compatible(&factory, &peer(&["x.battery"], &[])));
    }

    #[test]
    fn test_outgoing_only_plugin_needs_peer_to_receive() {
        let factory = RecordingFactory::new("ring", &[], &["x.ring"]);

        assert!(is_factory_compatible(&factory, &peer(&["x.ring"], &[])));
        assert!(!is_factory_compatible(&factory, &peer(&[], &["x.ring"])));
    }

    #[test]
    fn test_both_directions_must_intersect_when_declared() {
        let factory = RecordingFactory::new("chat", &["x.chat"], &["x.chat.reply"]);

        assert!(is_factory_compatible(
            &factory,
            &peer(&["x.chat.reply"], &["x.chat"])
        ));
        assert!(!is_factory_compatible(&factory, &peer(&[], &["x.chat"])));
    }

    #[test]
    fn test_plugin_without_types_is_never_compatible() {
        let factory = RecordingFactory::new("empty", &[], &[]);
        assert!(!is_factory_compatible(&factory, &peer(&["x.a"], &["x.a"])));
    }

    #[test]
    fn test_compatible_factories_keep_registration_order() {
        let mut manager = PluginManager::new();
        for name in ["c", "a", "b"] {
            manager
                .register_factory(Arc::new(RecordingFactory::new(name, &["x.shared"], &[])))
                .unwrap();
        }
        manager
            .register_factory(Arc::new(RecordingFactory::new("other", &["x.other"], &[])))
            .unwrap();

        let names: Vec<String> = manager
            .compatible_factories(&peer(&[], &["x.shared"]))
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_capability_union_has_no_duplicates() {
        let mut manager = PluginManager::new();
        manager
            .register_factory(Arc::new(RecordingFactory::new("a", &["x.a"], &["x.out"])))
            .unwrap();
        manager
            .register_factory(Arc::new(RecordingFactory::new("b", &["x.a", "x.b"], &["x.out"])))
            .unwrap();

        assert_eq!(manager.incoming_capabilities(), vec!["x.a", "x.b"]);
        assert_eq!(manager.outgoing_capabilities(), vec!["x.out"]);
    }

    #[test]
    fn test_unregister_factory() {
        let mut manager = PluginManager::new();
        manager
            .register_factory(Arc::new(RecordingFactory::new("a", &["x.a"], &[])))
            .unwrap();

        assert!(manager.unregister_factory("a").is_some());
        assert!(manager.unregister_factory("a").is_none());
        assert!(manager.list_plugins().is_empty());
    }

    #[test]
    fn test_context_send_fails_once_device_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = PluginContext::new(peer(&[], &[]), tx);
        drop(rx);

        let err = context
            .send(Packet::new("x.a", serde_json::json!({})))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_context_payload_server_uses_configured_ports() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let port = {
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let context = PluginContext::new(peer(&[], &[]), tx).with_payload_ports(port..=port);

        assert_eq!(context.payload_ports(), port..=port);
        let server = context.payload_server().await.unwrap();
        assert_eq!(server.port(), port);
    }
}
