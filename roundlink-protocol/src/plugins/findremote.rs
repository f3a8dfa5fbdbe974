//! Find Remote Device Plugin
//!
//! Makes the remote device ring so it can be located. Sending the request a
//! second time stops the ringing on the other side.
//!
//! **Capabilities**:
//! - Outgoing: `kdeconnect.findmyphone.request`

use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::any::Any;
use tracing::info;

use super::{Affordance, Plugin, PluginContext, PluginFactory};

/// Packet type for ring requests
pub const PACKET_TYPE_FINDMYPHONE_REQUEST: &str = "kdeconnect.findmyphone.request";

const ACTION_RING: &str = "ring";

#[derive(Debug, Default)]
pub struct FindRemotePlugin {
    context: Option<PluginContext>,
}

impl FindRemotePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_ring_request() -> Packet {
        Packet::new(PACKET_TYPE_FINDMYPHONE_REQUEST, json!({}))
    }

    /// Make the device ring, or stop it ringing
    pub fn ring(&self) -> Result<()> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| ProtocolError::Plugin("findremote not initialized".to_string()))?;
        info!("Ringing {}", context.device_id());
        context.send(Self::create_ring_request())
    }
}

#[async_trait]
impl Plugin for FindRemotePlugin {
    fn name(&self) -> &str {
        "findremote"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_FINDMYPHONE_REQUEST.to_string()]
    }

    async fn init(&mut self, context: PluginContext) -> Result<()> {
        self.context = Some(context);
        Ok(())
    }

    async fn handle_packet(&mut self, _packet: &Packet) -> Result<bool> {
        Ok(true)
    }

    fn affordances(&self) -> Vec<Affordance> {
        vec![Affordance::menu_entry("Ring device", ACTION_RING).with_icon("find-location-symbolic")]
    }

    fn activate(&mut self, action: &str) -> Result<()> {
        match action {
            ACTION_RING => self.ring(),
            other => Err(ProtocolError::Plugin(format!(
                "findremote has no action {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FindRemotePluginFactory;

impl PluginFactory for FindRemotePluginFactory {
    fn name(&self) -> &str {
        "findremote"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_FINDMYPHONE_REQUEST.to_string()]
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(FindRemotePlugin::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{is_factory_compatible, AffordanceKind};
    use crate::{DeviceInfo, DeviceType};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_ring_affordance_sends_request() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = DeviceInfo::new("ring_peer", "Phone", DeviceType::Phone, 1716);
        let mut plugin = FindRemotePlugin::new();
        plugin.init(PluginContext::new(peer, tx)).await.unwrap();

        let affordances = plugin.affordances();
        assert_eq!(affordances.len(), 1);
        assert_eq!(affordances[0].kind, AffordanceKind::MenuEntry);

        plugin.activate(&affordances[0].action).unwrap();
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.packet_type, PACKET_TYPE_FINDMYPHONE_REQUEST);
        assert!(sent.body.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_needs_peer_that_can_ring() {
        let phone = DeviceInfo::new("ring_phone", "Phone", DeviceType::Phone, 1716)
            .with_incoming_capability(PACKET_TYPE_FINDMYPHONE_REQUEST);
        let desktop = DeviceInfo::new("ring_desktop", "Desktop", DeviceType::Desktop, 1716);

        assert!(is_factory_compatible(&FindRemotePluginFactory, &phone));
        assert!(!is_factory_compatible(&FindRemotePluginFactory, &desktop));
    }
}
