//! Ping Plugin
//!
//! Connectivity check between two paired devices.
//!
//! ## Protocol
//!
//! **Packet Type**: `kdeconnect.ping`, both incoming and outgoing.
//!
//! ```json
//! {
//!     "id": 1234567890,
//!     "type": "kdeconnect.ping",
//!     "body": {
//!         "message": "Optional message"
//!     }
//! }
//! ```
//!
//! The `message` field is optional. No reply is expected.

use crate::{Packet, Result};
use async_trait::async_trait;
use serde_json::json;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::{Affordance, Plugin, PluginContext, PluginFactory};

/// Packet type for pings
pub const PACKET_TYPE_PING: &str = "kdeconnect.ping";

const ACTION_SEND_PING: &str = "send_ping";

/// Ping plugin for connectivity testing
#[derive(Debug, Default)]
pub struct PingPlugin {
    context: Option<PluginContext>,

    /// Count of pings received
    pings_received: Arc<AtomicU64>,

    /// Count of pings sent
    pings_sent: Arc<AtomicU64>,

    last_message: Option<String>,
}

impl PingPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pings_received(&self) -> u64 {
        self.pings_received.load(Ordering::Relaxed)
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent.load(Ordering::Relaxed)
    }

    /// Message carried by the most recent ping, if it had one
    pub fn last_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }

    /// Build a ping packet
    ///
    /// ```rust
    /// use roundlink_protocol::plugins::ping::PingPlugin;
    ///
    /// let packet = PingPlugin::create_ping(Some("Hello!".to_string()));
    /// assert_eq!(packet.packet_type, "kdeconnect.ping");
    /// assert_eq!(packet.body["message"], "Hello!");
    /// ```
    pub fn create_ping(message: Option<String>) -> Packet {
        match message {
            Some(message) => Packet::new(PACKET_TYPE_PING, json!({ "message": message })),
            None => Packet::new(PACKET_TYPE_PING, json!({})),
        }
    }

    /// Send a ping to the device
    pub fn ping(&self, message: Option<String>) -> Result<()> {
        let context = self.context.as_ref().ok_or_else(|| {
            crate::ProtocolError::Plugin("ping plugin not initialized".to_string())
        })?;
        context.send(Self::create_ping(message))?;
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Plugin for PingPlugin {
    fn name(&self) -> &str {
        "ping"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PING.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PING.to_string()]
    }

    async fn init(&mut self, context: PluginContext) -> Result<()> {
        info!("Ping plugin initialized for device {}", context.device_id());
        self.context = Some(context);
        Ok(())
    }

    async fn handle_packet(&mut self, packet: &Packet) -> Result<bool> {
        if !packet.is_type(PACKET_TYPE_PING) {
            return Ok(false);
        }

        let count = self.pings_received.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_message = packet.get_body_field::<String>("message");

        match &self.last_message {
            Some(message) => info!("Received ping #{}: {}", count, message),
            None => debug!("Received ping #{}", count),
        }
        Ok(true)
    }

    fn affordances(&self) -> Vec<Affordance> {
        vec![Affordance::menu_entry("Send ping", ACTION_SEND_PING)]
    }

    fn activate(&mut self, action: &str) -> Result<()> {
        match action {
            ACTION_SEND_PING => self.ping(None),
            other => Err(crate::ProtocolError::Plugin(format!(
                "ping has no action {}",
                other
            ))),
        }
    }
}

/// Factory for creating ping plugin instances
#[derive(Debug, Clone, Copy)]
pub struct PingPluginFactory;

impl PluginFactory for PingPluginFactory {
    fn name(&self) -> &str {
        "ping"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PING.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PING.to_string()]
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(PingPlugin::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceInfo, DeviceType};
    use tokio::sync::mpsc;

    fn context() -> (PluginContext, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = DeviceInfo::new("ping_peer", "Peer", DeviceType::Phone, 1716);
        (PluginContext::new(peer, tx), rx)
    }

    #[tokio::test]
    async fn test_counts_received_pings() {
        let mut plugin = PingPlugin::new();
        let (context, _rx) = context();
        plugin.init(context).await.unwrap();

        let handled = plugin
            .handle_packet(&PingPlugin::create_ping(Some("hi".to_string())))
            .await
            .unwrap();
        assert!(handled);
        plugin
            .handle_packet(&PingPlugin::create_ping(None))
            .await
            .unwrap();

        assert_eq!(plugin.pings_received(), 2);
        assert_eq!(plugin.last_message(), None);
    }

    #[tokio::test]
    async fn test_ping_action_queues_packet() {
        let mut plugin = PingPlugin::new();
        let (context, mut rx) = context();
        plugin.init(context).await.unwrap();

        plugin.activate(ACTION_SEND_PING).unwrap();

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent, PingPlugin::create_ping(None));
        assert_eq!(plugin.pings_sent(), 1);
    }

    #[test]
    fn test_ping_before_init_fails() {
        assert!(PingPlugin::new().ping(None).is_err());
    }
}
