//! Presenter Plugin
//!
//! Turns this host into a presentation remote for a computer: slide
//! navigation through special keys and a laser pointer driven by movement
//! deltas.
//!
//! ## Protocol
//!
//! **Capabilities**:
//! - Outgoing: `kdeconnect.mousepad.request` - special keys
//! - Outgoing: `kdeconnect.presenter` - pointer movement and stop
//!
//! Phones cannot present, so the plugin is never attached to one.

use crate::{DeviceInfo, DeviceType, Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use tracing::debug;

use super::{Affordance, Plugin, PluginContext, PluginFactory};

/// Packet type for keyboard and mouse requests
pub const PACKET_TYPE_MOUSEPAD_REQUEST: &str = "kdeconnect.mousepad.request";

/// Packet type for pointer events
pub const PACKET_TYPE_PRESENTER: &str = "kdeconnect.presenter";

const ACTION_NEXT: &str = "next";
const ACTION_PREVIOUS: &str = "previous";
const ACTION_FULLSCREEN: &str = "fullscreen";
const ACTION_ESCAPE: &str = "escape";

/// Keys the receiving side maps to real key presses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKey {
    PageUp,
    PageDown,
    Escape,
    F5,
}

impl SpecialKey {
    /// Code used in the `specialKey` field
    pub fn code(self) -> i64 {
        match self {
            SpecialKey::PageUp => 8,
            SpecialKey::PageDown => 9,
            SpecialKey::Escape => 14,
            SpecialKey::F5 => 25,
        }
    }
}

/// Body of a `kdeconnect.presenter` packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dx: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dy: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<bool>,
}

#[derive(Debug, Default)]
pub struct PresenterPlugin {
    context: Option<PluginContext>,
    pointer_active: bool,
}

impl PresenterPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn special_key_packet(key: SpecialKey) -> Packet {
        Packet::new(PACKET_TYPE_MOUSEPAD_REQUEST, serde_json::json!({}))
            .with_body_field("specialKey", key.code())
    }

    pub fn pointer_packet(event: &PointerEvent) -> Result<Packet> {
        Ok(Packet::new(PACKET_TYPE_PRESENTER, serde_json::to_value(event)?))
    }

    fn context(&self) -> Result<&PluginContext> {
        self.context
            .as_ref()
            .ok_or_else(|| ProtocolError::Plugin("presenter not initialized".to_string()))
    }

    fn send_key(&self, key: SpecialKey) -> Result<()> {
        debug!("Presenter key {:?}", key);
        self.context()?.send(Self::special_key_packet(key))
    }

    pub fn next(&self) -> Result<()> {
        self.send_key(SpecialKey::PageDown)
    }

    pub fn previous(&self) -> Result<()> {
        self.send_key(SpecialKey::PageUp)
    }

    pub fn fullscreen(&self) -> Result<()> {
        self.send_key(SpecialKey::F5)
    }

    pub fn escape(&self) -> Result<()> {
        self.send_key(SpecialKey::Escape)
    }

    /// Move the laser pointer by a relative amount
    pub fn move_pointer(&mut self, dx: f32, dy: f32) -> Result<()> {
        let event = PointerEvent {
            dx: Some(f64::from(dx)),
            dy: Some(f64::from(dy)),
            stop: None,
        };
        self.context()?.send(Self::pointer_packet(&event)?)?;
        self.pointer_active = true;
        Ok(())
    }

    /// Hide the laser pointer
    pub fn stop_pointer(&mut self) -> Result<()> {
        let event = PointerEvent {
            dx: None,
            dy: None,
            stop: Some(true),
        };
        self.context()?.send(Self::pointer_packet(&event)?)?;
        self.pointer_active = false;
        Ok(())
    }

    pub fn is_pointer_active(&self) -> bool {
        self.pointer_active
    }
}

#[async_trait]
impl Plugin for PresenterPlugin {
    fn name(&self) -> &str {
        "presenter"
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
        vec![
            PACKET_TYPE_MOUSEPAD_REQUEST.to_string(),
            PACKET_TYPE_PRESENTER.to_string(),
        ]
    }

    async fn init(&mut self, context: PluginContext) -> Result<()> {
        self.context = Some(context);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.pointer_active = false;
        Ok(())
    }

    async fn handle_packet(&mut self, _packet: &Packet) -> Result<bool> {
        Ok(false)
    }

    fn affordances(&self) -> Vec<Affordance> {
        vec![
            Affordance::button("Next slide", ACTION_NEXT)
                .with_icon("x-office-presentation-symbolic"),
            Affordance::button("Previous slide", ACTION_PREVIOUS),
            Affordance::button("Fullscreen", ACTION_FULLSCREEN),
            Affordance::button("Exit", ACTION_ESCAPE),
        ]
    }

    fn activate(&mut self, action: &str) -> Result<()> {
        match action {
            ACTION_NEXT => self.next(),
            ACTION_PREVIOUS => self.previous(),
            ACTION_FULLSCREEN => self.fullscreen(),
            ACTION_ESCAPE => self.escape(),
            other => Err(ProtocolError::Plugin(format!(
                "presenter has no action {}",
                other
            ))),
        }
    }

    async fn on_reachability_changed(&mut self, reachable: bool) {
        if !reachable {
            self.pointer_active = false;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PresenterPluginFactory;

impl PluginFactory for PresenterPluginFactory {
    fn name(&self) -> &str {
        "presenter"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![
            PACKET_TYPE_MOUSEPAD_REQUEST.to_string(),
            PACKET_TYPE_PRESENTER.to_string(),
        ]
    }

    fn is_compatible(&self, peer: &DeviceInfo) -> bool {
        peer.device_type != DeviceType::Phone
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(PresenterPlugin::new())
    }
}
