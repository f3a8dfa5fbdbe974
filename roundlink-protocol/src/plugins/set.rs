use super::{Affordance, Plugin, PluginContext, PluginFactory};
use crate::{Packet, ProtocolError, Result};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// The plugin instances of one device and their packet routes
#[derive(Default)]
pub struct PluginSet {
    plugins: Vec<Box<dyn Plugin>>,
    routes: HashMap<String, Vec<usize>>,
}

/// Run a plugin future, turning a panic into an error
async fn contained<T>(plugin: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Plugin(format!("plugin {} panicked", plugin))),
    }
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, initialize and start one instance per factory
    ///
    /// Plugins that fail to initialize or start are left out.
    pub async fn build(factories: &[Arc<dyn PluginFactory>], context: &PluginContext) -> Self {
        let mut set = Self::new();

        for factory in factories {
            let name = factory.name().to_string();
            let mut plugin = factory.create();

            if let Err(e) = contained(&name, plugin.init(context.clone())).await {
                error!(
                    "Failed to initialize plugin {} for device {}: {}",
                    name,
                    context.device_id(),
                    e
                );
                continue;
            }
            if let Err(e) = contained(&name, plugin.start()).await {
                error!(
                    "Failed to start plugin {} for device {}: {}",
                    name,
                    context.device_id(),
                    e
                );
                continue;
            }

            set.insert(plugin);
        }

        info!(
            "Initialized {} plugins for device {}",
            set.len(),
            context.device_id()
        );
        set
    }

    fn insert(&mut self, plugin: Box<dyn Plugin>) {
        let index = self.plugins.len();
        for packet_type in plugin.incoming_capabilities() {
            let subscribers = self.routes.entry(packet_type).or_default();
            if !subscribers.contains(&index) {
                subscribers.push(index);
            }
        }
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugin names in delivery order
    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    /// Number of plugins subscribed to `packet_type`
    pub fn subscriber_count(&self, packet_type: &str) -> usize {
        self.routes.get(packet_type).map_or(0, Vec::len)
    }

    /// Deliver a packet to every subscribed plugin
    ///
    /// Returns how many handlers were invoked. A handler's return value,
    /// error or panic has no effect on delivery to the others.
    pub async fn dispatch(&mut self, packet: &Packet) -> usize {
        let Some(subscribers) = self.routes.get(&packet.packet_type) else {
            debug!("No plugin subscribed to {}", packet.packet_type);
            return 0;
        };

        for &index in subscribers {
            let plugin = &mut self.plugins[index];
            let name = plugin.name().to_string();

            match contained(&name, plugin.handle_packet(packet)).await {
                Ok(true) => debug!("Plugin {} handled {}", name, packet.packet_type),
                Ok(false) => debug!("Plugin {} ignored {}", name, packet.packet_type),
                Err(e) => warn!(
                    "Plugin {} failed handling {}: {}",
                    name, packet.packet_type, e
                ),
            }
        }

        subscribers.len()
    }

    /// Tell every plugin the device became reachable or unreachable
    pub async fn set_reachable(&mut self, reachable: bool) {
        for plugin in &mut self.plugins {
            let name = plugin.name().to_string();
            let notified = plugin
                .on_reachability_changed(reachable)
                .map(Ok::<(), ProtocolError>);
            if let Err(e) = contained(&name, notified).await {
                warn!("Plugin {} failed reachability update: {}", name, e);
            }
        }
    }

    /// Stop every plugin and empty the set
    pub async fn stop_all(&mut self) {
        self.routes.clear();
        for mut plugin in self.plugins.drain(..) {
            let name = plugin.name().to_string();
            if let Err(e) = contained(&name, plugin.stop()).await {
                warn!("Plugin {} failed to stop cleanly: {}", name, e);
            }
        }
    }

    /// Affordances of all plugins, tagged with the plugin name
    pub fn affordances(&self) -> Vec<(String, Affordance)> {
        self.plugins
            .iter()
            .flat_map(|p| {
                let name = p.name().to_string();
                p.affordances().into_iter().map(move |a| (name.clone(), a))
            })
            .collect()
    }

    /// Run an affordance action on the named plugin
    pub fn activate(&mut self, plugin: &str, action: &str) -> Result<()> {
        let target = self
            .plugins
            .iter_mut()
            .find(|p| p.name() == plugin)
            .ok_or_else(|| ProtocolError::Plugin(format!("no active plugin {}", plugin)))?;
        target.activate(action)
    }

    /// Borrow the first plugin of concrete type `P`
    pub fn get_mut<P: Plugin>(&mut self) -> Option<&mut P> {
        self.plugins
            .iter_mut()
            .find_map(|p| p.as_any_mut().downcast_mut::<P>())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{Behaviour, RecordingFactory};
    use super::*;
    use crate::{DeviceInfo, DeviceType};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn context() -> (PluginContext, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = DeviceInfo::new("set_peer", "Peer", DeviceType::Phone, 1716);
        (PluginContext::new(peer, tx), rx)
    }

    #[tokio::test]
    async fn test_multicast_reaches_every_subscriber_once() {
        let handles = Arc::new(RecordingFactory::new("handles", &["x.event"], &[]));
        let ignores = Arc::new(
            RecordingFactory::new("ignores", &["x.event"], &[]).behaving(|| Behaviour::Ignore),
        );
        let fails = Arc::new(
            RecordingFactory::new("fails", &["x.event"], &[]).behaving(|| Behaviour::Fail),
        );
        let panics = Arc::new(
            RecordingFactory::new("panics", &["x.event"], &[]).behaving(|| Behaviour::Panic),
        );
        let unrelated = Arc::new(RecordingFactory::new("unrelated", &["x.other"], &[]));

        let factories: Vec<Arc<dyn PluginFactory>> = vec![
            fails.clone(),
            panics.clone(),
            ignores.clone(),
            handles.clone(),
            unrelated.clone(),
        ];
        let (context, _rx) = context();
        let mut set = PluginSet::build(&factories, &context).await;

        let packet = Packet::new("x.event", json!({"n": 1}));
        assert_eq!(set.dispatch(&packet).await, 4);

        for recording in [
            &handles.recording,
            &ignores.recording,
            &fails.recording,
            &panics.recording,
        ] {
            assert_eq!(recording.packets(), vec![("x.event".to_string(), json!({"n": 1}))]);
        }
        assert!(unrelated.recording.packets().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_without_subscribers() {
        let (context, _rx) = context();
        let mut set = PluginSet::build(&[], &context).await;

        assert!(set.is_empty());
        assert_eq!(set.dispatch(&Packet::new("x.none", json!({}))).await, 0);
    }

    #[tokio::test]
    async fn test_stop_all_stops_and_clears() {
        let factory = Arc::new(RecordingFactory::new("a", &["x.a"], &[]));
        let factories: Vec<Arc<dyn PluginFactory>> = vec![factory.clone()];
        let (context, _rx) = context();
        let mut set = PluginSet::build(&factories, &context).await;

        set.set_reachable(true).await;
        set.stop_all().await;

        assert!(set.is_empty());
        assert_eq!(set.subscriber_count("x.a"), 0);
        assert_eq!(*factory.recording.stopped.lock().unwrap(), 1);
        assert_eq!(*factory.recording.reachability.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_activate_unknown_plugin() {
        let (context, _rx) = context();
        let mut set = PluginSet::build(&[], &context).await;

        assert!(set.activate("missing", "ring").is_err());
    }
}
