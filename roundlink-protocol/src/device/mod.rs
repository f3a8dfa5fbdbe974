//! Devices
//!
//! A [`Device`] is the durable representation of one peer. It outlives
//! individual connections: links come and go, the device keeps its identity,
//! pairing status and pinned certificate.
//!
//! ## Dispatch
//!
//! Every state change of a device goes through one unbounded queue drained by
//! a single task. Packets read by the link, pairing requests from the local
//! user, attached links and pairing timers are all handled there in arrival
//! order, so the pairing machine and the plugin set never see concurrent
//! updates.
//!
//! Plugins do not write to the link themselves. They queue packets on the
//! device's outbox, which a second task drains through [`Device::send`].
//!
//! ## Trust
//!
//! Once paired, the peer's certificate is pinned. A link presenting any other
//! certificate is closed on attach, the pin is dropped and the device falls
//! back to [`PairingStatus::NotPaired`].

mod events;
mod pairing;

pub use events::DeviceEvent;
pub use pairing::{
    pair_packet, PairingAction, PairingConfig, PairingFailure, PairingInput, PairingMachine,
    PairingStatus, PAIRING_TIMEOUT,
};

use crate::link::{Link, LinkEvent};
use crate::packet::{PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR};
use crate::plugins::{Affordance, PacketSender, Plugin, PluginContext, PluginManager, PluginSet};
use crate::registry::store::{PairedDeviceRecord, PairedDeviceStore};
use crate::{current_timestamp, DeviceInfo, Packet, PeerCertificate, ProtocolError, Result};
use std::cmp::Ordering;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a device shares with the registry that created it
#[derive(Clone)]
pub(crate) struct DeviceShared {
    pub plugins: Arc<PluginManager>,
    pub store: Option<Arc<PairedDeviceStore>>,
    pub events: broadcast::Sender<DeviceEvent>,
    pub pairing: PairingConfig,
    pub payload_ports: RangeInclusive<u16>,
}

struct DeviceState {
    info: DeviceInfo,
    machine: PairingMachine,
    pinned: Option<PeerCertificate>,
    paired_at: Option<i64>,
    last_address: Option<SocketAddr>,
}

enum DeviceMessage {
    Attach(Arc<Link>, oneshot::Sender<Result<()>>),
    Link(LinkEvent),
    Pairing(PairingInput, oneshot::Sender<Result<()>>),
    PairingTimeout(u64),
    Receive(Packet, oneshot::Sender<usize>),
    Announced(DeviceInfo, SocketAddr),
}

/// A known peer
pub struct Device {
    id: String,
    state: StdRwLock<DeviceState>,
    link: StdMutex<Option<Arc<Link>>>,
    plugins: Mutex<PluginSet>,
    queue: mpsc::UnboundedSender<DeviceMessage>,
    outbox: PacketSender,
    shared: DeviceShared,
    timer_epoch: AtomicU64,
    shutdown: CancellationToken,
}

impl Device {
    /// Create a device and start its dispatch and outbox tasks
    ///
    /// A device created with a pinned certificate starts out paired and
    /// unreachable.
    pub(crate) fn spawn(
        info: DeviceInfo,
        pin: Option<(PeerCertificate, i64)>,
        shared: DeviceShared,
    ) -> Arc<Self> {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();

        let status = if pin.is_some() {
            PairingStatus::Paired
        } else {
            PairingStatus::NotPaired
        };
        let (pinned, paired_at) = match pin {
            Some((cert, at)) => (Some(cert), Some(at)),
            None => (None, None),
        };

        let device = Arc::new(Self {
            id: info.device_id.clone(),
            state: StdRwLock::new(DeviceState {
                info,
                machine: PairingMachine::new(status),
                pinned,
                paired_at,
                last_address: None,
            }),
            link: StdMutex::new(None),
            plugins: Mutex::new(PluginSet::new()),
            queue,
            outbox,
            shared,
            timer_epoch: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_dispatch(
            Arc::downgrade(&device),
            queue_rx,
            device.shutdown.clone(),
        ));
        tokio::spawn(run_outbox(
            Arc::downgrade(&device),
            outbox_rx,
            device.shutdown.clone(),
        ));

        debug!("Device {} created ({})", device.id, status);
        device
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, DeviceState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, DeviceState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_link(&self) -> std::sync::MutexGuard<'_, Option<Arc<Link>>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Latest identity announced by the peer
    pub fn info(&self) -> DeviceInfo {
        self.read_state().info.clone()
    }

    pub fn name(&self) -> String {
        self.read_state().info.device_name.clone()
    }

    pub fn pairing_status(&self) -> PairingStatus {
        self.read_state().machine.status()
    }

    pub fn is_paired(&self) -> bool {
        self.pairing_status() == PairingStatus::Paired
    }

    /// Whether an authenticated link is attached
    pub fn is_reachable(&self) -> bool {
        self.link().is_some()
    }

    pub fn pinned_certificate(&self) -> Option<PeerCertificate> {
        self.read_state().pinned.clone()
    }

    /// When the current pairing was established, in UNIX milliseconds
    pub fn paired_at(&self) -> Option<i64> {
        self.read_state().paired_at
    }

    pub fn last_address(&self) -> Option<SocketAddr> {
        self.read_state().last_address
    }

    /// The attached link, if it is still authenticated
    pub fn link(&self) -> Option<Arc<Link>> {
        self.current_link()
            .as_ref()
            .filter(|link| link.is_authenticated())
            .cloned()
    }

    /// Compare the peer's protocol version with ours
    pub fn compare_protocol_version(&self) -> Ordering {
        self.read_state().info.compare_protocol_version()
    }

    /// Names of the active plugins in delivery order
    pub async fn plugin_names(&self) -> Vec<String> {
        self.plugins.lock().await.names()
    }

    /// Actions the active plugins offer, tagged with the plugin name
    pub async fn affordances(&self) -> Vec<(String, Affordance)> {
        self.plugins.lock().await.affordances()
    }

    /// Run an affordance action
    pub async fn activate(&self, plugin: &str, action: &str) -> Result<()> {
        self.plugins.lock().await.activate(plugin, action)
    }

    /// Run `f` on the active plugin of type `P`, if there is one
    pub async fn with_plugin<P, R>(&self, f: impl FnOnce(&mut P) -> R) -> Option<R>
    where
        P: Plugin,
    {
        self.plugins.lock().await.get_mut::<P>().map(f)
    }

    /// Write a packet to the peer
    ///
    /// Fails with [`ProtocolError::NotConnected`] when no authenticated link
    /// is attached, and with [`ProtocolError::NotPaired`] for anything but
    /// pair and identity packets while the device is not paired.
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        let link = self
            .link()
            .ok_or_else(|| ProtocolError::NotConnected(self.id.clone()))?;
        if !self.is_paired()
            && !packet.is_type(PACKET_TYPE_PAIR)
            && !packet.is_type(PACKET_TYPE_IDENTITY)
        {
            return Err(ProtocolError::NotPaired);
        }
        link.send(packet).await
    }

    /// Route a packet as if it had arrived on the link
    ///
    /// Returns the number of plugin handlers invoked.
    pub async fn receive(&self, packet: Packet) -> Result<usize> {
        self.call(|reply| DeviceMessage::Receive(packet, reply)).await
    }

    /// Ask the peer to pair
    pub async fn request_pairing(&self) -> Result<()> {
        self.pairing(PairingInput::LocalRequest).await
    }

    /// Accept the peer's pairing request
    pub async fn accept_pairing(&self) -> Result<()> {
        self.pairing(PairingInput::LocalAccept).await
    }

    /// Reject the peer's pairing request
    pub async fn reject_pairing(&self) -> Result<()> {
        self.pairing(PairingInput::LocalReject).await
    }

    /// Drop the pairing; works while unreachable
    pub async fn unpair(&self) -> Result<()> {
        self.pairing(PairingInput::LocalUnpair).await
    }

    /// Attach a freshly authenticated link, replacing any previous one
    ///
    /// The link's certificate is checked against the pin first. On mismatch
    /// the link is closed and [`ProtocolError::TrustViolation`] returned.
    pub async fn attach_link(&self, link: Link) -> Result<()> {
        if link.device_id() != self.id {
            return Err(ProtocolError::Handshake(format!(
                "link to {} cannot be attached to device {}",
                link.device_id(),
                self.id
            )));
        }
        let link = Arc::new(link);
        self.call(|reply| DeviceMessage::Attach(link, reply))
            .await?
    }

    /// Record a discovery announcement
    pub(crate) fn announced(&self, info: DeviceInfo, addr: SocketAddr) {
        if self.queue.send(DeviceMessage::Announced(info, addr)).is_err() {
            debug!("Announcement for stopped device {} ignored", self.id);
        }
    }

    /// Close the link and stop the plugins; the device stays known
    pub async fn disconnect(&self) {
        let link = self.current_link().clone();
        if let Some(link) = link {
            link.close().await;
        }
    }

    /// Stop everything the device runs
    pub(crate) async fn shutdown(&self) {
        self.timer_epoch.fetch_add(1, AtomicOrdering::SeqCst);
        self.shutdown.cancel();

        let link = self.current_link().take();
        if let Some(link) = link {
            link.close().await;
        }
        self.plugins.lock().await.stop_all().await;
        debug!("Device {} shut down", self.id);
    }

    async fn pairing(&self, input: PairingInput) -> Result<()> {
        self.call(|reply| DeviceMessage::Pairing(input, reply))
            .await?
    }

    async fn call<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> DeviceMessage,
    ) -> Result<T> {
        let (reply, result) = oneshot::channel();
        self.queue
            .send(message(reply))
            .map_err(|_| ProtocolError::Cancelled(format!("device {} stopped", self.id)))?;
        result
            .await
            .map_err(|_| ProtocolError::Cancelled(format!("device {} stopped", self.id)))
    }

    fn emit(&self, event: DeviceEvent) {
        // no subscribers is fine
        let _ = self.shared.events.send(event);
    }

    async fn handle_message(&self, message: DeviceMessage) {
        match message {
            DeviceMessage::Attach(link, reply) => {
                let _ = reply.send(self.handle_attach(link).await);
            }
            DeviceMessage::Link(LinkEvent::Packet { link_id, packet }) => {
                if self.is_current_link(link_id) {
                    self.process_packet(packet).await;
                } else {
                    debug!("Ignoring packet from stale link {}", link_id);
                }
            }
            DeviceMessage::Link(LinkEvent::Closed { link_id, reason }) => {
                self.handle_link_closed(link_id, &reason.to_string()).await;
            }
            DeviceMessage::Pairing(input, reply) => {
                let _ = reply.send(self.handle_pairing(input).await);
            }
            DeviceMessage::PairingTimeout(epoch) => {
                if epoch == self.timer_epoch.load(AtomicOrdering::SeqCst) {
                    info!("Pairing with {} timed out", self.id);
                    if let Err(e) = self.handle_pairing(PairingInput::Timeout).await {
                        warn!("Pairing timeout for {} failed: {}", self.id, e);
                    }
                }
            }
            DeviceMessage::Receive(packet, reply) => {
                let _ = reply.send(self.process_packet(packet).await);
            }
            DeviceMessage::Announced(info, addr) => {
                let reachable = self.link().is_some();
                let mut state = self.write_state();
                state.last_address = Some(addr);
                if !reachable {
                    state.info = info;
                }
            }
        }
    }

    fn is_current_link(&self, link_id: u64) -> bool {
        self.current_link()
            .as_ref()
            .is_some_and(|link| link.id() == link_id)
    }

    async fn handle_attach(&self, link: Arc<Link>) -> Result<()> {
        let pinned = self.pinned_certificate();
        if let Err(e) = link.verify_pin(pinned.as_ref()) {
            warn!("Rejecting link from {}: {}", self.id, e);
            link.close().await;

            if let ProtocolError::TrustViolation {
                expected,
                presented,
                ..
            } = &e
            {
                if let Err(e) = self.handle_pairing(PairingInput::TrustViolation).await {
                    warn!("Failed to revoke pairing with {}: {}", self.id, e);
                }
                self.emit(DeviceEvent::TrustViolation {
                    device_id: self.id.clone(),
                    expected: expected.clone(),
                    presented: presented.clone(),
                });
            }
            return Err(e);
        }

        let previous = self.current_link().replace(link.clone());
        if let Some(previous) = &previous {
            debug!("Replacing link {} to {}", previous.id(), self.id);
            previous.close().await;
        }

        let refresh_record = {
            let mut state = self.write_state();
            let peer = link.peer().clone();
            let renamed = state.info.device_name != peer.device_name
                || state.info.device_type != peer.device_type;
            state.info = peer;
            state.last_address = Some(link.remote_addr());
            renamed && state.machine.status() == PairingStatus::Paired
        };
        if refresh_record {
            self.persist_pin();
        }

        let queue = self.queue.clone();
        if let Err(e) = link.start(move |event| queue.send(DeviceMessage::Link(event)).is_ok()) {
            self.current_link().take();
            link.close().await;
            return Err(e);
        }

        info!("Device {} reachable at {}", self.id, link.remote_addr());
        if previous.is_none() {
            self.emit(DeviceEvent::ReachabilityChanged {
                device_id: self.id.clone(),
                reachable: true,
            });
        }

        if self.is_paired() {
            self.rebuild_plugins().await;
        }
        Ok(())
    }

    async fn handle_link_closed(&self, link_id: u64, reason: &str) {
        {
            let mut current = self.current_link();
            if !current.as_ref().is_some_and(|link| link.id() == link_id) {
                debug!("Stale link {} to {} closed", link_id, self.id);
                return;
            }
            current.take();
        }

        info!("Device {} unreachable: {}", self.id, reason);
        {
            let mut plugins = self.plugins.lock().await;
            plugins.set_reachable(false).await;
        }
        self.stop_plugins().await;

        self.emit(DeviceEvent::ReachabilityChanged {
            device_id: self.id.clone(),
            reachable: false,
        });
    }

    async fn process_packet(&self, packet: Packet) -> usize {
        if packet.is_type(PACKET_TYPE_PAIR) {
            match packet.get_body_field::<bool>("pair") {
                Some(pair) => {
                    if let Err(e) = self.handle_pairing(PairingInput::PeerPair(pair)).await {
                        warn!("Pair packet from {} not applied: {}", self.id, e);
                    }
                }
                None => warn!("Dropping pair packet from {} without pair field", self.id),
            }
            return 0;
        }

        if packet.is_type(PACKET_TYPE_IDENTITY) {
            self.handle_identity(&packet).await;
            return 0;
        }

        if !self.is_paired() {
            debug!(
                "Dropping {} from unpaired device {}",
                packet.packet_type, self.id
            );
            return 0;
        }

        self.plugins.lock().await.dispatch(&packet).await
    }

    async fn handle_identity(&self, packet: &Packet) {
        let mut announced = match DeviceInfo::from_identity_packet(packet) {
            Ok(info) => info,
            Err(e) => {
                warn!("Ignoring identity from {}: {}", self.id, e);
                return;
            }
        };
        if announced.device_id != self.id {
            warn!(
                "Device {} announced a different id {}",
                self.id, announced.device_id
            );
            return;
        }

        let changed = {
            let mut state = self.write_state();
            if announced.tcp_port.is_none() {
                announced.tcp_port = state.info.tcp_port;
            }
            let changed = !state.info.same_capabilities(&announced);
            state.info = announced;
            changed
        };

        if changed && self.is_paired() && self.link().is_some() {
            info!("Device {} changed capabilities, renegotiating plugins", self.id);
            self.rebuild_plugins().await;
        }
    }

    async fn handle_pairing(&self, input: PairingInput) -> Result<()> {
        // a certificate can only be pinned from the link seen here
        let link = self.link();
        if link.is_none() && input.needs_link() {
            return Err(ProtocolError::NotConnected(self.id.clone()));
        }

        let (before, actions) = {
            let mut state = self.write_state();
            let before = state.machine.status();
            let actions = state.machine.handle(input)?;
            (before, actions)
        };

        for action in actions {
            self.apply(action, link.as_deref()).await;
        }

        let after = self.pairing_status();
        if before != after {
            info!("Device {} pairing: {} -> {}", self.id, before, after);
            self.emit(DeviceEvent::PairingStateChanged {
                device_id: self.id.clone(),
                status: after,
            });

            if after == PairingStatus::Paired {
                if self.link().is_some() {
                    self.rebuild_plugins().await;
                }
            } else if before == PairingStatus::Paired {
                self.stop_plugins().await;
            }
        }
        Ok(())
    }

    async fn apply(&self, action: PairingAction, link: Option<&Link>) {
        match action {
            PairingAction::SendPair(pair) => {
                if let Err(e) = self.send(&pair_packet(pair)).await {
                    warn!("Failed to send pair={} to {}: {}", pair, self.id, e);
                }
            }
            PairingAction::StartTimer => {
                let epoch = self.timer_epoch.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                let queue = self.queue.clone();
                let timeout = self.shared.pairing.timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = queue.send(DeviceMessage::PairingTimeout(epoch));
                });
            }
            PairingAction::CancelTimer => {
                self.timer_epoch.fetch_add(1, AtomicOrdering::SeqCst);
            }
            PairingAction::PinCertificate => {
                let Some(link) = link else {
                    warn!("No link to pin a certificate for {}", self.id);
                    return;
                };
                {
                    let mut state = self.write_state();
                    state.pinned = Some(link.peer_certificate().clone());
                    state.paired_at = Some(current_timestamp());
                }
                info!(
                    "Pinned certificate {} for {}",
                    link.peer_certificate().fingerprint(),
                    self.id
                );
                self.persist_pin();
            }
            PairingAction::UnpinCertificate => {
                {
                    let mut state = self.write_state();
                    state.pinned = None;
                    state.paired_at = None;
                }
                if let Some(store) = &self.shared.store {
                    if let Err(e) = store.remove(&self.id) {
                        warn!("Failed to remove pin for {}: {}", self.id, e);
                    }
                }
            }
            PairingAction::NotifyRequested => {
                let fingerprint = link
                    .map(|link| link.peer_certificate().fingerprint())
                    .unwrap_or_default();
                self.emit(DeviceEvent::PairingRequested {
                    device_id: self.id.clone(),
                    device_name: self.name(),
                    fingerprint,
                });
            }
            PairingAction::NotifyFailed(reason) => {
                info!("Pairing with {} failed: {}", self.id, reason);
                self.emit(DeviceEvent::PairingFailed {
                    device_id: self.id.clone(),
                    reason,
                });
            }
        }
    }

    fn persist_pin(&self) {
        let Some(store) = &self.shared.store else {
            return;
        };
        let record = {
            let state = self.read_state();
            let Some(cert) = state.pinned.clone() else {
                return;
            };
            let mut record = PairedDeviceRecord::new(
                self.id.clone(),
                state.info.device_name.clone(),
                state.info.device_type,
                cert,
            );
            if let Some(at) = state.paired_at {
                record.paired_at = at;
            }
            record
        };
        if let Err(e) = store.upsert(record) {
            warn!("Failed to persist pin for {}: {}", self.id, e);
        }
    }

    async fn rebuild_plugins(&self) {
        let info = self.info();
        let factories = self.shared.plugins.compatible_factories(&info);
        let context = PluginContext::new(info, self.outbox.clone())
            .with_payload_ports(self.shared.payload_ports.clone());

        let names = {
            let mut plugins = self.plugins.lock().await;
            plugins.stop_all().await;
            let mut fresh = PluginSet::build(&factories, &context).await;
            fresh.set_reachable(true).await;
            let names = fresh.names();
            *plugins = fresh;
            names
        };

        if names.is_empty() {
            info!("No compatible plugins for {}", self.id);
        } else {
            info!("Plugins for {}: {}", self.id, names.join(", "));
        }
        self.emit(DeviceEvent::PluginsChanged {
            device_id: self.id.clone(),
            plugins: names,
        });
    }

    async fn stop_plugins(&self) {
        let had_plugins = {
            let mut plugins = self.plugins.lock().await;
            let had_plugins = !plugins.is_empty();
            plugins.stop_all().await;
            had_plugins
        };
        if had_plugins {
            self.emit(DeviceEvent::PluginsChanged {
                device_id: self.id.clone(),
                plugins: Vec::new(),
            });
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("status", &self.pairing_status())
            .field("reachable", &self.is_reachable())
            .finish()
    }
}

async fn run_dispatch(
    device: Weak<Device>,
    mut queue: mpsc::UnboundedReceiver<DeviceMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            message = queue.recv() => message,
            _ = shutdown.cancelled() => None,
        };
        let Some(message) = message else { break };
        let Some(device) = device.upgrade() else { break };
        device.handle_message(message).await;
    }
}

async fn run_outbox(
    device: Weak<Device>,
    mut outbox: mpsc::UnboundedReceiver<Packet>,
    shutdown: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            packet = outbox.recv() => packet,
            _ = shutdown.cancelled() => None,
        };
        let Some(packet) = packet else { break };
        let Some(device) = device.upgrade() else { break };
        if let Err(e) = device.send(&packet).await {
            warn!(
                "Dropping {} for {}: {}",
                packet.packet_type, device.id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::test_support::{link_pair, TestPeer};
    use crate::payload::default_payload_ports;
    use crate::plugins::ping::{PingPlugin, PingPluginFactory, PACKET_TYPE_PING};
    use crate::plugins::test_support::{Recording, RecordingFactory};
    use crate::{CertificateInfo, DeviceType, ErrorCategory, PluginFactory};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        device: Arc<Device>,
        events: broadcast::Receiver<DeviceEvent>,
        peer_link: Link,
        peer_rx: mpsc::UnboundedReceiver<LinkEvent>,
        recording: Arc<Recording>,
        _peer: TestPeer,
    }

    fn shared(factories: Vec<Arc<dyn PluginFactory>>, pairing_timeout: Duration) -> DeviceShared {
        let mut manager = PluginManager::new();
        for factory in factories {
            manager.register_factory(factory).unwrap();
        }
        let (events, _) = broadcast::channel(64);
        DeviceShared {
            plugins: Arc::new(manager),
            store: None,
            events,
            pairing: PairingConfig {
                timeout: pairing_timeout,
            },
            payload_ports: default_payload_ports(),
        }
    }

    async fn harness_with(
        tag: &str,
        pin: Option<PeerCertificate>,
        pairing_timeout: Duration,
    ) -> Harness {
        let local = TestPeer::new(&format!("{}_local", tag), "Local", DeviceType::Desktop);
        let mut peer = TestPeer::new(&format!("{}_peer", tag), "Peer", DeviceType::Phone);
        peer.info.outgoing_capabilities =
            vec!["x.battery".to_string(), PACKET_TYPE_PING.to_string()];
        peer.info.incoming_capabilities = vec![PACKET_TYPE_PING.to_string()];

        let battery = Arc::new(RecordingFactory::new("battery", &["x.battery"], &[]));
        let recording = battery.recording.clone();
        let factories: Vec<Arc<dyn PluginFactory>> = vec![battery, Arc::new(PingPluginFactory)];
        let shared = shared(factories, pairing_timeout);
        let events = shared.events.subscribe();

        let (local_link, peer_link) = link_pair(&local, &peer).await;
        let device = Device::spawn(
            local_link.peer().clone(),
            pin.map(|cert| (cert, current_timestamp())),
            shared,
        );

        let (tx, peer_rx) = mpsc::unbounded_channel();
        peer_link.start(move |event| tx.send(event).is_ok()).unwrap();

        let _ = device.attach_link(local_link).await;

        Harness {
            device,
            events,
            peer_link,
            peer_rx,
            recording,
            _peer: peer,
        }
    }

    async fn harness(tag: &str) -> Harness {
        harness_with(tag, None, PAIRING_TIMEOUT).await
    }

    async fn wait_event(
        events: &mut broadcast::Receiver<DeviceEvent>,
        mut matches: impl FnMut(&DeviceEvent) -> bool,
    ) -> DeviceEvent {
        timeout(WAIT, async {
            loop {
                let event = events.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for device event")
    }

    async fn peer_packet(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Packet {
        loop {
            match timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
                LinkEvent::Packet { packet, .. } => return packet,
                LinkEvent::Closed { .. } => panic!("peer link closed"),
            }
        }
    }

    async fn pair(h: &mut Harness) {
        h.device.request_pairing().await.unwrap();
        assert_eq!(peer_packet(&mut h.peer_rx).await, pair_packet(true));
        h.peer_link.send(&pair_packet(true)).await.unwrap();
        wait_event(&mut h.events, |e| {
            matches!(e, DeviceEvent::PluginsChanged { plugins, .. } if !plugins.is_empty())
        })
        .await;
    }

    #[tokio::test]
    async fn test_attach_makes_device_reachable() {
        let mut h = harness("dev_attach").await;

        assert!(h.device.is_reachable());
        assert_eq!(h.device.pairing_status(), PairingStatus::NotPaired);
        assert!(h.device.last_address().is_some());
        wait_event(&mut h.events, |e| {
            matches!(e, DeviceEvent::ReachabilityChanged { reachable: true, .. })
        })
        .await;
        assert!(h.device.plugin_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_local_request_and_peer_accept() {
        let mut h = harness("dev_pair").await;
        pair(&mut h).await;

        assert_eq!(h.device.pairing_status(), PairingStatus::Paired);
        assert_eq!(
            h.device.pinned_certificate().unwrap(),
            *h.device.link().unwrap().peer_certificate()
        );
        assert!(h.device.paired_at().is_some());
        assert_eq!(h.device.plugin_names().await, vec!["battery", "ping"]);
    }

    #[tokio::test]
    async fn test_peer_request_waits_for_user() {
        let mut h = harness("dev_peer_req").await;

        h.peer_link.send(&pair_packet(true)).await.unwrap();
        let event = wait_event(&mut h.events, |e| {
            matches!(e, DeviceEvent::PairingRequested { .. })
        })
        .await;
        match event {
            DeviceEvent::PairingRequested {
                device_name,
                fingerprint,
                ..
            } => {
                assert_eq!(device_name, "Peer");
                assert_eq!(
                    fingerprint,
                    h.device.link().unwrap().peer_certificate().fingerprint()
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(h.device.pairing_status(), PairingStatus::RequestedByPeer);

        h.device.accept_pairing().await.unwrap();
        assert_eq!(peer_packet(&mut h.peer_rx).await, pair_packet(true));
        assert!(h.device.is_paired());
    }

    #[tokio::test]
    async fn test_reject_sends_pair_false() {
        let mut h = harness("dev_reject").await;

        h.peer_link.send(&pair_packet(true)).await.unwrap();
        wait_event(&mut h.events, |e| {
            matches!(e, DeviceEvent::PairingRequested { .. })
        })
        .await;

        h.device.reject_pairing().await.unwrap();
        assert_eq!(peer_packet(&mut h.peer_rx).await, pair_packet(false));
        assert_eq!(h.device.pairing_status(), PairingStatus::NotPaired);
        assert!(h.device.pinned_certificate().is_none());
    }

    #[tokio::test]
    async fn test_unpaired_feature_packets_are_dropped() {
        let h = harness("dev_drop").await;

        let handled = h
            .device
            .receive(Packet::new("x.battery", json!({"charge": 42})))
            .await
            .unwrap();
        assert_eq!(handled, 0);
        assert!(h.recording.packets().is_empty());
    }

    #[tokio::test]
    async fn test_paired_packets_reach_plugins() {
        let mut h = harness("dev_route").await;
        pair(&mut h).await;

        h.peer_link
            .send(&Packet::new("x.battery", json!({"charge": 42})))
            .await
            .unwrap();
        h.peer_link
            .send(&Packet::new(PACKET_TYPE_PING, json!({})))
            .await
            .unwrap();

        timeout(WAIT, async {
            while h.device.with_plugin(|p: &mut PingPlugin| p.pings_received()).await != Some(1) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            h.recording.packets(),
            vec![("x.battery".to_string(), json!({"charge": 42}))]
        );
    }

    #[tokio::test]
    async fn test_plugins_write_through_outbox() {
        let mut h = harness("dev_outbox").await;
        pair(&mut h).await;

        h.device.activate("ping", "send_ping").await.unwrap();
        let packet = peer_packet(&mut h.peer_rx).await;
        assert_eq!(packet.packet_type, PACKET_TYPE_PING);
    }

    #[tokio::test]
    async fn test_send_requires_link() {
        let mut h = harness("dev_send").await;

        h.peer_link.close().await;
        wait_event(&mut h.events, |e| {
            matches!(e, DeviceEvent::ReachabilityChanged { reachable: false, .. })
        })
        .await;

        let err = h
            .device
            .send(&Packet::new(PACKET_TYPE_PING, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotConnected(_)));

        let err = h.device.request_pairing().await.unwrap_err();
        assert!(matches!(err, ProtocolError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_pair_answer_after_link_loss_does_not_pair() {
        let mut h = harness("dev_late_answer").await;
        h.device.request_pairing().await.unwrap();
        assert_eq!(peer_packet(&mut h.peer_rx).await, pair_packet(true));

        h.peer_link.close().await;
        wait_event(&mut h.events, |e| {
            matches!(e, DeviceEvent::ReachabilityChanged { reachable: false, .. })
        })
        .await;

        h.device.receive(pair_packet(true)).await.unwrap();
        assert!(!h.device.is_paired());
        assert!(h.device.pinned_certificate().is_none());
        assert!(h.device.paired_at().is_none());
    }

    #[tokio::test]
    async fn test_feature_send_requires_pairing() {
        let mut h = harness("dev_send_unpaired").await;

        let err = h
            .device
            .send(&Packet::new(PACKET_TYPE_PING, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotPaired));
        assert!(h.device.is_reachable());

        pair(&mut h).await;
        h.device
            .send(&Packet::new(PACKET_TYPE_PING, json!({})))
            .await
            .unwrap();
        assert_eq!(peer_packet(&mut h.peer_rx).await.packet_type, PACKET_TYPE_PING);
    }

    #[tokio::test]
    async fn test_disconnect_stops_plugins_but_keeps_pairing() {
        let mut h = harness("dev_disconnect").await;
        pair(&mut h).await;

        h.peer_link.close().await;
        wait_event(&mut h.events, |e| {
            matches!(e, DeviceEvent::ReachabilityChanged { reachable: false, .. })
        })
        .await;

        assert!(h.device.is_paired());
        assert!(h.device.plugin_names().await.is_empty());
        assert_eq!(*h.recording.stopped.lock().unwrap(), 1);
        assert_eq!(*h.recording.reachability.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_unpair_works_offline() {
        let mut h = harness("dev_unpair").await;
        pair(&mut h).await;
        h.device.disconnect().await;
        wait_event(&mut h.events, |e| {
            matches!(e, DeviceEvent::ReachabilityChanged { reachable: false, .. })
        })
        .await;

        h.device.unpair().await.unwrap();
        assert_eq!(h.device.pairing_status(), PairingStatus::NotPaired);
        assert!(h.device.pinned_certificate().is_none());
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let mut h = harness_with("dev_timeout", None, Duration::from_millis(100)).await;

        h.device.request_pairing().await.unwrap();
        let event = wait_event(&mut h.events, |e| {
            matches!(e, DeviceEvent::PairingFailed { .. })
        })
        .await;
        assert_eq!(
            event,
            DeviceEvent::PairingFailed {
                device_id: "dev_timeout_peer".to_string(),
                reason: PairingFailure::TimedOut,
            }
        );
        assert_eq!(h.device.pairing_status(), PairingStatus::NotPaired);
    }

    #[tokio::test]
    async fn test_answered_request_does_not_time_out() {
        let mut h = harness_with("dev_no_timeout", None, Duration::from_millis(100)).await;
        pair(&mut h).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.device.is_paired());
        while let Ok(event) = h.events.try_recv() {
            assert!(!matches!(event, DeviceEvent::PairingFailed { .. }));
        }
    }

    #[tokio::test]
    async fn test_wrong_certificate_is_a_trust_violation() {
        let impostor = CertificateInfo::generate("dev_trust_peer").unwrap();
        let mut h = harness_with(
            "dev_trust",
            Some(impostor.peer_certificate()),
            PAIRING_TIMEOUT,
        )
        .await;

        let event = wait_event(&mut h.events, |e| {
            matches!(e, DeviceEvent::TrustViolation { .. })
        })
        .await;
        match event {
            DeviceEvent::TrustViolation { expected, .. } => {
                assert_eq!(expected, impostor.peer_certificate().fingerprint());
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(h.device.pairing_status(), PairingStatus::NotPaired);
        assert!(h.device.pinned_certificate().is_none());
        assert!(!h.device.is_reachable());
        timeout(WAIT, h.peer_link.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_rejects_foreign_link() {
        let local = TestPeer::new("dev_foreign_local", "Local", DeviceType::Desktop);
        let peer = TestPeer::new("dev_foreign_peer", "Peer", DeviceType::Phone);
        let (local_link, _peer_link) = link_pair(&local, &peer).await;

        let other = DeviceInfo::new("dev_foreign_other", "Other", DeviceType::Phone, 1716);
        let device = Device::spawn(other, None, shared(vec![], PAIRING_TIMEOUT));

        let err = device.attach_link(local_link).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Handshake);
        assert!(!device.is_reachable());
    }

    #[tokio::test]
    async fn test_capability_change_renegotiates() {
        let mut h = harness("dev_caps").await;
        pair(&mut h).await;

        let mut announced = h.device.info();
        announced.outgoing_capabilities = vec![PACKET_TYPE_PING.to_string()];
        h.peer_link
            .send(&announced.to_identity_packet())
            .await
            .unwrap();

        let event = wait_event(&mut h.events, |e| {
            matches!(e, DeviceEvent::PluginsChanged { .. })
        })
        .await;
        assert_eq!(
            event,
            DeviceEvent::PluginsChanged {
                device_id: "dev_caps_peer".to_string(),
                plugins: vec!["ping".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn test_pair_packet_without_field_is_ignored() {
        let h = harness("dev_bad_pair").await;

        let handled = h
            .device
            .receive(Packet::new(PACKET_TYPE_PAIR, json!({"unexpected": 1})))
            .await
            .unwrap();
        assert_eq!(handled, 0);
        assert_eq!(h.device.pairing_status(), PairingStatus::NotPaired);
    }
}
