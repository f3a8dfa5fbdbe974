//! Device Registry
//!
//! The [`DeviceRegistry`] is the process-wide map of known devices. It creates
//! devices when they are first seen, hands them their links, forwards the
//! local user's pairing decisions and publishes every change as a
//! [`DeviceEvent`].
//!
//! ## Persistence
//!
//! Paired devices are written to a [`PairedDeviceStore`]. On startup each
//! stored record becomes a paired, unreachable device whose certificate is
//! already pinned, so the first link after a restart is verified exactly like
//! any later one.

pub mod store;

pub use store::{PairedDeviceRecord, PairedDeviceStore, PAIRED_DEVICES_FILE};

use crate::device::{Device, DeviceEvent, DeviceShared, PairingConfig};
use crate::payload::default_payload_ports;
use crate::{DeviceInfo, Link, PluginManager, ProtocolError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Capacity of the event channel; slow subscribers miss older events
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Registry settings
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Paired device file; `None` keeps pairings in memory only
    pub store_path: Option<PathBuf>,

    /// Pairing behaviour of every device
    pub pairing: PairingConfig,

    /// Ports plugins bind payload servers on
    pub payload_ports: RangeInclusive<u16>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            pairing: PairingConfig::default(),
            payload_ports: default_payload_ports(),
        }
    }
}

/// All known devices
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Device>>>,
    shared: DeviceShared,
}

impl DeviceRegistry {
    /// Create the registry, restoring paired devices from the store
    pub async fn open(config: RegistryConfig, plugins: Arc<PluginManager>) -> Result<Self> {
        let store = match &config.store_path {
            Some(path) => Some(Arc::new(PairedDeviceStore::open(path.clone())?)),
            None => None,
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = DeviceShared {
            plugins,
            store,
            events,
            pairing: config.pairing,
            payload_ports: config.payload_ports,
        };

        let mut devices = HashMap::new();
        if let Some(store) = &shared.store {
            for record in store.records() {
                let mut info = DeviceInfo::new(
                    record.device_id.clone(),
                    record.device_name.clone(),
                    record.device_type,
                    0,
                );
                info.tcp_port = None;
                let device = Device::spawn(
                    info,
                    Some((record.certificate, record.paired_at)),
                    shared.clone(),
                );
                debug!("Restored paired device {}", record.device_id);
                devices.insert(record.device_id, device);
            }
        }
        info!("Device registry opened with {} paired devices", devices.len());

        Ok(Self {
            devices: RwLock::new(devices),
            shared,
        })
    }

    /// Subscribe to device events
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    pub fn plugin_manager(&self) -> &Arc<PluginManager> {
        &self.shared.plugins
    }

    /// All known devices, ordered by id
    pub async fn devices(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<Arc<Device>> =
            self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn paired_devices(&self) -> Vec<Arc<Device>> {
        self.devices()
            .await
            .into_iter()
            .filter(|d| d.is_paired())
            .collect()
    }

    pub async fn reachable_devices(&self) -> Vec<Arc<Device>> {
        self.devices()
            .await
            .into_iter()
            .filter(|d| d.is_reachable())
            .collect()
    }

    async fn get_or_create(&self, info: &DeviceInfo) -> Arc<Device> {
        if let Some(device) = self.get(&info.device_id).await {
            return device;
        }

        let mut devices = self.devices.write().await;
        if let Some(device) = devices.get(&info.device_id) {
            return device.clone();
        }

        let device = Device::spawn(info.clone(), None, self.shared.clone());
        devices.insert(info.device_id.clone(), device.clone());
        drop(devices);

        info!("New device {} ({})", info.device_name, info.device_id);
        let _ = self.shared.events.send(DeviceEvent::Added {
            device_id: info.device_id.clone(),
        });
        device
    }

    /// Record a discovery announcement, creating the device if it is new
    pub async fn observe(&self, info: DeviceInfo, addr: SocketAddr) -> Arc<Device> {
        let device = self.get_or_create(&info).await;
        device.announced(info, addr);
        device
    }

    /// Hand an authenticated link to its device
    ///
    /// Creates the device on first contact. A trust violation is returned
    /// after the device has handled it.
    pub async fn attach_link(&self, link: Link) -> Result<Arc<Device>> {
        let device = self.get_or_create(link.peer()).await;
        device.attach_link(link).await?;
        Ok(device)
    }

    async fn require(&self, device_id: &str) -> Result<Arc<Device>> {
        self.get(device_id)
            .await
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))
    }

    pub async fn request_pairing(&self, device_id: &str) -> Result<()> {
        self.require(device_id).await?.request_pairing().await
    }

    pub async fn accept_pairing(&self, device_id: &str) -> Result<()> {
        self.require(device_id).await?.accept_pairing().await
    }

    pub async fn reject_pairing(&self, device_id: &str) -> Result<()> {
        self.require(device_id).await?.reject_pairing().await
    }

    pub async fn unpair(&self, device_id: &str) -> Result<()> {
        self.require(device_id).await?.unpair().await
    }

    /// Drop a device entirely
    ///
    /// Closes its link, stops its plugins and erases its pairing.
    pub async fn forget(&self, device_id: &str) -> Result<()> {
        let device = self
            .devices
            .write()
            .await
            .remove(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

        device.shutdown().await;
        if let Some(store) = &self.shared.store {
            if let Err(e) = store.remove(device_id) {
                warn!("Failed to erase {} from the store: {}", device_id, e);
            }
        }

        info!("Forgot device {}", device_id);
        let _ = self.shared.events.send(DeviceEvent::Removed {
            device_id: device_id.to_string(),
        });
        Ok(())
    }

    /// Publish a failed handshake
    pub fn report_incompatible(&self, device_id: Option<&str>, error: &ProtocolError) {
        warn!(
            "Incompatible peer {}: {}",
            device_id.unwrap_or("<unknown>"),
            error
        );
        let _ = self.shared.events.send(DeviceEvent::IncompatiblePeer {
            device_id: device_id.map(str::to_string),
            reason: error.to_string(),
        });
    }

    /// Stop every device
    pub async fn shutdown(&self) {
        let devices: Vec<Arc<Device>> = self
            .devices
            .write()
            .await
            .drain()
            .map(|(_, device)| device)
            .collect();
        for device in devices {
            device.shutdown().await;
        }
        info!("Device registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CertificateInfo, DeviceType, PairingStatus};
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    async fn in_memory() -> DeviceRegistry {
        DeviceRegistry::open(RegistryConfig::default(), Arc::new(PluginManager::new()))
            .await
            .unwrap()
    }

    fn addr() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 1716))
    }

    #[tokio::test]
    async fn test_observe_adds_once() {
        let registry = in_memory().await;
        let mut events = registry.subscribe();

        let info = DeviceInfo::new("reg_observe", "Phone", DeviceType::Phone, 1716);
        registry.observe(info.clone(), addr()).await;
        registry.observe(info, addr()).await;

        assert_eq!(registry.device_count().await, 1);
        assert_eq!(
            events.recv().await.unwrap(),
            DeviceEvent::Added {
                device_id: "reg_observe".to_string()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let registry = in_memory().await;

        let err = registry.request_pairing("nobody").await.unwrap_err();
        assert!(matches!(err, ProtocolError::DeviceNotFound(_)));
        assert!(registry.forget("nobody").await.is_err());
    }

    #[tokio::test]
    async fn test_restores_paired_devices() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PAIRED_DEVICES_FILE);
        let cert = CertificateInfo::generate("reg_restored").unwrap();
        PairedDeviceStore::open(&path)
            .unwrap()
            .upsert(PairedDeviceRecord::new(
                "reg_restored",
                "Tablet",
                DeviceType::Tablet,
                cert.peer_certificate(),
            ))
            .unwrap();

        let config = RegistryConfig {
            store_path: Some(path),
            ..Default::default()
        };
        let registry = DeviceRegistry::open(config, Arc::new(PluginManager::new()))
            .await
            .unwrap();

        let device = registry.get("reg_restored").await.unwrap();
        assert_eq!(device.pairing_status(), PairingStatus::Paired);
        assert!(!device.is_reachable());
        assert_eq!(device.name(), "Tablet");
        assert_eq!(device.pinned_certificate().unwrap(), cert.peer_certificate());
        assert_eq!(registry.paired_devices().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unpair_and_forget_update_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PAIRED_DEVICES_FILE);
        let store = PairedDeviceStore::open(&path).unwrap();
        for id in ["reg_unpair", "reg_forget"] {
            let cert = CertificateInfo::generate(id).unwrap();
            store
                .upsert(PairedDeviceRecord::new(id, id, DeviceType::Phone, cert.peer_certificate()))
                .unwrap();
        }

        let config = RegistryConfig {
            store_path: Some(path.clone()),
            ..Default::default()
        };
        let registry = DeviceRegistry::open(config, Arc::new(PluginManager::new()))
            .await
            .unwrap();
        let mut events = registry.subscribe();

        registry.unpair("reg_unpair").await.unwrap();
        assert_eq!(
            registry.get("reg_unpair").await.unwrap().pairing_status(),
            PairingStatus::NotPaired
        );

        registry.forget("reg_forget").await.unwrap();
        assert!(registry.get("reg_forget").await.is_none());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&DeviceEvent::PairingStateChanged {
            device_id: "reg_unpair".to_string(),
            status: PairingStatus::NotPaired,
        }));
        assert!(seen.contains(&DeviceEvent::Removed {
            device_id: "reg_forget".to_string(),
        }));

        assert!(PairedDeviceStore::open(&path).unwrap().records().is_empty());
    }

    #[tokio::test]
    async fn test_report_incompatible() {
        let registry = in_memory().await;
        let mut events = registry.subscribe();

        registry.report_incompatible(
            Some("reg_old"),
            &ProtocolError::ProtocolVersionMismatch("peer speaks 5".to_string()),
        );

        match events.recv().await.unwrap() {
            DeviceEvent::IncompatiblePeer { device_id, reason } => {
                assert_eq!(device_id.as_deref(), Some("reg_old"));
                assert!(reason.contains("peer speaks 5"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
