//! Paired device persistence
//!
//! A single JSON file holds one record per paired device:
//!
//! ```json
//! {
//!   "devices": [
//!     {
//!       "deviceId": "a1b2c3",
//!       "deviceName": "Pixel",
//!       "deviceType": "phone",
//!       "certificate": "-----BEGIN CERTIFICATE-----\n...",
//!       "pairedAt": 1700000000000
//!     }
//!   ]
//! }
//! ```
//!
//! The certificate is the pin. Its DER encoding survives a save/load cycle
//! byte for byte.

use crate::{current_timestamp, DeviceType, PeerCertificate, ProtocolError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// File name of the store inside the data directory
pub const PAIRED_DEVICES_FILE: &str = "paired_devices.json";

/// What is remembered about a paired device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDeviceRecord {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    #[serde(serialize_with = "serialize_pem", deserialize_with = "deserialize_pem")]
    pub certificate: PeerCertificate,
    /// UNIX milliseconds
    pub paired_at: i64,
}

impl PairedDeviceRecord {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        certificate: PeerCertificate,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            certificate,
            paired_at: current_timestamp(),
        }
    }
}

fn serialize_pem<S: Serializer>(cert: &PeerCertificate, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&cert.to_pem())
}

fn deserialize_pem<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<PeerCertificate, D::Error> {
    let pem = String::deserialize(deserializer)?;
    PeerCertificate::from_pem(&pem).map_err(serde::de::Error::custom)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    devices: Vec<PairedDeviceRecord>,
}

/// JSON file of paired devices
#[derive(Debug)]
pub struct PairedDeviceStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, PairedDeviceRecord>>,
}

impl PairedDeviceStore {
    /// Open the store at `path`, loading it if it exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut records = BTreeMap::new();

        if path.exists() {
            let json = fs::read_to_string(&path)?;
            let file: StoreFile = serde_json::from_str(&json).map_err(|e| {
                ProtocolError::Configuration(format!("corrupt device store {:?}: {}", path, e))
            })?;
            for record in file.devices {
                records.insert(record.device_id.clone(), record);
            }
            info!("Loaded {} paired devices from {:?}", records.len(), path);
        } else {
            debug!("No paired device store at {:?}", path);
        }

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, PairedDeviceRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// All records, ordered by device id
    pub fn records(&self) -> Vec<PairedDeviceRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn get(&self, device_id: &str) -> Option<PairedDeviceRecord> {
        self.lock().get(device_id).cloned()
    }

    /// Insert or replace a record and write the file
    pub fn upsert(&self, record: PairedDeviceRecord) -> Result<()> {
        let mut records = self.lock();
        debug!("Storing pin for {}", record.device_id);
        records.insert(record.device_id.clone(), record);
        self.write(&records)
    }

    /// Remove a record and write the file; returns whether it existed
    pub fn remove(&self, device_id: &str) -> Result<bool> {
        let mut records = self.lock();
        if records.remove(device_id).is_none() {
            return Ok(false);
        }
        debug!("Removed pin for {}", device_id);
        self.write(&records)?;
        Ok(true)
    }

    fn write(&self, records: &BTreeMap<String, PairedDeviceRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = StoreFile {
            devices: records.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
