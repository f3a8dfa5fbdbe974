//! Daemon Configuration
//!
//! TOML configuration for the RoundLink daemon, stored as `daemon.toml` in the
//! user's configuration directory and created with defaults on first start.

use anyhow::{bail, Context, Result};
use roundlink_protocol::discovery::{
    DEFAULT_BROADCAST_INTERVAL, DEFAULT_DEVICE_TIMEOUT, DISCOVERY_PORT,
};
use roundlink_protocol::link::DEFAULT_HANDSHAKE_TIMEOUT;
use roundlink_protocol::payload::{PAYLOAD_PORT_RANGE_END, PAYLOAD_PORT_RANGE_START};
use roundlink_protocol::registry::PAIRED_DEVICES_FILE;
use roundlink_protocol::{DeviceType, DiscoveryConfig, LinkConfig, PairingConfig, RegistryConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Name of the configuration file
pub const CONFIG_FILE: &str = "daemon.toml";

/// Default TCP port for incoming links
pub const DEFAULT_TCP_PORT: u16 = 1716;

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Device configuration
    pub device: DeviceConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Pairing configuration
    #[serde(default)]
    pub pairing: PairingSettings,

    /// Plugin configuration
    #[serde(default)]
    pub plugins: PluginConfig,

    /// Storage paths
    pub paths: PathConfig,
}

/// Device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name shown to peers
    pub name: String,

    /// Device type (desktop, laptop, phone, tablet, tv)
    #[serde(default = "default_device_type")]
    pub device_type: String,

    /// Device ID used when a new certificate has to be generated
    ///
    /// Once a certificate exists its common name is the device id and this
    /// setting is ignored.
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP discovery port
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// TCP port for incoming links
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// First port payload servers may bind
    #[serde(default = "default_transfer_port_start")]
    pub transfer_port_start: u16,

    /// Last port payload servers may bind
    #[serde(default = "default_transfer_port_end")]
    pub transfer_port_end: u16,

    /// Discovery broadcast interval in seconds
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval: u64,

    /// Seconds without an announcement before a device counts as gone
    #[serde(default = "default_device_timeout")]
    pub device_timeout: u64,

    /// Seconds allowed for each handshake step
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
}

/// Pairing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingSettings {
    /// Seconds a pairing request waits for an answer
    #[serde(default = "default_pairing_timeout")]
    pub timeout: u64,
}

/// Plugin configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_true")]
    pub enable_ping: bool,

    #[serde(default = "default_true")]
    pub enable_findremote: bool,

    #[serde(default = "default_true")]
    pub enable_presenter: bool,
}

/// Path configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Data directory (paired devices)
    pub data_dir: PathBuf,

    /// Certificate directory
    pub cert_dir: PathBuf,
}

fn default_device_type() -> String {
    DeviceType::Desktop.as_str().to_string()
}

fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_transfer_port_start() -> u16 {
    PAYLOAD_PORT_RANGE_START
}

fn default_transfer_port_end() -> u16 {
    PAYLOAD_PORT_RANGE_END
}

fn default_discovery_interval() -> u64 {
    DEFAULT_BROADCAST_INTERVAL.as_secs()
}

fn default_device_timeout() -> u64 {
    DEFAULT_DEVICE_TIMEOUT.as_secs()
}

fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_secs()
}

fn default_pairing_timeout() -> u64 {
    PairingConfig::default().timeout.as_secs()
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            tcp_port: default_tcp_port(),
            transfer_port_start: default_transfer_port_start(),
            transfer_port_end: default_transfer_port_end(),
            discovery_interval: default_discovery_interval(),
            device_timeout: default_device_timeout(),
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            timeout: default_pairing_timeout(),
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enable_ping: true,
            enable_findremote: true,
            enable_presenter: true,
        }
    }
}

/// `$XDG_CONFIG_HOME/roundlink`
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("roundlink")
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Unknown Device".to_string())
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = default_config_dir();
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("roundlink");
        let cert_dir = config_dir.join("certs");

        Self {
            device: DeviceConfig {
                name: local_hostname(),
                device_type: default_device_type(),
                device_id: None,
            },
            network: NetworkConfig::default(),
            pairing: PairingSettings::default(),
            plugins: PluginConfig::default(),
            paths: PathConfig {
                config_dir,
                data_dir,
                cert_dir,
            },
        }
    }
}

impl Config {
    /// Load the configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&default_config_dir().join(CONFIG_FILE))
    }

    /// Load the configuration from `path`, writing defaults there if missing
    ///
    /// A configuration created this way keeps its files next to `path`.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config
                .payload_ports()
                .with_context(|| format!("Invalid config file {}", path.display()))?;
            return Ok(config);
        }

        let mut config = Config::default();
        if let Some(dir) = path.parent() {
            if dir != default_config_dir() {
                config.paths = PathConfig {
                    config_dir: dir.to_path_buf(),
                    data_dir: dir.join("data"),
                    cert_dir: dir.join("certs"),
                };
            }
        }
        config.save_to(path)?;
        info!("Created default configuration at {}", path.display());
        Ok(config)
    }

    /// Save the configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir).context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.data_dir).context("Failed to create data directory")?;
        fs::create_dir_all(&self.paths.cert_dir)
            .context("Failed to create certificate directory")?;
        Ok(())
    }

    pub fn device_type(&self) -> DeviceType {
        DeviceType::parse(&self.device.device_type)
    }

    /// Path of the paired device store
    pub fn paired_devices_path(&self) -> PathBuf {
        self.paths.data_dir.join(PAIRED_DEVICES_FILE)
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            port: self.network.discovery_port,
            broadcast_addr: SocketAddr::from((Ipv4Addr::BROADCAST, self.network.discovery_port)),
            broadcast_interval: Duration::from_secs(self.network.discovery_interval),
            device_timeout: Duration::from_secs(self.network.device_timeout),
            ..DiscoveryConfig::default()
        }
    }

    /// Ports payload servers may bind; rejects an inverted range
    pub fn payload_ports(&self) -> Result<RangeInclusive<u16>> {
        let ports = self.network.transfer_port_start..=self.network.transfer_port_end;
        if ports.is_empty() {
            bail!(
                "transfer_port_start ({}) is greater than transfer_port_end ({})",
                ports.start(),
                ports.end()
            );
        }
        Ok(ports)
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            handshake_timeout: Duration::from_secs(self.network.handshake_timeout),
            ..LinkConfig::default()
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            store_path: Some(self.paired_devices_path()),
            pairing: PairingConfig {
                timeout: Duration::from_secs(self.pairing.timeout),
            },
            payload_ports: self.network.transfer_port_start..=self.network.transfer_port_end,
        }
    }
}
