//! RoundLink Daemon
//!
//! Background service that announces this machine on the local network,
//! accepts and opens authenticated links, and hands them to the device
//! registry. Pairing decisions and plugin traffic are handled by the
//! registry's devices; the daemon only wires the pieces together.

mod config;
mod diagnostics;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use diagnostics::{Cli, Command};
use roundlink_protocol::identity::{identity_paths, new_device_id};
use roundlink_protocol::plugins::findremote::FindRemotePluginFactory;
use roundlink_protocol::plugins::ping::PingPluginFactory;
use roundlink_protocol::plugins::presenter::PresenterPluginFactory;
use roundlink_protocol::{
    CertificateInfo, DeviceEvent, DeviceInfo, DeviceRegistry, DiscoveryEvent, DiscoveryService,
    ErrorCategory, Link, LinkConfig, LinkListener, PairedDeviceStore, PluginManager,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Load the local identity, generating one on first start
fn load_identity(config: &Config) -> Result<CertificateInfo> {
    let (cert_path, key_path) = identity_paths(&config.paths.cert_dir);

    if cert_path.exists() && key_path.exists() {
        let cert = CertificateInfo::load_from_files(&cert_path, &key_path)
            .context("Failed to load device certificate")?;
        if let Some(configured) = &config.device.device_id {
            if configured != &cert.device_id {
                warn!(
                    "Configured device id {} ignored; certificate belongs to {}",
                    configured, cert.device_id
                );
            }
        }
        return Ok(cert);
    }

    let device_id = config
        .device
        .device_id
        .clone()
        .unwrap_or_else(new_device_id);
    let cert =
        CertificateInfo::generate(device_id).context("Failed to generate device certificate")?;
    cert.save_to_files(&cert_path, &key_path)
        .context("Failed to save device certificate")?;
    info!("Generated new identity {}", cert.device_id);
    Ok(cert)
}

/// Build the plugin manager from the enabled plugins
fn plugin_manager(config: &Config) -> Result<PluginManager> {
    let mut manager = PluginManager::new();
    if config.plugins.enable_ping {
        manager.register_factory(Arc::new(PingPluginFactory))?;
    }
    if config.plugins.enable_findremote {
        manager.register_factory(Arc::new(FindRemotePluginFactory))?;
    }
    if config.plugins.enable_presenter {
        manager.register_factory(Arc::new(PresenterPluginFactory))?;
    }
    info!("Registered plugins: {:?}", manager.list_plugins());
    Ok(manager)
}

/// Device ids with an outbound connection attempt in flight
type Dialing = Arc<Mutex<HashSet<String>>>;

struct Daemon {
    certificate: CertificateInfo,
    device_info: DeviceInfo,
    link_config: LinkConfig,
    registry: Arc<DeviceRegistry>,
    listener: Arc<LinkListener>,
    discovery: Arc<DiscoveryService>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    async fn new(config: Config) -> Result<Self> {
        config.ensure_directories()?;

        let certificate = load_identity(&config)?;
        let plugins = Arc::new(plugin_manager(&config)?);

        let listener = LinkListener::bind(config.network.tcp_port)
            .await
            .context("Failed to bind link listener")?;
        let tcp_port = listener.local_addr()?.port();

        let device_info = DeviceInfo::new(
            certificate.device_id.clone(),
            config.device.name.clone(),
            config.device_type(),
            tcp_port,
        )
        .with_incoming_capabilities(plugins.incoming_capabilities())
        .with_outgoing_capabilities(plugins.outgoing_capabilities());

        let registry = DeviceRegistry::open(config.registry_config(), plugins)
            .await
            .context("Failed to open device registry")?;

        let discovery = DiscoveryService::new(device_info.clone(), config.discovery_config())
            .await
            .context("Failed to create discovery service")?;

        Ok(Self {
            certificate,
            device_info,
            link_config: config.link_config(),
            registry: Arc::new(registry),
            listener: Arc::new(listener),
            discovery: Arc::new(discovery),
            tasks: Vec::new(),
        })
    }

    /// Log registry events
    fn start_event_logger(&mut self) {
        let mut events = self.registry.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::PairingRequested {
                        device_id,
                        device_name,
                        fingerprint,
                    }) => {
                        info!(
                            "Pairing requested by {} ({}), fingerprint {}",
                            device_name, device_id, fingerprint
                        );
                    }
                    Ok(event) if event.needs_attention() => warn!("{:?}", event),
                    Ok(event) => debug!("{:?}", event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event logger lagged, {} events skipped", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Accept incoming links
    ///
    /// Each handshake runs on its own task.
    fn start_listener(&mut self) {
        let listener = self.listener.clone();
        let registry = self.registry.clone();
        let certificate = self.certificate.clone();
        let local = self.device_info.clone();
        let link_config = self.link_config.clone();

        self.tasks.push(tokio::spawn(async move {
            loop {
                let incoming = match listener.accept().await {
                    Ok(incoming) => incoming,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                let registry = registry.clone();
                let certificate = certificate.clone();
                let local = local.clone();
                let link_config = link_config.clone();
                tokio::spawn(async move {
                    let addr = incoming.remote_addr();
                    match incoming.handshake(&certificate, &local, &link_config).await {
                        Ok(link) => attach(&registry, link).await,
                        Err(e) => handshake_failed(&registry, None, addr, &e),
                    }
                });
            }
        }));
    }

    /// Start discovery and open links to announced devices
    ///
    /// Only the side with the smaller device id dials, so two daemons never
    /// race each other with crossing connections.
    async fn start_discovery(&mut self) -> Result<()> {
        let mut events = self.discovery.subscribe();
        self.discovery
            .start()
            .await
            .context("Failed to start discovery service")?;
        info!("Discovery service started on port {}", self.discovery.local_port()?);

        let registry = self.registry.clone();
        let certificate = self.certificate.clone();
        let local = self.device_info.clone();
        let link_config = self.link_config.clone();
        let dialing: Dialing = Arc::new(Mutex::new(HashSet::new()));

        self.tasks.push(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Discovery handler lagged, {} events skipped", n);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match &event {
                    DiscoveryEvent::DeviceDiscovered { info, address }
                    | DiscoveryEvent::DeviceUpdated { info, address } => {
                        let device = registry.observe(info.clone(), *address).await;
                        if device.is_reachable() || local.device_id >= info.device_id {
                            continue;
                        }
                        let Some(addr) = event.connect_addr() else {
                            debug!("{} announced no TCP port", info.device_id);
                            continue;
                        };
                        dial(
                            &registry,
                            &certificate,
                            &local,
                            info.clone(),
                            addr,
                            &link_config,
                            &dialing,
                        );
                    }
                    DiscoveryEvent::DeviceTimeout { device_id } => {
                        debug!("{} stopped announcing", device_id);
                    }
                    DiscoveryEvent::Error { message } => warn!("Discovery error: {}", message),
                    DiscoveryEvent::ServiceStarted { .. } | DiscoveryEvent::ServiceStopped => {}
                }
            }
            info!("Discovery event handler stopped");
        }));

        Ok(())
    }

    async fn run(&self) -> Result<()> {
        info!(
            "RoundLink daemon running as {} ({})",
            self.device_info.device_name, self.device_info.device_id
        );
        info!("Certificate fingerprint: {}", self.certificate.fingerprint);
        info!("Links on {}", self.listener.local_addr()?);
        info!(
            "Device registry: {} devices, {} paired",
            self.registry.device_count().await,
            self.registry.paired_devices().await.len()
        );

        tokio::signal::ctrl_c()
            .await
            .context("Failed to wait for shutdown signal")?;
        info!("Received shutdown signal");
        Ok(())
    }

    async fn shutdown(self) {
        self.discovery.stop();
        for task in &self.tasks {
            task.abort();
        }
        self.registry.shutdown().await;
        info!("Daemon stopped");
    }
}

/// Open an outbound link unless one is already being opened
fn dial(
    registry: &Arc<DeviceRegistry>,
    certificate: &CertificateInfo,
    local: &DeviceInfo,
    peer: DeviceInfo,
    addr: SocketAddr,
    link_config: &LinkConfig,
    dialing: &Dialing,
) {
    {
        let mut in_flight = dialing.lock().unwrap_or_else(|p| p.into_inner());
        if !in_flight.insert(peer.device_id.clone()) {
            return;
        }
    }

    let registry = registry.clone();
    let certificate = certificate.clone();
    let local = local.clone();
    let link_config = link_config.clone();
    let dialing = dialing.clone();
    tokio::spawn(async move {
        debug!("Connecting to {} at {}", peer.device_id, addr);
        match Link::connect(addr, &certificate, &local, &peer, &link_config).await {
            Ok(link) => attach(&registry, link).await,
            Err(e) => handshake_failed(&registry, Some(&peer.device_id), addr, &e),
        }
        dialing
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&peer.device_id);
    });
}

async fn attach(registry: &DeviceRegistry, link: Link) {
    let device_id = link.device_id().to_string();
    if let Err(e) = registry.attach_link(link).await {
        warn!("Link to {} refused: {}", device_id, e);
    }
}

fn handshake_failed(
    registry: &DeviceRegistry,
    device_id: Option<&str>,
    addr: SocketAddr,
    error: &roundlink_protocol::ProtocolError,
) {
    if error.category() == ErrorCategory::Handshake {
        registry.report_incompatible(device_id, error);
    } else {
        debug!("Handshake with {} failed: {}", addr, error);
    }
}

fn show_identity(config: &Config) -> Result<()> {
    let cert = load_identity(config)?;
    println!("Device name:  {}", config.device.name);
    println!("Device type:  {}", config.device_type().as_str());
    println!("Device ID:    {}", cert.device_id);
    println!("Fingerprint:  {}", cert.fingerprint);
    Ok(())
}

fn list_paired(config: &Config) -> Result<()> {
    let store = PairedDeviceStore::open(config.paired_devices_path())
        .context("Failed to open paired device store")?;
    let records = store.records();

    if records.is_empty() {
        println!("No paired devices.");
        return Ok(());
    }

    for record in &records {
        println!(
            "{} ({}) - {}",
            record.device_name,
            record.device_id,
            record.device_type.as_str()
        );
        println!("  Fingerprint: {}", record.certificate.fingerprint());
    }
    println!("\nTotal: {} paired devices", records.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    match cli.command {
        Some(Command::ShowIdentity) => return show_identity(&config),
        Some(Command::ListPaired) => return list_paired(&config),
        None => {}
    }

    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    info!("Starting RoundLink daemon...");
    info!("Device name: {}", config.device.name);
    info!("Discovery port: {}", config.network.discovery_port);
    let payload_ports = config.payload_ports()?;
    info!(
        "Payload ports: {}-{}",
        payload_ports.start(),
        payload_ports.end()
    );

    let mut daemon = Daemon::new(config)
        .await
        .context("Failed to create daemon")?;

    daemon.start_event_logger();
    daemon.start_listener();
    daemon
        .start_discovery()
        .await
        .context("Failed to start discovery")?;

    let result = daemon.run().await;
    daemon.shutdown().await;

    if let Err(e) = &result {
        error!("Daemon error: {:#}", e);
    }
    result
}
