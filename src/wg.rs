use base64::{engine::general_purpose, Engine as _};
use defguard_wireguard_rs::{host::Peer as WgPeer, key::Key, net::IpAddrMask, InterfaceConfiguration, Kernel, WGApi, WireguardInterfaceApi};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::keys;
use crate::store::Peer;

/// A handshake older than this means the peer is gone.
pub const CONNECTED_WINDOW: Duration = Duration::from_secs(180);

/// One peer entry of a device configuration call.
#[derive(Debug, Clone)]
pub struct PeerDirective {
    pub public_key: Key,
    /// The peer must be absent from the resulting roster.
    pub remove: bool,
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<IpAddrMask>,
}

/// Desired state of the whole device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Base64, already checked to decode to 32 bytes.
    pub private_key: String,
    pub listen_port: u16,
    /// Peers on the device but missing from `peers` get dropped.
    pub replace_peers: bool,
    pub peers: Vec<PeerDirective>,
}

impl DeviceConfig {
    /// Keys the device should carry once this config is applied.
    pub fn roster(&self) -> Vec<&Key> {
        self.peers.iter().filter(|d| !d.remove).map(|d| &d.public_key).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub last_handshake: Option<SystemTime>,
}

impl PeerStats {
    pub fn is_connected(&self, now: SystemTime) -> bool {
        self.last_handshake
            .and_then(|hs| now.duration_since(hs).ok())
            .map(|age| age < CONNECTED_WINDOW)
            .unwrap_or(false)
    }
}

/// Kernel WireGuard device seam.
pub trait WireguardDevice: Send + Sync {
    /// Applies `config` as one unit; either all of it lands or none of it.
    fn apply(&self, config: &DeviceConfig) -> Result<()>;
    fn peer_stats(&self) -> Result<Vec<PeerStats>>;
}

/// Result of a sync. Skipped peers are also logged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub active: usize,
    pub disabled: usize,
    pub skipped: Vec<String>,
}

/**
 * @brief Translate the persisted roster into one device configuration.
 * @param cfg Server configuration (private key, listen port).
 * @param peers Every persisted peer, enabled or not.
 * @return The configuration plus the names of peers that could not be translated.
 *
 * A bad server key fails the whole call. A bad peer key or address only skips
 * that peer. Disabled peers become explicit removals.
 */
pub fn desired_state(cfg: &ServerConfig, peers: &[Peer]) -> Result<(DeviceConfig, SyncReport)> {
    let private_key = cfg
        .server_private_key_b64
        .clone()
        .ok_or_else(|| Error::Config("server private key is not set".into()))?;
    keys::decode_key(&private_key).map_err(|e| Error::Config(format!("server private key: {e}")))?;

    let mut report = SyncReport::default();
    let mut directives = Vec::with_capacity(peers.len());
    for p in peers {
        let public_key = match keys::decode_key(&p.public_key) {
            Ok(bytes) => Key::new(bytes),
            Err(e) => {
                log::warn!("Skip peer {}: invalid public key: {e}", p.name);
                report.skipped.push(p.name.clone());
                continue;
            }
        };
        let allowed = match IpAddrMask::from_str(&p.assigned_address) {
            Ok(ip) => ip,
            Err(e) => {
                log::warn!("Skip peer {}: invalid allowed IP {:?}: {e}", p.name, p.assigned_address);
                report.skipped.push(p.name.clone());
                continue;
            }
        };
        if p.enabled {
            report.active += 1;
        } else {
            report.disabled += 1;
        }
        directives.push(PeerDirective {
            public_key,
            remove: !p.enabled,
            replace_allowed_ips: true,
            allowed_ips: vec![allowed],
        });
    }

    let config = DeviceConfig {
        private_key,
        listen_port: cfg.listen_port,
        replace_peers: true,
        peers: directives,
    };
    Ok((config, report))
}

/**
 * @brief Push the full peer roster to the device as a single replace.
 * @param device Kernel device.
 * @param cfg Server configuration.
 * @param peers Every persisted peer, freshly loaded by the caller.
 */
pub fn sync_peers(device: &dyn WireguardDevice, cfg: &ServerConfig, peers: &[Peer]) -> Result<SyncReport> {
    let (config, report) = desired_state(cfg, peers)?;
    device.apply(&config)?;
    log::info!(
        "Synchronized {} peers to {} ({} active, {} disabled, {} skipped)",
        peers.len(),
        cfg.interface_name,
        report.active,
        report.disabled,
        report.skipped.len()
    );
    Ok(report)
}

/// The kernel device, driven through defguard's netlink API.
pub struct KernelWireguard {
    ifname: String,
    address_cidr: String,
    api: WGApi<Kernel>,
}

impl KernelWireguard {
    pub fn new(cfg: &ServerConfig) -> Result<Self> {
        let api = WGApi::<Kernel>::new(cfg.interface_name.clone())
            .map_err(|e| Error::kernel(format!("WireGuard API for {}: {e}", cfg.interface_name)))?;
        Ok(Self { ifname: cfg.interface_name.clone(), address_cidr: cfg.address_cidr.clone(), api })
    }
}

impl WireguardDevice for KernelWireguard {
    fn apply(&self, config: &DeviceConfig) -> Result<()> {
        let peers: Vec<WgPeer> = config
            .peers
            .iter()
            .filter(|d| !d.remove)
            .map(|d| {
                let mut p = WgPeer::new(d.public_key.clone());
                p.allowed_ips = d.allowed_ips.clone();
                p
            })
            .collect();
        let address = IpAddrMask::from_str(&self.address_cidr)
            .map_err(|e| Error::Config(format!("interface address {}: {e}", self.address_cidr)))?;
        let interface = InterfaceConfiguration {
            name: self.ifname.clone(),
            prvkey: config.private_key.clone(),
            addresses: vec![address],
            port: config.listen_port as u32,
            peers,
            mtu: None,
        };
        self.api
            .configure_interface(&interface)
            .map_err(|e| Error::kernel(format!("configure {}: {e}", self.ifname)))?;

        // Enforce removal directives and replace semantics on whatever is left.
        let keep: HashSet<&Key> = config.roster().into_iter().collect();
        let host = self
            .api
            .read_interface_data()
            .map_err(|e| Error::kernel(format!("read {}: {e}", self.ifname)))?;
        for key in host.peers.keys() {
            let explicit = config.peers.iter().any(|d| d.remove && &d.public_key == key);
            if !keep.contains(key) && (config.replace_peers || explicit) {
                self.api
                    .remove_peer(key)
                    .map_err(|e| Error::kernel(format!("remove peer from {}: {e}", self.ifname)))?;
            }
        }
        Ok(())
    }

    fn peer_stats(&self) -> Result<Vec<PeerStats>> {
        let host = self
            .api
            .read_interface_data()
            .map_err(|e| Error::kernel(format!("read {}: {e}", self.ifname)))?;
        Ok(host
            .peers
            .iter()
            .map(|(k, p)| PeerStats {
                public_key: general_purpose::STANDARD.encode(k.as_slice()),
                allowed_ips: p.allowed_ips.iter().map(|ip| ip.to_string()).collect(),
                rx_bytes: p.rx_bytes,
                tx_bytes: p.tx_bytes,
                last_handshake: p.last_handshake,
            })
            .collect())
    }
}
