use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use crate::config::{ensure_server_keys, load_server_config};
use crate::error::{Error, Result};
use crate::link::{self, IpLink, LinkManager};
use crate::nat::{self, Iptables};
use crate::peer_registry::Registry;
use crate::store::FileStore;
use crate::wg::{self, KernelWireguard, PeerStats, WireguardDevice};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// What the startup replay managed to put back. Failures never stop startup;
/// they are counted here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub port_forwards_restored: usize,
    pub port_forwards_failed: usize,
    pub peers_synced: usize,
    pub peer_sync_failed: bool,
    pub errors: Vec<String>,
}

impl RestoreReport {
    pub fn failed_replays(&self) -> usize {
        self.port_forwards_failed + usize::from(self.peer_sync_failed)
    }

    pub fn is_healthy(&self) -> bool {
        self.failed_replays() == 0 && self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub interface_ready: bool,
    pub firewall_ready: bool,
    pub restore: RestoreReport,
}

impl StartupReport {
    /// Running, but not everything the store describes is in the kernel.
    pub fn degraded(&self) -> bool {
        !self.interface_ready || !self.firewall_ready || !self.restore.is_healthy()
    }
}

/**
 * @brief Replay persisted port forwards and peers into the kernel.
 * @param registry Registry wired to the store and kernel seams.
 */
pub fn restore(registry: &Registry) -> RestoreReport {
    let mut report = RestoreReport::default();

    match registry.list_port_forwards() {
        Ok(forwards) => {
            for pf in forwards {
                match nat::add_port_forward(
                    registry.filter(),
                    pf.public_port,
                    &pf.target_node,
                    pf.target_port,
                    pf.protocol,
                ) {
                    Ok(()) => report.port_forwards_restored += 1,
                    Err(e) => {
                        log::warn!(
                            "Failed to restore port forward {}/{} -> {}:{}: {e}",
                            pf.public_port,
                            pf.protocol,
                            pf.target_node,
                            pf.target_port
                        );
                        report.port_forwards_failed += 1;
                    }
                }
            }
        }
        Err(e) => {
            log::error!("Could not load port forwards: {e}");
            report.errors.push(format!("load port forwards: {e}"));
        }
    }

    match registry.list_peers() {
        Ok(peers) => match wg::sync_peers(registry.device(), registry.config(), &peers) {
            Ok(sync) => report.peers_synced = sync.active,
            Err(e) => {
                log::warn!("Failed to sync initial peers: {e}");
                report.peer_sync_failed = true;
            }
        },
        Err(e) => {
            log::error!("Could not load peers: {e}");
            report.errors.push(format!("load peers: {e}"));
        }
    }

    if report.is_healthy() {
        log::info!(
            "Restored {} port forwards and {} peers",
            report.port_forwards_restored,
            report.peers_synced
        );
    } else {
        log::warn!("Startup restore finished with {} failed replays", report.failed_replays());
    }
    report
}

/**
 * @brief Boot sequence: device, firewall baseline, then replay of stored state.
 *
 * Nothing here is fatal; a host without the needed privileges still gets a
 * running control plane, reported as degraded.
 */
pub fn boot(registry: &Registry, links: &dyn LinkManager) -> StartupReport {
    let cfg = registry.config();
    let mut report = StartupReport::default();

    match link::setup_interface(links, cfg) {
        Ok(()) => report.interface_ready = true,
        Err(e) => log::warn!("Interface setup failed: {e} (may require root/NET_ADMIN)"),
    }

    if cfg.nat_enabled {
        match cfg.subnet().and_then(|subnet| nat::setup_firewall(registry.filter(), &subnet)) {
            Ok(()) => report.firewall_ready = true,
            Err(e) => log::warn!("Firewall setup failed: {e}"),
        }
    } else {
        report.firewall_ready = true;
    }

    report.restore = restore(registry);
    report
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { public_key: String, address: String },
    Disconnected { public_key: String, address: String },
}

/// Turns periodic device reads into connect/disconnect transitions.
#[derive(Debug, Default)]
pub struct ConnectionMonitor {
    online: HashMap<String, String>,
}

impl ConnectionMonitor {
    pub fn observe(&mut self, stats: &[PeerStats], now: SystemTime) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        let mut seen = HashMap::new();
        for s in stats.iter().filter(|s| s.is_connected(now)) {
            let address = s.allowed_ips.first().cloned().unwrap_or_else(|| "unknown".to_string());
            if !self.online.contains_key(&s.public_key) {
                events.push(ConnectionEvent::Connected { public_key: s.public_key.clone(), address: address.clone() });
            }
            seen.insert(s.public_key.clone(), address);
        }
        for (public_key, address) in self.online.drain() {
            if !seen.contains_key(&public_key) {
                events.push(ConnectionEvent::Disconnected { public_key, address });
            }
        }
        self.online = seen;
        events
    }
}

/**
 * @brief Run the gateway until Ctrl+C.
 * @param config_path Server config file, `server.toml` when `None`.
 */
pub fn start(config_path: Option<PathBuf>) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        log::info!("Ctrl+C received, shutting down");
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| Error::External(format!("signal handler: {e}")))?;

    let cfg = ensure_server_keys(load_server_config(config_path.clone())?, config_path)?;
    let links = IpLink;
    let device = Arc::new(KernelWireguard::new(&cfg)?);
    let registry = Registry::new(
        cfg.clone(),
        Arc::new(FileStore::new(&cfg.state_path)),
        device.clone(),
        Arc::new(Iptables::default()),
    );

    let report = boot(&registry, &links);
    if report.degraded() {
        log::warn!("Gateway running in degraded mode: {report:?}");
    }
    println!("WireGuard gateway is LIVE on UDP {}!", cfg.listen_port);
    println!("Server public key: {}", cfg.server_public_key_b64()?);

    let mut monitor = ConnectionMonitor::default();
    while running.load(Ordering::SeqCst) {
        thread::sleep(POLL_INTERVAL);
        let stats = match device.peer_stats() {
            Ok(stats) => stats,
            Err(e) => {
                log::debug!("Reading device stats failed: {e}");
                continue;
            }
        };
        for event in monitor.observe(&stats, SystemTime::now()) {
            match event {
                ConnectionEvent::Connected { public_key, address } => {
                    log::info!("Client connected: {address} ({public_key})")
                }
                ConnectionEvent::Disconnected { public_key, address } => {
                    log::info!("Client disconnected: {address} ({public_key})")
                }
            }
        }
    }

    if let Err(e) = links.delete_link(&cfg.interface_name) {
        log::warn!("Failed to remove {}: {e}", cfg.interface_name);
    }
    println!("Gateway stopped cleanly.");
    Ok(())
}
