use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::allocator;
use crate::client_config;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::keys;
use crate::nat::{self, PacketFilter, Removal};
use crate::store::{transact, Peer, PortForward, Protocol, Store};
use crate::wg::{self, SyncReport, WireguardDevice};

/// Request to create a peer.
#[derive(Debug, Clone, Default)]
pub struct NewPeer {
    pub name: String,
    pub use_as_exit_node: bool,
    /// Client-supplied key; the gateway generates a pair when `None`.
    pub public_key: Option<String>,
}

/// Request to create a port forward.
#[derive(Debug, Clone)]
pub struct NewPortForward {
    pub public_port: u16,
    pub target_node: String,
    pub target_port: u16,
    pub protocol: Protocol,
}

/// Every mutation of the roster or the forwards goes through here. Kernel
/// state is always recomputed from a fresh read of the store.
pub struct Registry {
    cfg: ServerConfig,
    store: Arc<dyn Store>,
    device: Arc<dyn WireguardDevice>,
    filter: Arc<dyn PacketFilter>,
}

impl Registry {
    pub fn new(
        cfg: ServerConfig,
        store: Arc<dyn Store>,
        device: Arc<dyn WireguardDevice>,
        filter: Arc<dyn PacketFilter>,
    ) -> Self {
        Self { cfg, store, device, filter }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    pub fn filter(&self) -> &dyn PacketFilter {
        self.filter.as_ref()
    }

    pub fn device(&self) -> &dyn WireguardDevice {
        self.device.as_ref()
    }

    pub fn list_peers(&self) -> Result<Vec<Peer>> {
        Ok(self.store.load()?.peers)
    }

    pub fn list_port_forwards(&self) -> Result<Vec<PortForward>> {
        Ok(self.store.load()?.port_forwards)
    }

    pub fn peer(&self, id: u64) -> Result<Peer> {
        self.store
            .load()?
            .peer(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("peer {id}")))
    }

    /// Reloads every peer and pushes the roster to the device.
    pub fn sync(&self) -> Result<SyncReport> {
        let peers = self.store.load()?.peers;
        wg::sync_peers(self.device.as_ref(), &self.cfg, &peers)
    }

    /**
     * @brief Create a peer: allocate an address, persist, reconcile.
     * @param req Name, exit-node flag and optional client public key.
     * @return The stored peer.
     *
     * Allocation and insert run in one store update so two concurrent
     * creations never get the same address. If the device rejects the new
     * roster the row is deleted again.
     */
    pub fn create_peer(&self, req: NewPeer) -> Result<Peer> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::validation("peer name must not be empty"));
        }
        let pair = match req.public_key {
            Some(public_b64) => {
                keys::validate_public_key_b64(&public_b64)?;
                keys::KeyPair { private_b64: String::new(), public_b64: public_b64.trim().to_string() }
            }
            None => keys::generate_key_pair(),
        };
        let subnet = self.cfg.subnet()?;
        let gateway = self.cfg.gateway_address()?.to_string();

        let peer = transact(self.store.as_ref(), |records| {
            if records.peers.iter().any(|p| p.name == name) {
                return Err(Error::validation(format!("peer name {name:?} is already in use")));
            }
            if records.peers.iter().any(|p| p.public_key == pair.public_b64) {
                return Err(Error::validation("public key is already registered"));
            }
            let mut used: Vec<String> = records.peers.iter().map(|p| p.assigned_address.clone()).collect();
            used.push(gateway.clone());
            let assigned_address = allocator::allocate(&subnet, &used)?;
            let peer = Peer {
                id: records.allocate_id(),
                name: name.clone(),
                public_key: pair.public_b64.clone(),
                private_key: (!pair.private_b64.is_empty()).then(|| pair.private_b64.clone()),
                assigned_address,
                enabled: true,
                use_as_exit_node: req.use_as_exit_node,
            };
            records.peers.push(peer.clone());
            Ok(peer)
        })?;
        log::info!("Created peer {} ({}) at {}", peer.name, peer.id, peer.assigned_address);

        if let Err(e) = self.sync() {
            log::error!("Kernel rejected roster with new peer {}: {e}; rolling back", peer.name);
            self.store.update(&mut |records| {
                records.peers.retain(|p| p.id != peer.id);
                Ok(())
            })?;
            return Err(e);
        }
        Ok(peer)
    }

    /**
     * @brief Toggle whether a peer is on the device without deleting it.
     * @param id Peer id.
     * @param enabled New state.
     *
     * The stored flag is the source of truth: a failed reconcile is returned
     * but the flag stays, and the next sync converges on it.
     */
    pub fn set_peer_enabled(&self, id: u64, enabled: bool) -> Result<Peer> {
        let peer = transact(self.store.as_ref(), |records| {
            let peer = records
                .peers
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or_else(|| Error::NotFound(format!("peer {id}")))?;
            peer.enabled = enabled;
            Ok(peer.clone())
        })?;
        log::info!("Peer {} {}", peer.name, if enabled { "enabled" } else { "disabled" });
        self.sync()?;
        Ok(peer)
    }

    /**
     * @brief Delete a peer, its port forwards, and reconcile.
     * @param id Peer id.
     * @return Warnings from kernel cleanup; deletion itself always completes.
     *
     * The peer row and every forward aimed at it leave the store in one
     * update, so a forward created concurrently cannot outlive the peer.
     */
    pub fn delete_peer(&self, id: u64) -> Result<Vec<String>> {
        let (peer, drained) = transact(self.store.as_ref(), |records| {
            let peer = records
                .peer(id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("peer {id}")))?;
            let target = peer.host_address();
            let (drained, kept): (Vec<PortForward>, Vec<PortForward>) = records
                .port_forwards
                .drain(..)
                .partition(|pf| targets(pf, target, &peer.assigned_address));
            records.port_forwards = kept;
            records.peers.retain(|p| p.id != id);
            let drained = drained
                .iter()
                .enumerate()
                .map(|(i, pf)| {
                    let shared = records.port_forwards.iter().chain(&drained[i + 1..]).any(|o| o.shares_target(pf));
                    (pf.clone(), shared)
                })
                .collect::<Vec<_>>();
            Ok((peer, drained))
        })?;

        let mut warnings = Vec::new();
        for (pf, keep_shared) in &drained {
            warnings.extend(self.remove_rules(pf, *keep_shared).warnings);
        }
        log::info!("Deleted peer {} and {} port forwards", peer.name, drained.len());

        if let Err(e) = self.sync() {
            log::warn!("Failed to sync peers after deleting {}: {e}", peer.name);
            warnings.push(format!("peer sync: {e}"));
        }
        Ok(warnings)
    }

    /**
     * @brief Create a port forward: check, persist, install the rule triad.
     * @param req Public port, protocol, target address and port.
     *
     * The row is reserved first so a concurrent request for the same
     * port/protocol is rejected. If installing fails the row is dropped again.
     */
    pub fn create_port_forward(&self, req: NewPortForward) -> Result<PortForward> {
        if req.public_port == 0 || req.target_port == 0 {
            return Err(Error::validation("ports must be between 1 and 65535"));
        }
        let target: Ipv4Addr = req
            .target_node
            .trim()
            .parse()
            .map_err(|_| Error::validation(format!("target {:?} is not an IPv4 address", req.target_node)))?;
        let target_node = target.to_string();

        let pf = transact(self.store.as_ref(), |records| {
            if records.forward_on(req.public_port, req.protocol).is_some() {
                return Err(Error::validation(format!(
                    "public port {} ({}) is already in use",
                    req.public_port, req.protocol
                )));
            }
            if !records.peers.iter().any(|p| p.host_address() == Some(target)) {
                log::warn!("Port forward target {target_node} matches no known peer");
            }
            let pf = PortForward {
                id: records.allocate_id(),
                public_port: req.public_port,
                protocol: req.protocol,
                target_node: target_node.clone(),
                target_port: req.target_port,
            };
            records.port_forwards.push(pf.clone());
            Ok(pf)
        })?;

        if let Err(e) = nat::add_port_forward(
            self.filter.as_ref(),
            pf.public_port,
            &pf.target_node,
            pf.target_port,
            pf.protocol,
        ) {
            self.store.update(&mut |records| {
                records.port_forwards.retain(|p| p.id != pf.id);
                Ok(())
            })?;
            return Err(e);
        }
        Ok(pf)
    }

    /**
     * @brief Delete a port forward. Kernel cleanup problems are returned as
     *        warnings and never stop the row from being deleted.
     * @param id Port forward id.
     *
     * Rules shared with another forward onto the same target stay in place.
     */
    pub fn delete_port_forward(&self, id: u64) -> Result<Vec<String>> {
        let (pf, keep_shared) = transact(self.store.as_ref(), |records| {
            let pos = records
                .port_forwards
                .iter()
                .position(|p| p.id == id)
                .ok_or_else(|| Error::NotFound(format!("port forward {id}")))?;
            let pf = records.port_forwards.remove(pos);
            let shared = records.port_forwards.iter().any(|o| o.shares_target(&pf));
            Ok((pf, shared))
        })?;
        let removal = self.remove_rules(&pf, keep_shared);
        log::info!("Deleted port forward {}/{}", pf.public_port, pf.protocol);
        Ok(removal.warnings)
    }

    /// Client config text for a peer.
    pub fn client_config(&self, id: u64) -> Result<String> {
        client_config::render(&self.peer(id)?, &self.cfg)
    }

    fn remove_rules(&self, pf: &PortForward, keep_shared: bool) -> Removal {
        nat::remove_port_forward(
            self.filter.as_ref(),
            pf.public_port,
            &pf.target_node,
            pf.target_port,
            pf.protocol,
            keep_shared,
        )
    }
}

fn targets(pf: &PortForward, host: Option<Ipv4Addr>, assigned: &str) -> bool {
    match host {
        Some(ip) => allocator::parse_host(&pf.target_node) == Some(ip),
        None => pf.target_node == assigned,
    }
}
