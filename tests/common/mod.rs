#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use defguard_wireguard_rs::key::Key;
use vpn_gateway::config::ServerConfig;
use vpn_gateway::keys::generate_key_pair;
use vpn_gateway::link::LinkManager;
use vpn_gateway::nat::PacketFilter;
use vpn_gateway::peer_registry::Registry;
use vpn_gateway::store::{MemoryStore, Store};
use vpn_gateway::wg::{DeviceConfig, PeerStats, WireguardDevice};
use vpn_gateway::{Error, Result};

pub fn server_config() -> ServerConfig {
    ServerConfig {
        interface_name: "wgtest0".into(),
        public_endpoint: "gw.example.net".into(),
        server_private_key_b64: Some(generate_key_pair().private_b64),
        ..ServerConfig::default()
    }
}

/// In-memory WireGuard device with kernel replace semantics.
#[derive(Default)]
pub struct FakeDevice {
    pub roster: Mutex<HashMap<Key, Vec<String>>>,
    pub applies: Mutex<usize>,
    pub fail: Mutex<bool>,
}

impl FakeDevice {
    pub fn keys(&self) -> HashSet<Key> {
        self.roster.lock().unwrap().keys().cloned().collect()
    }

    pub fn contains_b64(&self, public_b64: &str) -> bool {
        let bytes = vpn_gateway::keys::decode_key(public_b64).unwrap();
        self.roster.lock().unwrap().contains_key(&Key::new(bytes))
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn apply_count(&self) -> usize {
        *self.applies.lock().unwrap()
    }
}

impl WireguardDevice for FakeDevice {
    fn apply(&self, config: &DeviceConfig) -> Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(Error::KernelApply("device busy".into()));
        }
        let mut roster = self.roster.lock().unwrap();
        let mut next = if config.replace_peers { HashMap::new() } else { roster.clone() };
        for d in &config.peers {
            if d.remove {
                next.remove(&d.public_key);
            } else {
                next.insert(d.public_key.clone(), d.allowed_ips.iter().map(|ip| ip.to_string()).collect());
            }
        }
        *roster = next;
        *self.applies.lock().unwrap() += 1;
        Ok(())
    }

    fn peer_stats(&self) -> Result<Vec<PeerStats>> {
        Ok(Vec::new())
    }
}

type RuleKey = (String, String, Vec<String>);

/// In-memory packet filter. Rules can be made to fail on append or delete by
/// matching a substring of their arguments.
#[derive(Default)]
pub struct FakeFilter {
    pub rules: Mutex<Vec<RuleKey>>,
    pub fail_append: Mutex<Option<String>>,
    pub fail_delete: Mutex<Option<String>>,
    pub forwarding: Mutex<bool>,
}

impl FakeFilter {
    pub fn count(&self) -> usize {
        self.rules.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<RuleKey> {
        self.rules.lock().unwrap().clone()
    }

    pub fn fail_append_matching(&self, needle: &str) {
        *self.fail_append.lock().unwrap() = Some(needle.to_string());
    }

    pub fn fail_delete_matching(&self, needle: &str) {
        *self.fail_delete.lock().unwrap() = Some(needle.to_string());
    }

    fn matches(needle: &Mutex<Option<String>>, table: &str, chain: &str, rule: &[String]) -> bool {
        match needle.lock().unwrap().as_deref() {
            Some(n) => format!("{table} {chain} {}", rule.join(" ")).contains(n),
            None => false,
        }
    }
}

impl PacketFilter for FakeFilter {
    fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool> {
        let key = (table.to_string(), chain.to_string(), rule.to_vec());
        Ok(self.rules.lock().unwrap().contains(&key))
    }

    fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        if Self::matches(&self.fail_append, table, chain, rule) {
            return Err(Error::KernelApply(format!("append refused in {table}/{chain}")));
        }
        self.rules.lock().unwrap().push((table.to_string(), chain.to_string(), rule.to_vec()));
        Ok(())
    }

    fn delete(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        if Self::matches(&self.fail_delete, table, chain, rule) {
            return Err(Error::KernelApply(format!("delete refused in {table}/{chain}")));
        }
        let key = (table.to_string(), chain.to_string(), rule.to_vec());
        let mut rules = self.rules.lock().unwrap();
        match rules.iter().position(|r| *r == key) {
            Some(i) => {
                rules.remove(i);
                Ok(())
            }
            None => Err(Error::KernelApply("Bad rule (does a matching rule exist in that chain?)".into())),
        }
    }

    fn enable_ip_forwarding(&self) -> Result<()> {
        *self.forwarding.lock().unwrap() = true;
        Ok(())
    }
}

/// Records link calls; optionally refuses to create links.
#[derive(Default)]
pub struct FakeLinks {
    pub links: Mutex<HashMap<String, Vec<String>>>,
    pub up: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<String>>,
    pub deny_create: Mutex<bool>,
}

impl LinkManager for FakeLinks {
    fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(self.links.lock().unwrap().contains_key(name))
    }

    fn create_link(&self, name: &str, kind: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("create {name} {kind}"));
        if *self.deny_create.lock().unwrap() {
            return Err(Error::KernelApply("Operation not permitted".into()));
        }
        self.links.lock().unwrap().insert(name.to_string(), Vec::new());
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("delete {name}"));
        self.links.lock().unwrap().remove(name);
        self.up.lock().unwrap().remove(name);
        Ok(())
    }

    fn assign_address(&self, name: &str, cidr: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("addr {name} {cidr}"));
        self.links
            .lock()
            .unwrap()
            .get_mut(name)
            .ok_or_else(|| Error::KernelApply(format!("no device {name}")))?
            .push(cidr.to_string());
        Ok(())
    }

    fn set_link_up(&self, name: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("up {name}"));
        self.up.lock().unwrap().insert(name.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub device: Arc<FakeDevice>,
    pub filter: Arc<FakeFilter>,
    pub registry: Registry,
}

pub fn harness() -> Harness {
    harness_with(server_config(), MemoryStore::new())
}

pub fn harness_with(cfg: ServerConfig, store: MemoryStore) -> Harness {
    let store = Arc::new(store);
    let device = Arc::new(FakeDevice::default());
    let filter = Arc::new(FakeFilter::default());
    let registry = Registry::new(
        cfg,
        store.clone() as Arc<dyn Store>,
        device.clone() as Arc<dyn WireguardDevice>,
        filter.clone() as Arc<dyn PacketFilter>,
    );
    Harness { store, device, filter, registry }
}
