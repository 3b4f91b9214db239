//! Persisted declarative model: peers and port forwards.
//!
//! The rest of the crate never caches rows across calls; every operation
//! reads a fresh snapshot or runs inside one serialized `update`.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use crate::allocator;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(Error::validation(format!("unsupported protocol {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    pub name: String,
    pub public_key: String,
    /// Only kept when the gateway generated the key pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Single host address, `a.b.c.d/32`.
    pub assigned_address: String,
    pub enabled: bool,
    pub use_as_exit_node: bool,
}

impl Peer {
    /// Assigned address without the prefix, as port forwards reference it.
    pub fn host_address(&self) -> Option<Ipv4Addr> {
        allocator::parse_host(&self.assigned_address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub id: u64,
    pub public_port: u16,
    pub protocol: Protocol,
    pub target_node: String,
    pub target_port: u16,
}

impl PortForward {
    /// Same target address, port and protocol, hence the same post-DNAT rules.
    pub fn shares_target(&self, other: &PortForward) -> bool {
        self.protocol == other.protocol && self.target_node == other.target_node && self.target_port == other.target_port
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Records {
    pub next_id: u64,
    pub peers: Vec<Peer>,
    pub port_forwards: Vec<PortForward>,
}

impl Records {
    pub fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn peer(&self, id: u64) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn forward_on(&self, public_port: u16, protocol: Protocol) -> Option<&PortForward> {
        self.port_forwards
            .iter()
            .find(|pf| pf.public_port == public_port && pf.protocol == protocol)
    }
}

/// Storage seam. `update` is one serialized read-modify-write: when the
/// closure fails nothing is persisted.
pub trait Store: Send + Sync {
    fn load(&self) -> Result<Records>;
    fn update(&self, f: &mut dyn FnMut(&mut Records) -> Result<()>) -> Result<()>;
}

/// Runs `f` inside `store.update` and hands back its value.
pub fn transact<T>(store: &dyn Store, mut f: impl FnMut(&mut Records) -> Result<T>) -> Result<T> {
    let mut out = None;
    store.update(&mut |records| {
        out = Some(f(records)?);
        Ok(())
    })?;
    out.ok_or_else(|| Error::Storage("update finished without a result".into()))
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Records) -> Self {
        Self { records: Mutex::new(records) }
    }
}

impl Store for MemoryStore {
    fn load(&self) -> Result<Records> {
        let records = self.records.lock().map_err(|_| poisoned())?;
        Ok(records.clone())
    }

    fn update(&self, f: &mut dyn FnMut(&mut Records) -> Result<()>) -> Result<()> {
        let mut records = self.records.lock().map_err(|_| poisoned())?;
        let mut draft = records.clone();
        f(&mut draft)?;
        *records = draft;
        Ok(())
    }
}

/// TOML file store. An exclusive `flock` on a sidecar file serializes
/// writers across processes, the mutex within this one.
pub struct FileStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), guard: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(&self) -> Result<File> {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(PathBuf::from(name))?;
        Ok(file)
    }

    fn read(&self) -> Result<Records> {
        if !self.path.exists() {
            return Ok(Records::default());
        }
        let s = fs::read_to_string(&self.path)?;
        Ok(toml::from_str(&s)?)
    }

    fn write(&self, records: &Records) -> Result<()> {
        let s = toml::to_string_pretty(records)?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, s)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Store for FileStore {
    fn load(&self) -> Result<Records> {
        let _held = self.guard.lock().map_err(|_| poisoned())?;
        let lock = self.lock_file()?;
        FileExt::lock_shared(&lock)?;
        self.read()
    }

    fn update(&self, f: &mut dyn FnMut(&mut Records) -> Result<()>) -> Result<()> {
        let _held = self.guard.lock().map_err(|_| poisoned())?;
        let lock = self.lock_file()?;
        FileExt::lock_exclusive(&lock)?;
        let mut records = self.read()?;
        f(&mut records)?;
        self.write(&records)
    }
}

fn poisoned() -> Error {
    Error::Storage("store lock poisoned".into())
}
