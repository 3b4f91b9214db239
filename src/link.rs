use std::process::{Command, Output};

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Link-layer operations on the host's network devices.
pub trait LinkManager: Send + Sync {
    fn link_exists(&self, name: &str) -> Result<bool>;
    fn create_link(&self, name: &str, kind: &str) -> Result<()>;
    fn delete_link(&self, name: &str) -> Result<()>;
    fn assign_address(&self, name: &str, cidr: &str) -> Result<()>;
    fn set_link_up(&self, name: &str) -> Result<()>;
}

pub const WIREGUARD_LINK_KIND: &str = "wireguard";

/**
 * @brief Recreate the WireGuard device from scratch.
 * @param links Host link manager.
 * @param cfg Server configuration (interface name and address).
 *
 * An existing device with the same name is always deleted first, together
 * with whatever state someone else left on it.
 */
pub fn setup_interface(links: &dyn LinkManager, cfg: &ServerConfig) -> Result<()> {
    let name = cfg.interface_name.as_str();
    if links.link_exists(name)? {
        log::info!("Interface {name} already exists, deleting for a clean state");
        links
            .delete_link(name)
            .map_err(|e| Error::kernel(format!("delete existing {name}: {e}")))?;
    }
    links
        .create_link(name, WIREGUARD_LINK_KIND)
        .map_err(|e| Error::kernel(format!("create {name}: {e}")))?;
    links
        .assign_address(name, &cfg.address_cidr)
        .map_err(|e| Error::kernel(format!("assign {} to {name}: {e}", cfg.address_cidr)))?;
    links
        .set_link_up(name)
        .map_err(|e| Error::kernel(format!("set {name} up: {e}")))?;
    log::info!("Interface {name} initialized with address {}", cfg.address_cidr);
    Ok(())
}

/// `ip link` / `ip addr` from iproute2.
#[derive(Default)]
pub struct IpLink;

impl IpLink {
    fn ip(&self, args: &[&str]) -> Result<Output> {
        Command::new("ip").args(args).output().map_err(|e| Error::kernel(format!("ip: {e}")))
    }

    fn ip_checked(&self, args: &[&str]) -> Result<()> {
        let out = self.ip(args)?;
        if !out.status.success() {
            return Err(Error::kernel(String::from_utf8_lossy(&out.stderr).trim().to_string()));
        }
        Ok(())
    }
}

impl LinkManager for IpLink {
    fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(self.ip(&["link", "show", "dev", name])?.status.success())
    }

    fn create_link(&self, name: &str, kind: &str) -> Result<()> {
        self.ip_checked(&["link", "add", "dev", name, "type", kind])
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        self.ip_checked(&["link", "del", "dev", name])
    }

    fn assign_address(&self, name: &str, cidr: &str) -> Result<()> {
        self.ip_checked(&["addr", "add", cidr, "dev", name])
    }

    fn set_link_up(&self, name: &str) -> Result<()> {
        self.ip_checked(&["link", "set", "dev", name, "up"])
    }
}
