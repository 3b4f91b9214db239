use serde::{Deserialize, Serialize};
use std::{env, fs, net::Ipv4Addr, path::{Path, PathBuf}};

use crate::allocator;
use crate::error::{Error, Result};
use crate::keys;

pub const DEFAULT_CONFIG_PATH: &str = "server.toml";
const ENV_PREFIX: &str = "VPN_GATEWAY_";

/// Network parameters of the gateway. Treated as immutable while running.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub interface_name: String,
    /// Gateway address with the subnet prefix, e.g. `10.8.0.1/24`.
    pub address_cidr: String,
    pub listen_port: u16,
    /// Host or IP clients dial; written into exported client configs.
    pub public_endpoint: String,
    pub server_private_key_b64: Option<String>,
    pub state_path: String,
    pub nat_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interface_name: "wg0".into(),
            address_cidr: "10.8.0.1/24".into(),
            listen_port: 51820,
            public_endpoint: "127.0.0.1".into(),
            server_private_key_b64: None,
            state_path: "gateway-state.toml".into(),
            nat_enabled: true,
        }
    }
}

impl ServerConfig {
    /// Subnet the peers are allocated from, e.g. `10.8.0.0/24`.
    pub fn subnet(&self) -> Result<String> {
        Ok(allocator::parse_subnet(&self.address_cidr)?.trunc().to_string())
    }

    /// The gateway's own address, always reserved in the pool.
    pub fn gateway_address(&self) -> Result<Ipv4Addr> {
        Ok(allocator::parse_subnet(&self.address_cidr)?.addr())
    }

    pub fn server_public_key_b64(&self) -> Result<String> {
        let private = self
            .server_private_key_b64
            .as_deref()
            .ok_or_else(|| Error::Config("server private key is not set".into()))?;
        keys::public_key_from_private(private)
    }

    /// Applies `VPN_GATEWAY_*` environment overrides.
    fn apply_env(&mut self) -> Result<()> {
        let var = |name: &str| env::var(format!("{ENV_PREFIX}{name}")).ok();
        if let Some(v) = var("INTERFACE") {
            self.interface_name = v;
        }
        if let Some(v) = var("PORT") {
            self.listen_port = v
                .parse()
                .map_err(|_| Error::Config(format!("{ENV_PREFIX}PORT is not a port: {v}")))?;
        }
        if let Some(v) = var("ADDRESS") {
            self.address_cidr = v;
        }
        if let Some(v) = var("ENDPOINT") {
            self.public_endpoint = v;
        }
        if let Some(v) = var("PRIVATE_KEY") {
            self.server_private_key_b64 = Some(v);
        }
        if let Some(v) = var("STATE") {
            self.state_path = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.interface_name.is_empty() || self.interface_name.len() > 15 {
            return Err(Error::Config(format!("invalid interface name {:?}", self.interface_name)));
        }
        self.subnet().map_err(|e| Error::Config(e.to_string()))?;
        Ok(())
    }
}

/**
 * @brief Load the server configuration, writing defaults when the file is missing.
 * @param path Config file, `server.toml` when `None`.
 */
pub fn load_server_config(path: Option<PathBuf>) -> Result<ServerConfig> {
    let p = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut cfg = if !p.exists() {
        let def = ServerConfig::default();
        write_config(&p, &def)?;
        def
    } else {
        let s = fs::read_to_string(&p)?;
        toml::from_str(&s).map_err(|e| Error::Config(format!("{}: {e}", p.display())))?
    };
    cfg.apply_env()?;
    cfg.validate()?;
    Ok(cfg)
}

/**
 * @brief Make sure the server has a key pair, generating and persisting one if not.
 * @param cfg Loaded configuration.
 * @param path Config file to persist into, `server.toml` when `None`.
 */
pub fn ensure_server_keys(mut cfg: ServerConfig, path: Option<PathBuf>) -> Result<ServerConfig> {
    if cfg.server_private_key_b64.is_some() {
        return Ok(cfg);
    }
    let pair = keys::generate_key_pair();
    cfg.server_private_key_b64 = Some(pair.private_b64);
    let p = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    write_config(&p, &cfg)?;
    log::info!("Generated server key pair, public key {}", pair.public_b64);
    Ok(cfg)
}

fn write_config(p: &Path, cfg: &ServerConfig) -> Result<()> {
    let s = toml::to_string_pretty(cfg).map_err(|e| Error::Config(e.to_string()))?;
    fs::write(p, s)?;
    Ok(())
}
