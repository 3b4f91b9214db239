use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use vpn_gateway::config::{ensure_server_keys, load_server_config, ServerConfig};
use vpn_gateway::nat::{self, Iptables};
use vpn_gateway::peer_registry::{NewPeer, NewPortForward, Registry};
use vpn_gateway::store::{FileStore, Protocol};
use vpn_gateway::wg::{KernelWireguard, WireguardDevice};
use vpn_gateway::{client_config, runtime};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Init => {
            let cfg = ensure_server_keys(load_server_config(cli.config.clone())?, cli.config)?;
            println!("Server public key: {}", cfg.server_public_key_b64()?);
        }
        Cmd::Start => {
            runtime::start(cli.config)?;
        }
        Cmd::AddPeer { name, exit_node, public_key } => {
            let registry = registry(cli.config)?;
            let peer = registry.create_peer(NewPeer { name, use_as_exit_node: exit_node, public_key })?;
            println!("{} {} {} {}", peer.id, peer.name, peer.assigned_address, peer.public_key);
        }
        Cmd::RemovePeer { id } => {
            let registry = registry(cli.config)?;
            for w in registry.delete_peer(id)? {
                eprintln!("warning: {w}");
            }
        }
        Cmd::EnablePeer { id } => {
            registry(cli.config)?.set_peer_enabled(id, true)?;
        }
        Cmd::DisablePeer { id } => {
            registry(cli.config)?.set_peer_enabled(id, false)?;
        }
        Cmd::ListPeers { json } => {
            let registry = registry(cli.config)?;
            let peers = registry.list_peers()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&peers)?);
            } else {
                for p in peers {
                    let state = if p.enabled { "enabled" } else { "disabled" };
                    let exit = if p.use_as_exit_node { " exit-node" } else { "" };
                    println!("{} {} {} {} {}{}", p.id, p.name, p.assigned_address, p.public_key, state, exit);
                }
            }
        }
        Cmd::AddForward { public_port, target_node, target_port, protocol } => {
            let registry = registry(cli.config)?;
            let protocol: Protocol = protocol.parse()?;
            let pf = registry.create_port_forward(NewPortForward { public_port, target_node, target_port, protocol })?;
            println!("{} {}/{} -> {}:{}", pf.id, pf.public_port, pf.protocol, pf.target_node, pf.target_port);
        }
        Cmd::RemoveForward { id } => {
            let registry = registry(cli.config)?;
            for w in registry.delete_port_forward(id)? {
                eprintln!("warning: {w}");
            }
        }
        Cmd::ListForwards { json } => {
            let registry = registry(cli.config)?;
            let forwards = registry.list_port_forwards()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&forwards)?);
            } else {
                for pf in forwards {
                    let state = nat::inspect_port_forward(
                        registry.filter(),
                        pf.public_port,
                        &pf.target_node,
                        pf.target_port,
                        pf.protocol,
                    )
                    .map(|s| format!("{s:?}"))
                    .unwrap_or_else(|e| format!("unknown ({e})"));
                    println!(
                        "{} {}/{} -> {}:{} {}",
                        pf.id, pf.public_port, pf.protocol, pf.target_node, pf.target_port, state
                    );
                }
            }
        }
        Cmd::ExportClientConfig { id, qr } => {
            let registry = registry(cli.config)?;
            let text = registry.client_config(id)?;
            println!("{}", text);
            if qr {
                println!("{}", client_config::render_qr(&text)?);
            }
        }
        Cmd::Status => {
            let registry = registry(cli.config)?;
            let peers = registry.list_peers()?;
            let now = SystemTime::now();
            for s in registry.device().peer_stats()? {
                let name = peers
                    .iter()
                    .find(|p| p.public_key == s.public_key)
                    .map(|p| p.name.as_str())
                    .unwrap_or("?");
                println!(
                    "{} {} {} {} KB {} KB",
                    name,
                    s.public_key,
                    s.is_connected(now),
                    s.tx_bytes / 1024,
                    s.rx_bytes / 1024
                );
            }
        }
    }
    Ok(())
}

fn registry(path: Option<PathBuf>) -> Result<Registry, Box<dyn std::error::Error>> {
    let cfg: ServerConfig = ensure_server_keys(load_server_config(path.clone())?, path)?;
    let device = KernelWireguard::new(&cfg)?;
    let store = FileStore::new(&cfg.state_path);
    Ok(Registry::new(cfg, Arc::new(store), Arc::new(device), Arc::new(Iptables::default())))
}

#[derive(Parser)]
#[command(name = "vpn-gateway")]
#[command(version, about = "Self-hosted WireGuard gateway control plane")]
struct Cli {
    /// Server config file (defaults to server.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    Init,
    Start,
    AddPeer {
        #[arg(long)]
        name: String,
        #[arg(long)]
        exit_node: bool,
        /// Client-generated public key; a key pair is generated when omitted
        #[arg(long)]
        public_key: Option<String>,
    },
    RemovePeer { id: u64 },
    EnablePeer { id: u64 },
    DisablePeer { id: u64 },
    ListPeers {
        #[arg(long)]
        json: bool,
    },
    AddForward {
        public_port: u16,
        target_node: String,
        target_port: u16,
        #[arg(long, default_value = "tcp")]
        protocol: String,
    },
    RemoveForward { id: u64 },
    ListForwards {
        #[arg(long)]
        json: bool,
    },
    ExportClientConfig {
        id: u64,
        #[arg(long)]
        qr: bool,
    },
    Status,
}
