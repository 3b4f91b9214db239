//! Packet-filter side of the gateway: IP forwarding, the subnet-wide
//! masquerade, and the three-rule mapping behind every port forward.

use std::fmt;
use std::process::Command;

use crate::error::{Error, Result};
use crate::store::Protocol;

/// Minimal rule vocabulary the gateway needs from the host firewall.
/// Rules are matched by exact argument list, so the same `Rule` must always
/// render to the same arguments.
pub trait PacketFilter: Send + Sync {
    fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool>;
    fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<()>;
    fn delete(&self, table: &str, chain: &str, rule: &[String]) -> Result<()>;
    fn enable_ip_forwarding(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Dnat,
    Masquerade,
    ForwardAccept,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleKind::Dnat => "DNAT",
            RuleKind::Masquerade => "MASQUERADE",
            RuleKind::ForwardAccept => "FORWARD-ACCEPT",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub kind: RuleKind,
    pub table: &'static str,
    pub chain: &'static str,
    pub args: Vec<String>,
}

impl Rule {
    fn new(kind: RuleKind, table: &'static str, chain: &'static str, args: &[&str]) -> Self {
        Self { kind, table, chain, args: args.iter().map(|s| s.to_string()).collect() }
    }
}

/// Where a port-forward mapping stands in the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Installation {
    Pending,
    Installed,
    Partial(Vec<RuleKind>),
}

/// Outcome of a removal. Removal never fails; problems end up in `warnings`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removal {
    pub removed: usize,
    pub warnings: Vec<String>,
}

/// Masquerade for everything sourced from the VPN subnet.
pub fn subnet_masquerade_rule(subnet: &str) -> Rule {
    Rule::new(RuleKind::Masquerade, "nat", "POSTROUTING", &["-s", subnet, "-j", "MASQUERADE"])
}

/**
 * @brief Build the DNAT, masquerade and forward-accept rules of one mapping.
 * @param public_port Port opened on the gateway.
 * @param target_node Peer address traffic is redirected to.
 * @param target_port Port on the peer.
 * @param protocol tcp or udp.
 */
pub fn port_forward_rules(
    public_port: u16,
    target_node: &str,
    target_port: u16,
    protocol: Protocol,
) -> [Rule; 3] {
    let proto = protocol.as_str();
    let public_port = public_port.to_string();
    let target_port = target_port.to_string();
    let destination = format!("{target_node}:{target_port}");
    [
        Rule::new(
            RuleKind::Dnat,
            "nat",
            "PREROUTING",
            &["-p", proto, "--dport", public_port.as_str(), "-j", "DNAT", "--to-destination", destination.as_str()],
        ),
        Rule::new(
            RuleKind::Masquerade,
            "nat",
            "POSTROUTING",
            &["-p", proto, "-d", target_node, "--dport", target_port.as_str(), "-j", "MASQUERADE"],
        ),
        Rule::new(
            RuleKind::ForwardAccept,
            "filter",
            "FORWARD",
            &["-p", proto, "-d", target_node, "--dport", target_port.as_str(), "-j", "ACCEPT"],
        ),
    ]
}

/// Appends `rule` unless an identical one is present. `Ok(true)` when appended.
pub fn append_unique(filter: &dyn PacketFilter, rule: &Rule) -> Result<bool> {
    if filter.exists(rule.table, rule.chain, &rule.args)? {
        return Ok(false);
    }
    filter.append(rule.table, rule.chain, &rule.args)?;
    Ok(true)
}

/// Deletes `rule` if present. `Ok(false)` when there was nothing to delete.
pub fn delete_if_present(filter: &dyn PacketFilter, rule: &Rule) -> Result<bool> {
    if !filter.exists(rule.table, rule.chain, &rule.args)? {
        return Ok(false);
    }
    filter.delete(rule.table, rule.chain, &rule.args)?;
    Ok(true)
}

/**
 * @brief Enable forwarding and masquerade the VPN subnet.
 * @param filter Host packet filter.
 * @param subnet VPN subnet, e.g. `10.8.0.0/24`.
 *
 * Forwarding is best effort. The masquerade rule is append-if-absent.
 */
pub fn setup_firewall(filter: &dyn PacketFilter, subnet: &str) -> Result<()> {
    if let Err(e) = filter.enable_ip_forwarding() {
        log::warn!("Failed to enable IP forwarding: {e}");
    }
    let rule = subnet_masquerade_rule(subnet);
    append_unique(filter, &rule).map_err(|e| Error::kernel(format!("subnet masquerade: {e}")))?;
    log::info!("Firewall baseline applied (masquerade {subnet})");
    Ok(())
}

/**
 * @brief Install the three rules of a port forward, all or nothing.
 *
 * Rules appended by this call are deleted again if a later one fails. If that
 * compensation also fails the leftover rules are reported in
 * `Error::PortForwardIncomplete`.
 */
pub fn add_port_forward(
    filter: &dyn PacketFilter,
    public_port: u16,
    target_node: &str,
    target_port: u16,
    protocol: Protocol,
) -> Result<()> {
    let rules = port_forward_rules(public_port, target_node, target_port, protocol);
    let mut appended: Vec<&Rule> = Vec::with_capacity(rules.len());
    for rule in &rules {
        match append_unique(filter, rule) {
            Ok(true) => appended.push(rule),
            Ok(false) => log::debug!("{} rule for {public_port}/{protocol} already present", rule.kind),
            Err(e) => {
                let reason = format!("{} rule for {public_port}/{protocol}: {e}", rule.kind);
                return Err(roll_back(filter, &appended, reason));
            }
        }
    }
    log::info!("Port forward {public_port}/{protocol} -> {target_node}:{target_port} installed");
    Ok(())
}

fn roll_back(filter: &dyn PacketFilter, appended: &[&Rule], reason: String) -> Error {
    let mut left = Vec::new();
    for rule in appended.iter().rev() {
        if let Err(e) = filter.delete(rule.table, rule.chain, &rule.args) {
            log::error!("Rollback of {} rule failed: {e}", rule.kind);
            left.push(rule.kind);
        }
    }
    if left.is_empty() {
        Error::KernelApply(format!("{reason} (rolled back)"))
    } else {
        left.reverse();
        Error::PortForwardIncomplete { reason, left }
    }
}

/**
 * @brief Delete the rules of a port forward.
 * @param keep_shared Another mapping still targets the same address, port
 *        and protocol, so only the DNAT rule goes.
 *
 * The MASQUERADE and FORWARD-ACCEPT rules carry no public port and are
 * shared by every mapping onto the same target. Missing rules are skipped
 * silently, other failures are logged and collected. Safe to call
 * repeatedly or on a mapping never fully installed.
 */
pub fn remove_port_forward(
    filter: &dyn PacketFilter,
    public_port: u16,
    target_node: &str,
    target_port: u16,
    protocol: Protocol,
    keep_shared: bool,
) -> Removal {
    let mut out = Removal::default();
    for rule in port_forward_rules(public_port, target_node, target_port, protocol) {
        if keep_shared && rule.kind != RuleKind::Dnat {
            log::debug!("Keeping shared {} rule for {target_node}:{target_port}/{protocol}", rule.kind);
            continue;
        }
        match delete_if_present(filter, &rule) {
            Ok(true) => out.removed += 1,
            Ok(false) => {}
            Err(e) => {
                log::warn!("Failed to remove {} rule for {public_port}/{protocol}: {e}", rule.kind);
                out.warnings.push(format!("{}: {e}", rule.kind));
            }
        }
    }
    out
}

/// Reports which rules of a mapping are currently present.
pub fn inspect_port_forward(
    filter: &dyn PacketFilter,
    public_port: u16,
    target_node: &str,
    target_port: u16,
    protocol: Protocol,
) -> Result<Installation> {
    let rules = port_forward_rules(public_port, target_node, target_port, protocol);
    let mut present = Vec::new();
    for rule in &rules {
        if filter.exists(rule.table, rule.chain, &rule.args)? {
            present.push(rule.kind);
        }
    }
    Ok(match present.len() {
        0 => Installation::Pending,
        n if n == rules.len() => Installation::Installed,
        _ => Installation::Partial(present),
    })
}

/// `iptables` and `sysctl` driven through the command line.
pub struct Iptables {
    binary: String,
}

impl Default for Iptables {
    fn default() -> Self {
        Self { binary: "iptables".into() }
    }
}

impl Iptables {
    fn run(&self, table: &str, op: &str, chain: &str, rule: &[String]) -> Result<std::process::Output> {
        Command::new(&self.binary)
            .args(["-t", table, op, chain])
            .args(rule)
            .output()
            .map_err(|e| Error::kernel(format!("{}: {e}", self.binary)))
    }
}

impl PacketFilter for Iptables {
    fn exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool> {
        let out = self.run(table, "-C", chain, rule)?;
        match out.status.code() {
            Some(0) => Ok(true),
            // iptables -C exits 1 when no matching rule exists
            Some(1) => Ok(false),
            _ => Err(Error::kernel(String::from_utf8_lossy(&out.stderr).trim().to_string())),
        }
    }

    fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        let out = self.run(table, "-A", chain, rule)?;
        if !out.status.success() {
            return Err(Error::kernel(String::from_utf8_lossy(&out.stderr).trim().to_string()));
        }
        Ok(())
    }

    fn delete(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        let out = self.run(table, "-D", chain, rule)?;
        if !out.status.success() {
            return Err(Error::kernel(String::from_utf8_lossy(&out.stderr).trim().to_string()));
        }
        Ok(())
    }

    fn enable_ip_forwarding(&self) -> Result<()> {
        let out = Command::new("sysctl")
            .args(["-w", "net.ipv4.ip_forward=1"])
            .output()
            .map_err(|e| Error::kernel(format!("sysctl: {e}")))?;
        if !out.status.success() {
            return Err(Error::kernel(String::from_utf8_lossy(&out.stderr).trim().to_string()));
        }
        Ok(())
    }
}
