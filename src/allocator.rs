use ipnet::{IpNet, Ipv4Net};
use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/**
 * @brief Pick the lowest free host address in a subnet.
 * @param subnet_cidr IPv4 subnet, host bits may be set (`10.8.0.1/24`).
 * @param used Addresses already handed out, as `a.b.c.d` or `a.b.c.d/32`.
 *             Must include the gateway address.
 * @return The address as a single-host CIDR (`10.8.0.2/32`).
 *
 * Nothing is reserved here: the caller persists the result inside the same
 * critical section that read `used`.
 */
pub fn allocate(subnet_cidr: &str, used: &[String]) -> Result<String> {
    let subnet = parse_subnet(subnet_cidr)?;
    let taken: HashSet<u32> = used.iter().filter_map(|u| parse_host(u)).map(u32::from).collect();

    let network = u32::from(subnet.network());
    let broadcast = u32::from(subnet.broadcast());
    (network.saturating_add(1)..broadcast)
        .find(|candidate| !taken.contains(candidate))
        .map(|free| format!("{}/32", Ipv4Addr::from(free)))
        .ok_or_else(|| Error::PoolExhausted(subnet.trunc().to_string()))
}

/// Parses a subnet, rejecting IPv6 with `NotIpv4`.
pub fn parse_subnet(subnet_cidr: &str) -> Result<Ipv4Net> {
    match subnet_cidr.trim().parse::<IpNet>() {
        Ok(IpNet::V4(net)) => Ok(net),
        Ok(IpNet::V6(_)) => Err(Error::NotIpv4(subnet_cidr.to_string())),
        Err(e) => Err(Error::validation(format!("invalid subnet {subnet_cidr}: {e}"))),
    }
}

/// Host part of `a.b.c.d` or `a.b.c.d/n`; `None` for anything else.
pub fn parse_host(addr: &str) -> Option<Ipv4Addr> {
    let addr = addr.trim();
    addr.parse::<Ipv4Net>()
        .map(|n| n.addr())
        .or_else(|_| addr.parse::<Ipv4Addr>())
        .ok()
}
