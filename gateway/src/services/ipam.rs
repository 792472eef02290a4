use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;

use crate::error::{GatewayError, GatewayResult};

/// Pick the lowest host address of `network` that is not in `reserved`.
///
/// IPv4 networks skip the network and broadcast addresses (except /31 and /32);
/// IPv6 networks skip the subnet-router anycast address.
pub fn allocate(network: &IpNet, reserved: &HashSet<IpAddr>) -> GatewayResult<IpAddr> {
    let found = match network {
        IpNet::V4(net) => net
            .hosts()
            .map(IpAddr::V4)
            .find(|ip| !reserved.contains(ip)),
        IpNet::V6(net) => {
            let skip = usize::from(net.prefix_len() < 128);
            net.hosts()
                .skip(skip)
                .map(IpAddr::V6)
                .find(|ip| !reserved.contains(ip))
        }
    };

    found.ok_or_else(|| GatewayError::Exhausted(format!("no available IPs in network {}", network)))
}

/// Allocate one address per requested network, returned as host routes
/// (`/32` or `/128`). Chosen addresses are added to `reserved` so the same
/// batch never hands out an address twice.
pub fn allocate_batch(
    networks: &[IpNet],
    reserved: &mut HashSet<IpAddr>,
) -> GatewayResult<Vec<String>> {
    let mut addresses = Vec::with_capacity(networks.len());

    for network in networks {
        let ip = allocate(network, reserved)?;
        reserved.insert(ip);
        addresses.push(host_cidr(ip));
    }

    Ok(addresses)
}

pub fn host_cidr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}/32", v4),
        IpAddr::V6(v6) => format!("{}/128", v6),
    }
}

/// Parse a CIDR, or a bare address as its host route.
pub fn parse_cidr(value: &str) -> Option<IpNet> {
    let value = value.trim();
    value
        .parse::<IpNet>()
        .ok()
        .or_else(|| value.parse::<IpAddr>().ok().map(IpNet::from))
}
