use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Detect local non-loopback IPv4 addresses and convert each to a default /24 network.
///
/// For example, an interface IP `192.168.1.42` becomes `192.168.1.0/24`.
/// Duplicates are removed and the result is sorted.
pub fn detect_local_cidrs() -> Result<Vec<Ipv4Net>> {
    let mut set = BTreeSet::<Ipv4Net>::new();
    for iface in get_if_addrs().context("failed to enumerate network interfaces")? {
        if let IfAddr::V4(v4) = iface.addr {
            if v4.ip.is_loopback() {
                continue;
            }
            set.insert(ipv4_to_default_cidr(v4.ip));
        }
    }
    Ok(set.into_iter().collect())
}

/// Newline-delimited range text for the given networks, as accepted by the target expander.
pub fn cidrs_to_range_text(cidrs: &[Ipv4Net]) -> String {
    cidrs
        .iter()
        .map(Ipv4Net::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Helper: convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    let net = Ipv4Addr::new(o[0], o[1], o[2], 0);
    Ipv4Net::new(net, 24).expect("/24 is always valid")
}
