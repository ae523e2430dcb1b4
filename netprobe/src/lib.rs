//! Local network enumeration for port mapping.
//!
//! Answers the two questions a port-mapping client needs before it can talk
//! to a gateway: which private IPv4 addresses this host holds, and which
//! router is the active default gateway.

use std::net::Ipv4Addr;

use tracing::debug;

/// Returns the private IPv4 addresses assigned to the host's interfaces.
///
/// Loopback, link-local and non-RFC1918 addresses are skipped; an interface
/// that is down carries no address and drops out naturally.
pub fn private_ipv4_addrs() -> Vec<Ipv4Addr> {
    let mut addrs = Vec::new();
    for iface in netdev::interface::get_interfaces() {
        for net in &iface.ipv4 {
            let addr = net.addr();
            if is_candidate(addr) && !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
    }
    debug!(count = addrs.len(), "enumerated private addresses");
    addrs
}

/// Returns the IPv4 address of the default gateway, if one is known.
pub fn default_gateway_ipv4() -> Option<Ipv4Addr> {
    let gateway = match netdev::get_default_gateway() {
        Ok(gateway) => gateway,
        Err(e) => {
            debug!("no default gateway: {e:?}");
            return None;
        }
    };
    gateway.ipv4.first().copied()
}

fn is_candidate(addr: Ipv4Addr) -> bool {
    addr.is_private() && !addr.is_loopback() && !addr.is_link_local() && !addr.is_unspecified()
}
