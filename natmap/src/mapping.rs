//! The record describing one port mapping granted by a gateway.

use std::net::Ipv4Addr;

use crate::adapter::Protocol;

/// External identity of a mapping, the key of the active-mapping table.
///
/// Keyed by `(external address, external port)` rather than internal port:
/// when the host roams, the external address changes and the stale entry must
/// be replaceable without colliding with the fresh one.
pub type MappingKey = (Ipv4Addr, u16);

/// A port mapping granted by a gateway.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MappingRecord {
    /// Protocol that created the mapping.
    pub protocol: Protocol,
    /// Local port traffic is forwarded to.
    pub internal_port: u16,
    /// External port granted by the gateway. `0` means not established.
    pub external_port: u16,
    /// Private address advertised to the gateway, chosen by longest-prefix
    /// match against the router address.
    pub internal_ip: Ipv4Addr,
    /// External address, once the protocol reveals it.
    pub external_ip: Option<Ipv4Addr>,
    /// The gateway that granted the mapping.
    pub router_ip: Ipv4Addr,
    /// Lease seconds actually granted; gateways may shorten requests.
    pub lifetime: u32,
    /// Lease seconds the caller asked for. `0` requests an indefinitely
    /// refreshed mapping.
    pub requested_lifetime: u32,
    /// PCP mapping nonce, required verbatim for deletion. Always present on
    /// PCP records, never on others.
    pub nonce: Option<[u8; 12]>,
    /// Last failure seen while establishing the mapping, for diagnostics.
    pub error_info: Option<String>,
}

impl MappingRecord {
    /// The external `(address, port)` pair, once established.
    pub fn external(&self) -> Option<(Ipv4Addr, u16)> {
        match (self.external_ip, self.external_port) {
            (Some(ip), port) if port != 0 => Some((ip, port)),
            _ => None,
        }
    }

    pub(crate) fn key(&self) -> Option<MappingKey> {
        self.external()
    }
}
