//! What the orchestrator needs to know about the network it sits on.

use std::net::Ipv4Addr;

use tracing::debug;

use crate::{chooser, nat_pmp};

/// Supplies the local addresses, the active gateway, and the current public
/// address.
///
/// The orchestrator consumes this contract; tests substitute their own
/// implementation.
#[async_trait::async_trait]
pub trait NetworkProbe: Send + Sync + std::fmt::Debug {
    /// Private IPv4 addresses assigned to the host's interfaces.
    fn private_ips(&self) -> Vec<Ipv4Addr>;

    /// The active default gateway, if one is known.
    fn gateway_ip(&self) -> Option<Ipv4Addr>;

    /// The current public IPv4 address, as seen from outside the NAT.
    async fn public_ip(&self) -> Option<Ipv4Addr>;
}

/// Production probe.
///
/// Interface and gateway enumeration comes from [`netprobe`]; the public
/// address is the gateway's own answer to the NAT-PMP external-address
/// opcode.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

#[async_trait::async_trait]
impl NetworkProbe for SystemProbe {
    fn private_ips(&self) -> Vec<Ipv4Addr> {
        netprobe::private_ipv4_addrs()
    }

    fn gateway_ip(&self) -> Option<Ipv4Addr> {
        netprobe::default_gateway_ipv4()
    }

    async fn public_ip(&self) -> Option<Ipv4Addr> {
        let gateway = self.gateway_ip()?;
        let internal_ip = chooser::longest_prefix_match(&self.private_ips(), gateway)?;
        match nat_pmp::external_address(internal_ip, gateway).await {
            Ok(public_ip) => Some(public_ip),
            Err(e) => {
                debug!("public address query failed: {e}");
                None
            }
        }
    }
}
