//! The contract every NAT protocol implementation satisfies.

use std::net::Ipv4Addr;

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use tracing::debug;

use crate::mapping::MappingRecord;

/// Well-known throwaway ports used to decide whether a protocol is usable.
pub(crate) const PMP_PROBE_PORT: u16 = 55555;
pub(crate) const PCP_PROBE_PORT: u16 = 55556;
pub(crate) const UPNP_PROBE_PORT: u16 = 55557;

/// Lease requested for throwaway probe mappings.
pub(crate) const PROBE_MAPPING_LIFETIME_SECONDS: u32 = 10;

/// Wire lifetime standing in for a zero "refresh indefinitely" request.
///
/// Gateways disagree on what zero means (UPnP: static mapping, PMP/PCP:
/// delete), so PMP/PCP requests carry 24 hours instead and the renewal layer
/// re-maps perpetually.
pub(crate) const INDEFINITE_LEASE_SECONDS: u32 = 86_400;

/// Lifetime as sent to a PMP/PCP gateway.
pub(crate) fn wire_lifetime(requested: u32) -> u32 {
    if requested == 0 {
        INDEFINITE_LEASE_SECONDS
    } else {
        requested
    }
}

/// The NAT protocols spoken to gateways.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, derive_more::Display,
)]
pub enum Protocol {
    /// NAT-PMP (RFC 6886).
    #[display("pmp")]
    Pmp,
    /// Port Control Protocol (RFC 6887).
    #[display("pcp")]
    Pcp,
    /// UPnP Internet Gateway Device.
    #[display("upnp")]
    Upnp,
}

/// Failure of a single adapter operation.
#[common_fields({
    backtrace: Option<Backtrace>,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum AdapterError {
    #[snafu(display("no response within the protocol budget"))]
    Timeout {},
    #[snafu(display("malformed or negative response: {reason}"))]
    Protocol { reason: String },
    #[snafu(display("socket error"))]
    Transport { source: std::io::Error },
    #[snafu(display("gateway error: {reason}"))]
    Gateway { reason: String },
    #[snafu(display("protocol not supported on this network"))]
    Unsupported {},
}

/// One NAT protocol implementation, as seen by the dispatcher.
///
/// Adapters are stateless: every operation creates its own socket and closes
/// it on completion, and every call targets exactly one candidate gateway.
/// Errors surface as values; nothing panics through the dispatcher.
#[async_trait::async_trait]
pub(crate) trait Adapter: Send + Sync + std::fmt::Debug {
    /// Protocol this adapter speaks.
    fn protocol(&self) -> Protocol;

    /// Throwaway port used by [`Adapter::probe`].
    fn probe_port(&self) -> u16;

    /// Decides whether the protocol is usable on this network by attempting
    /// a short-lived mapping on the probe port.
    async fn probe(&self, router_ip: Ipv4Addr, internal_ip: Ipv4Addr) -> bool {
        let port = self.probe_port();
        match self
            .create_mapping(router_ip, internal_ip, port, port, PROBE_MAPPING_LIFETIME_SECONDS)
            .await
        {
            Ok(record) => {
                if let Err(e) = self.delete_mapping(&record).await {
                    debug!("failed to release probe mapping: {e}");
                }
                true
            }
            Err(e) => {
                debug!("probe failed: {e}");
                false
            }
        }
    }

    /// One mapping attempt against one candidate gateway.
    ///
    /// `external_port == 0` asks the gateway for any free port. `lifetime`
    /// is the caller's request; zero-lifetime normalization happens behind
    /// this call.
    async fn create_mapping(
        &self,
        router_ip: Ipv4Addr,
        internal_ip: Ipv4Addr,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Result<MappingRecord, AdapterError>;

    /// Removes a mapping previously created by this adapter.
    async fn delete_mapping(&self, record: &MappingRecord) -> Result<(), AdapterError>;
}
