//! UPnP IGD adapter.
//!
//! SSDP discovery and the SOAP control calls are the igd client's concern;
//! this module wraps them behind the adapter contract and enforces the
//! per-step deadlines, since the client does not reliably respect its own.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use igd_next::{aio as aigd, AddPortError, PortMappingProtocol, SearchOptions};
use tracing::debug;

use crate::{
    adapter::{
        Adapter, AdapterError, GatewaySnafu, Protocol, TimeoutSnafu,
        PROBE_MAPPING_LIFETIME_SECONDS, UPNP_PROBE_PORT,
    },
    defaults::{UPNP_SEARCH_TIMEOUT as SEARCH_TIMEOUT, UPNP_SOAP_TIMEOUT as SOAP_TIMEOUT},
    mapping::MappingRecord,
};

pub(crate) type Gateway = aigd::Gateway<aigd::tokio::Tokio>;

const SSDP_PORT: u16 = 1900;

/// Name under which mappings are registered on the router.
const PORT_MAPPING_DESCRIPTION: &str = "natmap";

/// Port mapping over UPnP IGD.
#[derive(Debug, Default)]
pub(crate) struct UpnpAdapter;

#[async_trait::async_trait]
impl Adapter for UpnpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Upnp
    }

    fn probe_port(&self) -> u16 {
        UPNP_PROBE_PORT
    }

    /// A conflicting entry on the probe port still proves a live IGD
    /// endpoint, so `ConflictInMappingEntry` counts as probe success.
    async fn probe(&self, router_ip: Ipv4Addr, internal_ip: Ipv4Addr) -> bool {
        let gateway = match search(router_ip, internal_ip).await {
            Ok(gateway) => gateway,
            Err(e) => {
                debug!("probe found no gateway: {e}");
                return false;
            }
        };

        let local = SocketAddr::V4(SocketAddrV4::new(internal_ip, UPNP_PROBE_PORT));
        let added = tokio::time::timeout(
            SOAP_TIMEOUT,
            gateway.add_port(
                PortMappingProtocol::UDP,
                UPNP_PROBE_PORT,
                local,
                PROBE_MAPPING_LIFETIME_SECONDS,
                PORT_MAPPING_DESCRIPTION,
            ),
        )
        .await;

        match added {
            Ok(Ok(())) => {
                let removed = tokio::time::timeout(
                    SOAP_TIMEOUT,
                    gateway.remove_port(PortMappingProtocol::UDP, UPNP_PROBE_PORT),
                )
                .await;
                if let Ok(Err(e)) = removed {
                    debug!("failed to release probe mapping: {e}");
                }
                true
            }
            Ok(Err(AddPortError::PortInUse)) => true,
            Ok(Err(e)) => {
                debug!("probe failed: {e}");
                false
            }
            Err(_) => false,
        }
    }

    async fn create_mapping(
        &self,
        router_ip: Ipv4Addr,
        internal_ip: Ipv4Addr,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Result<MappingRecord, AdapterError> {
        let gateway = search(router_ip, internal_ip).await?;

        let external_ip = tokio::time::timeout(SOAP_TIMEOUT, gateway.get_external_ip())
            .await
            .map_err(|_| TimeoutSnafu.build())?
            .map_err(|e| {
                GatewaySnafu {
                    reason: e.to_string(),
                }
                .build()
            })?;
        let IpAddr::V4(external_ip) = external_ip else {
            return GatewaySnafu {
                reason: "gateway's external address is not IPv4".to_string(),
            }
            .fail();
        };

        // A zero lifetime is a permanent static mapping on UPnP; pass it
        // through untouched.
        let local = SocketAddr::V4(SocketAddrV4::new(internal_ip, internal_port));
        let granted_port = if external_port != 0 {
            tokio::time::timeout(
                SOAP_TIMEOUT,
                gateway.add_port(
                    PortMappingProtocol::UDP,
                    external_port,
                    local,
                    lifetime,
                    PORT_MAPPING_DESCRIPTION,
                ),
            )
            .await
            .map_err(|_| TimeoutSnafu.build())?
            .map_err(|e| {
                GatewaySnafu {
                    reason: e.to_string(),
                }
                .build()
            })?;
            external_port
        } else {
            // The IGD protocol cannot ask for "any port"; the client walks
            // candidates for us.
            tokio::time::timeout(
                SOAP_TIMEOUT,
                gateway.add_any_port(
                    PortMappingProtocol::UDP,
                    local,
                    lifetime,
                    PORT_MAPPING_DESCRIPTION,
                ),
            )
            .await
            .map_err(|_| TimeoutSnafu.build())?
            .map_err(|e| {
                GatewaySnafu {
                    reason: e.to_string(),
                }
                .build()
            })?
        };

        Ok(MappingRecord {
            protocol: Protocol::Upnp,
            internal_port,
            external_port: granted_port,
            internal_ip,
            external_ip: Some(external_ip),
            router_ip,
            lifetime,
            requested_lifetime: lifetime,
            nonce: None,
            error_info: None,
        })
    }

    async fn delete_mapping(&self, record: &MappingRecord) -> Result<(), AdapterError> {
        let gateway = search(record.router_ip, record.internal_ip).await?;
        let removed = tokio::time::timeout(
            SOAP_TIMEOUT,
            gateway.remove_port(PortMappingProtocol::UDP, record.external_port),
        )
        .await
        .map_err(|_| TimeoutSnafu.build())?;

        match removed {
            Ok(()) => Ok(()),
            // Already gone is what deletion wanted.
            Err(igd_next::RemovePortError::NoSuchPortMapping) => Ok(()),
            Err(e) => GatewaySnafu {
                reason: e.to_string(),
            }
            .fail(),
        }
    }
}

/// Searches for the IGD endpoint, directing the M-SEARCH at one candidate.
async fn search(router_ip: Ipv4Addr, internal_ip: Ipv4Addr) -> Result<Gateway, AdapterError> {
    tokio::time::timeout(
        SEARCH_TIMEOUT,
        aigd::tokio::search_gateway(SearchOptions {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(internal_ip, 0)),
            broadcast_address: SocketAddr::V4(SocketAddrV4::new(router_ip, SSDP_PORT)),
            timeout: Some(SEARCH_TIMEOUT),
            ..Default::default()
        }),
    )
    .await
    .map_err(|_| TimeoutSnafu.build())?
    .map_err(|e| {
        GatewaySnafu {
            reason: e.to_string(),
        }
        .build()
    })
}
