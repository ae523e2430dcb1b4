//! PCP gateway client (RFC 6887).

use std::net::Ipv4Addr;

use rand::RngCore;
use snafu::ResultExt;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::{
    adapter::{
        wire_lifetime, Adapter, AdapterError, Protocol, ProtocolSnafu, TimeoutSnafu,
        TransportSnafu, PCP_PROBE_PORT,
    },
    defaults::PCP_RECV_TIMEOUT as RECV_TIMEOUT,
    mapping::MappingRecord,
};

use self::protocol::{MapRequest, MapResponse, ResultCode};

mod protocol;

/// Port mapping over PCP.
#[derive(Debug, Default)]
pub(crate) struct PcpAdapter;

#[async_trait::async_trait]
impl Adapter for PcpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Pcp
    }

    fn probe_port(&self) -> u16 {
        PCP_PROBE_PORT
    }

    async fn create_mapping(
        &self,
        router_ip: Ipv4Addr,
        internal_ip: Ipv4Addr,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Result<MappingRecord, AdapterError> {
        let socket = connect(internal_ip, router_ip).await?;

        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);

        let request = MapRequest {
            nonce,
            client_ip: internal_ip,
            internal_port,
            external_port,
            suggested_external_ip: None,
            lifetime_seconds: wire_lifetime(lifetime),
        };
        let response = exchange(&socket, &request).await?;

        if response.result != ResultCode::Success {
            return ProtocolSnafu {
                reason: format!("gateway refused the mapping: {:?}", response.result),
            }
            .fail();
        }
        if response.nonce != nonce {
            return ProtocolSnafu {
                reason: "response nonce does not match the request".to_string(),
            }
            .fail();
        }
        if response.internal_port != internal_port {
            return ProtocolSnafu {
                reason: "response is for a different internal port".to_string(),
            }
            .fail();
        }
        if response.external_port == 0 {
            return ProtocolSnafu {
                reason: "gateway granted external port 0".to_string(),
            }
            .fail();
        }
        if response.lifetime_seconds == 0 {
            return ProtocolSnafu {
                reason: "gateway granted a zero lifetime".to_string(),
            }
            .fail();
        }
        let external_ip = response.external_addr.to_ipv4_mapped().ok_or_else(|| {
            ProtocolSnafu {
                reason: "external address is not IPv4".to_string(),
            }
            .build()
        })?;

        Ok(MappingRecord {
            protocol: Protocol::Pcp,
            internal_port,
            external_port: response.external_port,
            internal_ip,
            external_ip: Some(external_ip),
            router_ip,
            lifetime: response.lifetime_seconds,
            requested_lifetime: lifetime,
            nonce: Some(nonce),
            error_info: None,
        })
    }

    async fn delete_mapping(&self, record: &MappingRecord) -> Result<(), AdapterError> {
        let Some(nonce) = record.nonce else {
            return ProtocolSnafu {
                reason: "record carries no mapping nonce".to_string(),
            }
            .fail();
        };

        let socket = connect(record.internal_ip, record.router_ip).await?;
        let request = MapRequest {
            nonce,
            client_ip: record.internal_ip,
            internal_port: record.internal_port,
            external_port: 0,
            suggested_external_ip: None,
            lifetime_seconds: 0,
        };
        let response = exchange(&socket, &request).await?;

        // NO_RESOURCES means the mapping is already gone, which is what
        // deletion wanted.
        match response.result {
            ResultCode::Success | ResultCode::NoResources => Ok(()),
            code => ProtocolSnafu {
                reason: format!("gateway refused the deletion: {code:?}"),
            }
            .fail(),
        }
    }
}

async fn connect(internal_ip: Ipv4Addr, router_ip: Ipv4Addr) -> Result<UdpSocket, AdapterError> {
    let socket = UdpSocket::bind((internal_ip, 0))
        .await
        .context(TransportSnafu)?;
    socket
        .connect((router_ip, protocol::SERVER_PORT))
        .await
        .context(TransportSnafu)?;
    Ok(socket)
}

async fn exchange(socket: &UdpSocket, request: &MapRequest) -> Result<MapResponse, AdapterError> {
    socket.send(&request.encode()).await.context(TransportSnafu)?;

    let mut buffer = vec![0u8; MapResponse::MAX_SIZE];
    let read = tokio::time::timeout(RECV_TIMEOUT, socket.recv(&mut buffer))
        .await
        .map_err(|_| TimeoutSnafu.build())?
        .context(TransportSnafu)?;
    trace!(bytes = read, "gateway answered");
    MapResponse::decode(&buffer[..read]).map_err(|e| {
        ProtocolSnafu {
            reason: e.to_string(),
        }
        .build()
    })
}
