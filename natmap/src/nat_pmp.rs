//! NAT-PMP gateway client (RFC 6886).

use std::net::Ipv4Addr;

use snafu::ResultExt;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::{
    adapter::{
        wire_lifetime, Adapter, AdapterError, Protocol, ProtocolSnafu, TimeoutSnafu,
        TransportSnafu, PMP_PROBE_PORT,
    },
    defaults::NAT_PMP_RECV_TIMEOUT as RECV_TIMEOUT,
    mapping::MappingRecord,
};

use self::protocol::{Request, Response};

mod protocol;

/// Port mapping over NAT-PMP.
#[derive(Debug, Default)]
pub(crate) struct NatPmpAdapter;

#[async_trait::async_trait]
impl Adapter for NatPmpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Pmp
    }

    fn probe_port(&self) -> u16 {
        PMP_PROBE_PORT
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

        let request = Request::Mapping {
            local_port: internal_port,
            external_port,
            lifetime_seconds: wire_lifetime(lifetime),
        };
        let (granted_port, granted_lifetime) = match exchange(&socket, request).await? {
            Response::PortMap {
                private_port,
                external_port,
                lifetime_seconds,
                ..
            } if private_port == internal_port => (external_port, lifetime_seconds),
            other => {
                return ProtocolSnafu {
                    reason: format!("unexpected mapping response: {other:?}"),
                }
                .fail()
            }
        };
        if granted_port == 0 {
            return ProtocolSnafu {
                reason: "gateway granted external port 0".to_string(),
            }
            .fail();
        }
        if granted_lifetime == 0 {
            return ProtocolSnafu {
                reason: "gateway granted a zero lifetime".to_string(),
            }
            .fail();
        }

        // The mapping response does not carry the public address; ask for it
        // with the dedicated opcode on the same socket.
        let external_ip = match exchange(&socket, Request::ExternalAddress).await? {
            Response::PublicAddress { public_ip, .. } => public_ip,
            other => {
                return ProtocolSnafu {
                    reason: format!("unexpected address response: {other:?}"),
                }
                .fail()
            }
        };

        Ok(MappingRecord {
            protocol: Protocol::Pmp,
            internal_port,
            external_port: granted_port,
            internal_ip,
            external_ip: Some(external_ip),
            router_ip,
            lifetime: granted_lifetime,
            requested_lifetime: lifetime,
            nonce: None,
            error_info: None,
        })
    }

    async fn delete_mapping(&self, record: &MappingRecord) -> Result<(), AdapterError> {
        let socket = connect(record.internal_ip, record.router_ip).await?;
        let request = Request::Mapping {
            local_port: record.internal_port,
            external_port: 0,
            lifetime_seconds: 0,
        };
        socket
            .send(&request.encode())
            .await
            .context(TransportSnafu)?;
        // Deletion is a notification; the gateway's answer carries nothing
        // we can act on.
        Ok(())
    }
}

/// Queries the gateway's public address with the external-address opcode.
pub(crate) async fn external_address(
    internal_ip: Ipv4Addr,
    router_ip: Ipv4Addr,
) -> Result<Ipv4Addr, AdapterError> {
    let socket = connect(internal_ip, router_ip).await?;
    match exchange(&socket, Request::ExternalAddress).await? {
        Response::PublicAddress { public_ip, .. } => Ok(public_ip),
        other => ProtocolSnafu {
            reason: format!("unexpected address response: {other:?}"),
        }
        .fail(),
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

async fn exchange(socket: &UdpSocket, request: Request) -> Result<Response, AdapterError> {
    socket.send(&request.encode()).await.context(TransportSnafu)?;

    let mut buffer = [0u8; Response::MAX_SIZE];
    let read = tokio::time::timeout(RECV_TIMEOUT, socket.recv(&mut buffer))
        .await
        .map_err(|_| TimeoutSnafu.build())?
        .context(TransportSnafu)?;
    trace!(bytes = read, "gateway answered");
    Response::decode(&buffer[..read]).map_err(|e| {
        ProtocolSnafu {
            reason: e.to_string(),
        }
        .build()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A loopback stand-in for a NAT-PMP gateway, scripted far enough to
    /// answer mapping and address queries.
    async fn fake_gateway(socket: UdpSocket, granted_lifetime: u32) {
        let mut buf = [0u8; 16];
        loop {
            let Ok((read, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let datagram = &buf[..read];
            let response: Vec<u8> = match datagram[1] {
                0 => {
                    // external address: success, epoch, 203.0.113.7
                    vec![0, 128, 0, 0, 0, 0, 0, 9, 203, 0, 113, 7]
                }
                1 => {
                    let mut out = vec![0, 129, 0, 0, 0, 0, 0, 9];
                    out.extend_from_slice(&datagram[4..6]); // echo private port
                    out.extend_from_slice(&datagram[6..8]); // grant requested port
                    out.extend_from_slice(&granted_lifetime.to_be_bytes());
                    out
                }
                _ => continue,
            };
            let _ = socket.send_to(&response, peer).await;
        }
    }

    #[tokio::test]
    async fn maps_and_deletes_against_a_loopback_gateway() {
        let server = UdpSocket::bind((Ipv4Addr::LOCALHOST, protocol::SERVER_PORT))
            .await
            .expect("bind 5351");
        tokio::spawn(fake_gateway(server, 1200));

        let adapter = NatPmpAdapter;
        let record = adapter
            .create_mapping(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 7000, 7001, 3600)
            .await
            .unwrap();

        assert_eq!(record.protocol, Protocol::Pmp);
        assert_eq!(record.internal_port, 7000);
        assert_eq!(record.external_port, 7001);
        assert_eq!(record.external_ip, Some(Ipv4Addr::new(203, 0, 113, 7)));
        assert_eq!(record.lifetime, 1200);
        assert_eq!(record.requested_lifetime, 3600);
        assert_eq!(record.nonce, None);

        adapter.delete_mapping(&record).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_gateway_times_out() {
        // TEST-NET-1 is guaranteed unrouted; nothing will answer.
        let err = external_address(Ipv4Addr::UNSPECIFIED, Ipv4Addr::new(192, 0, 2, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Timeout { .. } | AdapterError::Transport { .. }
        ));
    }
}
