//! PCP MAP datagrams (RFC 6887).

use std::net::{Ipv4Addr, Ipv6Addr};

use nested_enum_utils::common_fields;
use num_enum::TryFromPrimitive;
use snafu::{Backtrace, Snafu};

/// Port the gateway listens on.
pub(crate) const SERVER_PORT: u16 = 5351;

const VERSION: u8 = 2;

/// MAP opcode; responses set the high bit.
const OPCODE_MAP: u8 = 1;
const RESPONSE_INDICATOR: u8 = 0x80;

/// IANA protocol number for UDP.
const PROTOCOL_UDP: u8 = 17;

/// Byte length of a MAP request.
pub(crate) const MAP_REQUEST_SIZE: usize = 60;

/// Result codes defined by RFC 6887 §7.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum ResultCode {
    Success = 0,
    UnsuppVersion = 1,
    NotAuthorized = 2,
    MalformedRequest = 3,
    UnsuppOpcode = 4,
    UnsuppOption = 5,
    MalformedOption = 6,
    NetworkFailure = 7,
    NoResources = 8,
    UnsuppProtocol = 9,
    UserExQuota = 10,
    CannotProvideExternal = 11,
    AddressMismatch = 12,
    ExcessiveRemotePeers = 13,
}

/// A MAP request. A zero lifetime with the original nonce deletes the
/// mapping it created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MapRequest {
    pub nonce: [u8; 12],
    pub client_ip: Ipv4Addr,
    pub internal_port: u16,
    /// Suggested external port; `0` lets the gateway pick.
    pub external_port: u16,
    /// Suggested external address, when re-requesting a known one.
    pub suggested_external_ip: Option<Ipv4Addr>,
    pub lifetime_seconds: u32,
}

impl MapRequest {
    pub(crate) fn encode(&self) -> [u8; MAP_REQUEST_SIZE] {
        let mut buf = [0u8; MAP_REQUEST_SIZE];
        buf[0] = VERSION;
        buf[1] = OPCODE_MAP;
        buf[4..8].copy_from_slice(&self.lifetime_seconds.to_be_bytes());
        write_mapped_ipv4(&mut buf[8..24], self.client_ip);
        buf[24..36].copy_from_slice(&self.nonce);
        buf[36] = PROTOCOL_UDP;
        buf[40..42].copy_from_slice(&self.internal_port.to_be_bytes());
        buf[42..44].copy_from_slice(&self.external_port.to_be_bytes());
        write_mapped_ipv4(
            &mut buf[44..60],
            self.suggested_external_ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
        );
        buf
    }
}

/// IPv4-mapped IPv6: ten zero bytes, 0xffff, then the four octets.
fn write_mapped_ipv4(slot: &mut [u8], addr: Ipv4Addr) {
    slot[10] = 0xff;
    slot[11] = 0xff;
    slot[12..16].copy_from_slice(&addr.octets());
}

/// The fields of a MAP response this client acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MapResponse {
    pub result: ResultCode,
    pub lifetime_seconds: u32,
    pub epoch_time: u32,
    pub nonce: [u8; 12],
    pub internal_port: u16,
    pub external_port: u16,
    /// External address as sent, IPv4-mapped for IPv4 gateways.
    pub external_addr: Ipv6Addr,
}

#[common_fields({
    backtrace: Option<Backtrace>,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub(crate) enum Error {
    #[snafu(display("response is too short: {len} bytes"))]
    TooShort { len: usize },
    #[snafu(display("unsupported version {version}"))]
    InvalidVersion { version: u8 },
    #[snafu(display("opcode {opcode} is not a MAP response"))]
    UnexpectedOpcode { opcode: u8 },
    #[snafu(display("unknown result code {code}"))]
    UnknownResultCode { code: u8 },
}

impl MapResponse {
    /// Responses can carry options; a compliant one never exceeds this.
    pub(crate) const MAX_SIZE: usize = 1100;

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < MAP_REQUEST_SIZE {
            return TooShortSnafu { len: buf.len() }.fail();
        }
        if buf[0] != VERSION {
            return InvalidVersionSnafu { version: buf[0] }.fail();
        }
        if buf[1] != OPCODE_MAP | RESPONSE_INDICATOR {
            return UnexpectedOpcodeSnafu { opcode: buf[1] }.fail();
        }
        let result = ResultCode::try_from(buf[3])
            .map_err(|_| UnknownResultCodeSnafu { code: buf[3] }.build())?;

        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&buf[24..36]);
        let mut external = [0u8; 16];
        external.copy_from_slice(&buf[44..60]);

        Ok(MapResponse {
            result,
            lifetime_seconds: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            epoch_time: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            nonce,
            internal_port: u16::from_be_bytes([buf[40], buf[41]]),
            external_port: u16::from_be_bytes([buf[42], buf[43]]),
            external_addr: Ipv6Addr::from(external),
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn nonce_from_seed(seed: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        ChaCha8Rng::seed_from_u64(seed).fill_bytes(&mut nonce);
        nonce
    }

    #[test]
    fn map_request_layout() {
        let nonce = nonce_from_seed(7);
        let req = MapRequest {
            nonce,
            client_ip: Ipv4Addr::new(192, 168, 1, 20),
            internal_port: 7000,
            external_port: 7001,
            suggested_external_ip: None,
            lifetime_seconds: 3600,
        };
        let buf = req.encode();

        assert_eq!(buf.len(), 60);
        assert_eq!(buf[0], 2);
        assert_eq!(buf[1], 1);
        assert_eq!(&buf[4..8], &3600u32.to_be_bytes());
        // client address, IPv4-mapped
        assert_eq!(&buf[8..18], &[0u8; 10]);
        assert_eq!(&buf[18..20], &[0xff, 0xff]);
        assert_eq!(&buf[20..24], &[192, 168, 1, 20]);
        assert_eq!(&buf[24..36], &nonce);
        assert_eq!(buf[36], 17);
        assert_eq!(&buf[40..42], &7000u16.to_be_bytes());
        assert_eq!(&buf[42..44], &7001u16.to_be_bytes());
        // suggested external address keeps the mapped prefix
        assert_eq!(&buf[54..56], &[0xff, 0xff]);
        assert_eq!(&buf[56..60], &[0, 0, 0, 0]);
    }

    #[test]
    fn deletion_request_carries_nonce_and_zero_lifetime() {
        let nonce = nonce_from_seed(21);
        let req = MapRequest {
            nonce,
            client_ip: Ipv4Addr::new(10, 0, 0, 5),
            internal_port: 7000,
            external_port: 0,
            suggested_external_ip: None,
            lifetime_seconds: 0,
        };
        let buf = req.encode();

        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
        assert_eq!(&buf[24..36], &nonce);
    }

    fn response_bytes(result: u8, nonce: [u8; 12]) -> Vec<u8> {
        let mut buf = vec![0u8; 60];
        buf[0] = 2;
        buf[1] = 0x81;
        buf[3] = result;
        buf[4..8].copy_from_slice(&1200u32.to_be_bytes());
        buf[8..12].copy_from_slice(&99u32.to_be_bytes());
        buf[24..36].copy_from_slice(&nonce);
        buf[36] = 17;
        buf[40..42].copy_from_slice(&7000u16.to_be_bytes());
        buf[42..44].copy_from_slice(&7001u16.to_be_bytes());
        buf[54] = 0xff;
        buf[55] = 0xff;
        buf[56..60].copy_from_slice(&[203, 0, 113, 7]);
        buf
    }

    #[test]
    fn decodes_a_success_response() {
        let nonce = nonce_from_seed(3);
        let response = MapResponse::decode(&response_bytes(0, nonce)).unwrap();

        assert_eq!(response.result, ResultCode::Success);
        assert_eq!(response.lifetime_seconds, 1200);
        assert_eq!(response.epoch_time, 99);
        assert_eq!(response.nonce, nonce);
        assert_eq!(response.internal_port, 7000);
        assert_eq!(response.external_port, 7001);
        assert_eq!(
            response.external_addr.to_ipv4_mapped(),
            Some(Ipv4Addr::new(203, 0, 113, 7))
        );
    }

    #[test]
    fn decodes_no_resources() {
        let response = MapResponse::decode(&response_bytes(8, [0u8; 12])).unwrap();
        assert_eq!(response.result, ResultCode::NoResources);
    }

    #[test]
    fn rejects_malformed_responses() {
        assert!(matches!(
            MapResponse::decode(&[0u8; 12]),
            Err(Error::TooShort { .. })
        ));

        let mut wrong_version = response_bytes(0, [0u8; 12]);
        wrong_version[0] = 1;
        assert!(matches!(
            MapResponse::decode(&wrong_version),
            Err(Error::InvalidVersion { .. })
        ));

        let mut wrong_opcode = response_bytes(0, [0u8; 12]);
        wrong_opcode[1] = 0x82;
        assert!(matches!(
            MapResponse::decode(&wrong_opcode),
            Err(Error::UnexpectedOpcode { .. })
        ));
    }
}
