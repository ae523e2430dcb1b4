//! NAT-PMP datagrams (RFC 6886).

use std::net::Ipv4Addr;

use nested_enum_utils::common_fields;
use num_enum::TryFromPrimitive;
use snafu::{Backtrace, Snafu};

/// Port the gateway listens on.
pub(crate) const SERVER_PORT: u16 = 5351;

const VERSION: u8 = 0;

/// Response opcodes are the request opcode with the high bit set.
const RESPONSE_INDICATOR: u8 = 128;

const OPCODE_EXTERNAL_ADDRESS: u8 = 0;
const OPCODE_MAP_UDP: u8 = 1;

/// Result codes a gateway can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub(crate) enum ResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    NotAuthorized = 2,
    NetworkFailure = 3,
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

/// A request datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    /// Query the gateway's public address.
    ExternalAddress,
    /// Map a UDP port. A zero lifetime deletes the mapping.
    Mapping {
        local_port: u16,
        external_port: u16,
        lifetime_seconds: u32,
    },
}

impl Request {
    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            Request::ExternalAddress => vec![VERSION, OPCODE_EXTERNAL_ADDRESS],
            Request::Mapping {
                local_port,
                external_port,
                lifetime_seconds,
            } => {
                let mut buf = Vec::with_capacity(12);
                buf.push(VERSION);
                buf.push(OPCODE_MAP_UDP);
                buf.extend_from_slice(&[0, 0]);
                buf.extend_from_slice(&local_port.to_be_bytes());
                buf.extend_from_slice(&external_port.to_be_bytes());
                buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
                buf
            }
        }
    }
}

/// A decoded response datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Response {
    PublicAddress {
        epoch_time: u32,
        public_ip: Ipv4Addr,
    },
    PortMap {
        epoch_time: u32,
        private_port: u16,
        external_port: u16,
        lifetime_seconds: u32,
    },
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
    #[snafu(display("opcode {opcode} is not a response"))]
    NotAResponse { opcode: u8 },
    #[snafu(display("unexpected opcode {opcode}"))]
    UnexpectedOpcode { opcode: u8 },
    #[snafu(display("unknown result code {code}"))]
    UnknownResultCode { code: u16 },
    #[snafu(display("gateway refused the request: {code:?}"))]
    Refused { code: ResultCode },
}

impl Response {
    /// Largest datagram a compliant gateway sends.
    pub(crate) const MAX_SIZE: usize = 16;

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 4 {
            return TooShortSnafu { len: buf.len() }.fail();
        }
        if buf[0] != VERSION {
            return InvalidVersionSnafu { version: buf[0] }.fail();
        }
        let opcode = buf[1];
        if opcode < RESPONSE_INDICATOR {
            return NotAResponseSnafu { opcode }.fail();
        }
        let code = u16::from_be_bytes([buf[2], buf[3]]);
        let code =
            ResultCode::try_from(code).map_err(|_| UnknownResultCodeSnafu { code }.build())?;
        if code != ResultCode::Success {
            return RefusedSnafu { code }.fail();
        }

        match opcode - RESPONSE_INDICATOR {
            OPCODE_EXTERNAL_ADDRESS => {
                if buf.len() < 12 {
                    return TooShortSnafu { len: buf.len() }.fail();
                }
                Ok(Response::PublicAddress {
                    epoch_time: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
                    public_ip: Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]),
                })
            }
            OPCODE_MAP_UDP => {
                if buf.len() < 16 {
                    return TooShortSnafu { len: buf.len() }.fail();
                }
                Ok(Response::PortMap {
                    epoch_time: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
                    private_port: u16::from_be_bytes([buf[8], buf[9]]),
                    external_port: u16::from_be_bytes([buf[10], buf[11]]),
                    lifetime_seconds: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
                })
            }
            opcode => UnexpectedOpcodeSnafu { opcode }.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_address_request_layout() {
        assert_eq!(Request::ExternalAddress.encode(), vec![0, 0]);
    }

    #[test]
    fn mapping_request_layout() {
        let req = Request::Mapping {
            local_port: 0x1234,
            external_port: 0x5678,
            lifetime_seconds: 3600,
        };
        assert_eq!(
            req.encode(),
            vec![0, 1, 0, 0, 0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0x0e, 0x10]
        );
    }

    #[test]
    fn deletion_request_zeroes_lifetime_and_external_port() {
        let req = Request::Mapping {
            local_port: 7000,
            external_port: 0,
            lifetime_seconds: 0,
        };
        let buf = req.encode();
        assert_eq!(&buf[6..8], &[0, 0]);
        assert_eq!(&buf[8..12], &[0, 0, 0, 0]);
    }

    #[test]
    fn decodes_port_map_response() {
        let buf = [
            0, 129, 0, 0, // header, success
            0, 0, 0, 42, // epoch
            0x1b, 0x58, // private port 7000
            0x1b, 0x59, // external port 7001
            0, 0, 0x0e, 0x10, // lifetime 3600
        ];
        assert_eq!(
            Response::decode(&buf).unwrap(),
            Response::PortMap {
                epoch_time: 42,
                private_port: 7000,
                external_port: 7001,
                lifetime_seconds: 3600,
            }
        );
    }

    #[test]
    fn decodes_public_address_response() {
        let buf = [0, 128, 0, 0, 0, 0, 0, 1, 203, 0, 113, 7];
        assert_eq!(
            Response::decode(&buf).unwrap(),
            Response::PublicAddress {
                epoch_time: 1,
                public_ip: Ipv4Addr::new(203, 0, 113, 7),
            }
        );
    }

    #[test]
    fn refusal_surfaces_the_result_code() {
        let buf = [0, 129, 0, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        match Response::decode(&buf) {
            Err(Error::Refused { code, .. }) => assert_eq!(code, ResultCode::OutOfResources),
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn rejects_requests_and_short_buffers() {
        assert!(matches!(
            Response::decode(&[0, 1, 0, 0]),
            Err(Error::NotAResponse { .. })
        ));
        assert!(matches!(
            Response::decode(&[0, 129]),
            Err(Error::TooShort { .. })
        ));
        assert!(matches!(
            Response::decode(&[2, 129, 0, 0]),
            Err(Error::InvalidVersion { .. })
        ));
    }
}
