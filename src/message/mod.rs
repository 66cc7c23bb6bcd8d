//! DTLS 1.2 wire types the connector needs to inspect.
//!
//! The connector parses record headers, handshake headers, CLIENT_HELLO
//! (cookie, session id, message_seq) and alerts. Everything else on the wire
//! is opaque and flows through to the handshaker untouched.

mod alert;
mod client_hello;
mod handshake;
mod id;
mod record;

pub use alert::{Alert, AlertDescription, AlertLevel};
pub use client_hello::{ClientHello, HelloVerifyRequest};
pub use handshake::{HandshakeHeader, HandshakeType};
pub use id::{Cookie, Random, SessionId};
pub use record::{parse_datagram, ContentType, Record, Sequence, MAX_RECORDS_PER_DATAGRAM};

use nom::number::complete::be_u16;
use nom::IResult;

/// DTLS protocol version as carried in record and hello headers.
///
/// DTLS versions are the 1's complement of the TLS version they mirror,
/// so 1.2 is `{254, 253}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    DTLS1_0,
    DTLS1_2,
    Unknown(u16),
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::DTLS1_2
    }
}

impl ProtocolVersion {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0xFEFF => ProtocolVersion::DTLS1_0,
            0xFEFD => ProtocolVersion::DTLS1_2,
            _ => ProtocolVersion::Unknown(value),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            ProtocolVersion::DTLS1_0 => 0xFEFF,
            ProtocolVersion::DTLS1_2 => 0xFEFD,
            ProtocolVersion::Unknown(value) => value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ProtocolVersion> {
        let (input, value) = be_u16(input)?;
        Ok((input, Self::from_u16(value)))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(&self.to_u16().to_be_bytes());
    }
}
