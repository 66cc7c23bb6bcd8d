use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use crate::util::be_u24;

/// Handshake message types (RFC 5246 §7.4 / RFC 6347 §4.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
    HelloRequest,
    ClientHello,
    ServerHello,
    HelloVerifyRequest,
    Certificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone,
    CertificateVerify,
    ClientKeyExchange,
    Finished,
    Unknown(u8),
}

impl HandshakeType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => HandshakeType::HelloRequest,
            1 => HandshakeType::ClientHello,
            2 => HandshakeType::ServerHello,
            3 => HandshakeType::HelloVerifyRequest,
            11 => HandshakeType::Certificate,
            12 => HandshakeType::ServerKeyExchange,
            13 => HandshakeType::CertificateRequest,
            14 => HandshakeType::ServerHelloDone,
            15 => HandshakeType::CertificateVerify,
            16 => HandshakeType::ClientKeyExchange,
            20 => HandshakeType::Finished,
            _ => HandshakeType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            HandshakeType::HelloRequest => 0,
            HandshakeType::ClientHello => 1,
            HandshakeType::ServerHello => 2,
            HandshakeType::HelloVerifyRequest => 3,
            HandshakeType::Certificate => 11,
            HandshakeType::ServerKeyExchange => 12,
            HandshakeType::CertificateRequest => 13,
            HandshakeType::ServerHelloDone => 14,
            HandshakeType::CertificateVerify => 15,
            HandshakeType::ClientKeyExchange => 16,
            HandshakeType::Finished => 20,
            HandshakeType::Unknown(value) => *value,
        }
    }
}

/// The 12-byte DTLS handshake header prefixed to every handshake message
/// fragment (RFC 6347 §4.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeHeader {
    pub msg_type: HandshakeType,
    pub length: u32,
    pub message_seq: u16,
    pub fragment_offset: u32,
    pub fragment_length: u32,
}

impl HandshakeHeader {
    pub const LEN: usize = 12;

    pub fn parse(input: &[u8]) -> IResult<&[u8], HandshakeHeader> {
        let (input, msg_type) = be_u8(input)?;
        let (input, length) = be_u24(input)?;
        let (input, message_seq) = be_u16(input)?;
        let (input, fragment_offset) = be_u24(input)?;
        let (input, fragment_length) = be_u24(input)?;

        Ok((
            input,
            HandshakeHeader {
                msg_type: HandshakeType::from_u8(msg_type),
                length,
                message_seq,
                fragment_offset,
                fragment_length,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.push(self.msg_type.as_u8());
        output.extend_from_slice(&self.length.to_be_bytes()[1..]);
        output.extend_from_slice(&self.message_seq.to_be_bytes());
        output.extend_from_slice(&self.fragment_offset.to_be_bytes()[1..]);
        output.extend_from_slice(&self.fragment_length.to_be_bytes()[1..]);
    }

    /// Whether this fragment carries the entire message.
    pub fn is_whole(&self) -> bool {
        self.fragment_offset == 0 && self.fragment_length == self.length
    }
}
