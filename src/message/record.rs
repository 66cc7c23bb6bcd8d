use core::fmt;

use arrayvec::ArrayVec;
use nom::bytes::complete::take;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};

use super::ProtocolVersion;
use crate::util::be_u48;
use crate::Error;

/// Upper bound of records we accept from a single datagram.
pub const MAX_RECORDS_PER_DATAGRAM: usize = 32;

/// One DTLS record as read off the wire.
///
/// The payload is ciphertext when `sequence.epoch > 0` and plaintext
/// otherwise. Decryption is deferred until the router has picked the
/// session whose read epoch matches.
#[derive(Debug, PartialEq, Eq)]
pub struct Record<'a> {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub sequence: Sequence,
    pub payload: &'a [u8],
}

/// Position of a record within a connection and direction: the cipher
/// epoch plus the 48-bit record sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequence {
    pub epoch: u16,
    /// 48 bits on the wire.
    pub number: u64,
}

impl Sequence {
    pub fn new(epoch: u16, number: u64) -> Self {
        Sequence { epoch, number }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Sequence> {
        let (input, epoch) = be_u16(input)?;
        let (rest, number) = be_u48(input)?;
        Ok((rest, Sequence { epoch, number }))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(&self.epoch.to_be_bytes());
        output.extend_from_slice(&self.number.to_be_bytes()[2..]);
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.epoch, self.number)
    }
}

impl<'a> Record<'a> {
    /// Content type (1), version (2), epoch (2), sequence number (6),
    /// length (2).
    pub const HEADER_LEN: usize = 13;

    /// Consume one record from the front of `input`, returning it and the
    /// unconsumed rest.
    ///
    /// A header or payload shorter than declared is reported as
    /// [`Error::ParseIncomplete`]; bytes that are not a DTLS record at
    /// all as [`Error::ParseError`].
    pub fn read(input: &'a [u8]) -> Result<(Record<'a>, &'a [u8]), Error> {
        if input.len() < Self::HEADER_LEN {
            return Err(Error::ParseIncomplete);
        }

        let declared = u16::from_be_bytes([input[11], input[12]]) as usize;
        if input.len() < Self::HEADER_LEN + declared {
            return Err(Error::ParseIncomplete);
        }

        let (rest, record) = Self::parse(input)?;
        Ok((record, rest))
    }

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Record<'a>> {
        let (input, content_type) = be_u8(input)?;
        let (input, version) = ProtocolVersion::parse(input)?;

        // A version outside the DTLS space means we are not looking at a
        // DTLS record; whatever follows cannot be trusted either.
        if matches!(version, ProtocolVersion::Unknown(_)) {
            return Err(Err::Error(NomError::new(input, ErrorKind::Verify)));
        }

        let (input, sequence) = Sequence::parse(input)?;
        let (input, length) = be_u16(input)?;
        let (rest, payload) = take(length as usize)(input)?;

        Ok((
            rest,
            Record {
                content_type: ContentType::from_code(content_type),
                version,
                sequence,
                payload,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.reserve(Self::HEADER_LEN + self.payload.len());
        output.push(self.content_type.code());
        output.extend_from_slice(&self.version.to_u16().to_be_bytes());
        self.sequence.serialize(output);
        output.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        output.extend_from_slice(self.payload);
    }
}

/// Split a received datagram into its records.
///
/// Parsing stops at the first malformed or truncated record; everything
/// decoded up to that point stays valid. The returned error, if any,
/// describes why the tail was discarded.
pub fn parse_datagram(
    input: &[u8],
) -> (ArrayVec<Record<'_>, MAX_RECORDS_PER_DATAGRAM>, Option<Error>) {
    let mut records = ArrayVec::new();
    let mut rest = input;

    while !rest.is_empty() && !records.is_full() {
        match Record::read(rest) {
            Ok((record, tail)) => {
                records.push(record);
                rest = tail;
            }
            Err(e) => return (records, Some(e)),
        }
    }

    (records, None)
}

/// DTLS record content types (RFC 5246 §6.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Unknown(u8),
}

impl ContentType {
    pub fn from_code(code: u8) -> Self {
        match code {
            20 => ContentType::ChangeCipherSpec,
            21 => ContentType::Alert,
            22 => ContentType::Handshake,
            23 => ContentType::ApplicationData,
            other => ContentType::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
            ContentType::Unknown(other) => other,
        }
    }
}
