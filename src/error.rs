use std::fmt;
use std::io;

/// Errors surfaced by the connector and the record layer.
#[derive(Debug)]
pub enum Error {
    /// A record or handshake message was truncated.
    ParseIncomplete,
    /// A record or handshake message could not be parsed.
    ParseError(nom::error::ErrorKind),
    /// A message arrived that is not valid in the current state.
    UnexpectedMessage(String),
    /// Encryption or decryption failed.
    CryptoError(String),
    /// Outbound application payload exceeds the DTLS plaintext limit.
    MessageTooLarge(usize),
    /// The bounded outbound queue is full; the message was dropped.
    TransmitQueueFull,
    /// The connector is not running.
    NotRunning,
    /// Socket I/O failure.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ParseIncomplete => write!(f, "incomplete input"),
            Error::ParseError(kind) => write!(f, "parse error: {:?}", kind),
            Error::UnexpectedMessage(m) => write!(f, "unexpected message: {}", m),
            Error::CryptoError(m) => write!(f, "crypto error: {}", m),
            Error::MessageTooLarge(n) => {
                write!(f, "message of {} bytes exceeds 16384 byte limit", n)
            }
            Error::TransmitQueueFull => write!(f, "outbound queue full"),
            Error::NotRunning => write!(f, "connector is not running"),
            Error::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    fn from(value: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        match value {
            nom::Err::Incomplete(_) => Error::ParseIncomplete,
            nom::Err::Error(x) => Error::ParseError(x.code),
            nom::Err::Failure(x) => Error::ParseError(x.code),
        }
    }
}
