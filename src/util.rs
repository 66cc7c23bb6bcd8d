use std::ops::RangeFrom;

use nom::error::{make_error, ErrorKind, ParseError};
use nom::{Err, IResult, InputIter, InputLength, Slice};

/// Parse a big-endian 48-bit unsigned integer (DTLS record sequence number).
pub fn be_u48<I, E: ParseError<I>>(input: I) -> IResult<I, u64, E>
where
    I: Slice<RangeFrom<usize>> + InputIter<Item = u8> + InputLength,
{
    let bound: usize = 6;

    if input.input_len() < bound {
        Err(Err::Error(make_error(input, ErrorKind::Eof)))
    } else {
        let mut res = 0u64;

        for byte in input.iter_elements().take(bound) {
            res = (res << 8) + byte as u64;
        }

        Ok((input.slice(bound..), res))
    }
}

/// Parse a big-endian 24-bit unsigned integer (handshake length fields).
pub fn be_u24<I, E: ParseError<I>>(input: I) -> IResult<I, u32, E>
where
    I: Slice<RangeFrom<usize>> + InputIter<Item = u8> + InputLength,
{
    let bound: usize = 3;

    if input.input_len() < bound {
        Err(Err::Error(make_error(input, ErrorKind::Eof)))
    } else {
        let mut res = 0u32;

        for byte in input.iter_elements().take(bound) {
            res = (res << 8) + byte as u32;
        }

        Ok((input.slice(bound..), res))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u48_roundtrip() {
        let bytes = [0x00, 0x00, 0x00, 0x01, 0x00, 0x02u8];
        let (rest, v) = be_u48::<_, nom::error::Error<&[u8]>>(&bytes[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(v, 0x0001_0002);
    }

    #[test]
    fn u24_roundtrip() {
        let bytes = [0x01, 0x00, 0x02u8];
        let (rest, v) = be_u24::<_, nom::error::Error<&[u8]>>(&bytes[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(v, 0x01_0002);
    }

    #[test]
    fn u48_too_short() {
        let bytes = [0u8; 5];
        assert!(be_u48::<_, nom::error::Error<&[u8]>>(&bytes[..]).is_err());
    }
}
