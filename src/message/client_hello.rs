use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use super::{Cookie, ProtocolVersion, Random, SessionId};

/// The fields of CLIENT_HELLO the connector inspects.
///
/// Cipher suites and compression methods are kept as the raw wire bytes.
/// The connector only feeds them into the cookie MAC; interpreting them is
/// the handshaker's business. Extensions are ignored entirely.
#[derive(Debug, PartialEq, Eq)]
pub struct ClientHello<'a> {
    pub client_version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    pub cookie: Cookie,
    pub cipher_suites: &'a [u8],
    pub compression_methods: &'a [u8],
}

impl<'a> ClientHello<'a> {
    /// Parse a CLIENT_HELLO body (the bytes following the handshake header).
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], ClientHello<'a>> {
        let (input, client_version) = ProtocolVersion::parse(input)?;
        let (input, random_bytes) = take(32usize)(input)?;
        let (input, session_id_len) = be_u8(input)?;
        let (input, session_id_bytes) = take(session_id_len as usize)(input)?;
        let (input, cookie_len) = be_u8(input)?;
        let (input, cookie_bytes) = take(cookie_len as usize)(input)?;
        let (input, cipher_suites_len) = be_u16(input)?;
        let (input, cipher_suites) = take(cipher_suites_len as usize)(input)?;
        let (input, compression_len) = be_u8(input)?;
        let (rest, compression_methods) = take(compression_len as usize)(input)?;

        // The length prefixes were validated by take() above.
        let random = Random::new(random_bytes).unwrap();
        let session_id = SessionId::try_new(session_id_bytes).unwrap();
        let cookie = Cookie::try_new(cookie_bytes).unwrap();

        Ok((
            rest,
            ClientHello {
                client_version,
                random,
                session_id,
                cookie,
                cipher_suites,
                compression_methods,
            },
        ))
    }

    pub fn has_session_id(&self) -> bool {
        !self.session_id.is_empty()
    }
}

/// HELLO_VERIFY_REQUEST body (RFC 6347 §4.2.1): server version plus the
/// stateless cookie the client must echo.
#[derive(Debug, PartialEq, Eq)]
pub struct HelloVerifyRequest {
    pub server_version: ProtocolVersion,
    pub cookie: Cookie,
}

impl HelloVerifyRequest {
    pub fn new(server_version: ProtocolVersion, cookie: Cookie) -> Self {
        HelloVerifyRequest {
            server_version,
            cookie,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], HelloVerifyRequest> {
        let (input, server_version) = ProtocolVersion::parse(input)?;
        let (input, cookie_len) = be_u8(input)?;
        let (rest, cookie_bytes) = take(cookie_len as usize)(input)?;

        let cookie = Cookie::try_new(cookie_bytes).unwrap();

        Ok((
            rest,
            HelloVerifyRequest {
                server_version,
                cookie,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        self.server_version.serialize(output);
        output.push(self.cookie.len() as u8);
        output.extend_from_slice(&self.cookie);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_client_hello(session_id: &[u8], cookie: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0xFE, 0xFD]); // DTLS 1.2
        body.extend_from_slice(&[0xAB; 32]); // random
        body.push(session_id.len() as u8);
        body.extend_from_slice(session_id);
        body.push(cookie.len() as u8);
        body.extend_from_slice(cookie);
        body.extend_from_slice(&[0x00, 0x04]); // two cipher suites
        body.extend_from_slice(&[0xC0, 0x2B, 0xC0, 0x2C]);
        body.push(0x01); // one compression method
        body.push(0x00);
        body
    }

    #[test]
    fn parse_full_hello() {
        let body = sample_client_hello(&[0x11; 8], b"cookie456");
        let (rest, hello) = ClientHello::parse(&body).unwrap();

        assert!(rest.is_empty());
        assert_eq!(hello.client_version, ProtocolVersion::DTLS1_2);
        assert_eq!(&*hello.session_id, &[0x11; 8]);
        assert_eq!(&*hello.cookie, b"cookie456");
        assert_eq!(hello.cipher_suites, &[0xC0, 0x2B, 0xC0, 0x2C]);
        assert_eq!(hello.compression_methods, &[0x00]);
        assert!(hello.has_session_id());
    }

    #[test]
    fn parse_empty_cookie_and_session() {
        let body = sample_client_hello(&[], &[]);
        let (_, hello) = ClientHello::parse(&body).unwrap();
        assert!(!hello.has_session_id());
        assert!(hello.cookie.is_empty());
    }

    #[test]
    fn truncated_hello_fails() {
        let body = sample_client_hello(&[0x11; 8], b"cookie456");
        assert!(ClientHello::parse(&body[..20]).is_err());
    }

    #[test]
    fn hello_verify_roundtrip() {
        let original = HelloVerifyRequest::new(
            ProtocolVersion::DTLS1_2,
            Cookie::try_new(b"cookie456").unwrap(),
        );

        let mut serialized = Vec::new();
        original.serialize(&mut serialized);

        let (rest, parsed) = HelloVerifyRequest::parse(&serialized).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, original);
    }
}
