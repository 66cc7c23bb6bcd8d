use nom::number::complete::be_u8;
use nom::IResult;

/// Alert severity (RFC 5246 §7.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Fatal,
    Unknown(u8),
}

impl AlertLevel {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => AlertLevel::Warning,
            2 => AlertLevel::Fatal,
            _ => AlertLevel::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            AlertLevel::Warning => 1,
            AlertLevel::Fatal => 2,
            AlertLevel::Unknown(value) => *value,
        }
    }
}

/// Alert descriptions (RFC 5246 §7.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDescription {
    CloseNotify,
    UnexpectedMessage,
    BadRecordMac,
    RecordOverflow,
    DecompressionFailure,
    HandshakeFailure,
    BadCertificate,
    UnsupportedCertificate,
    CertificateRevoked,
    CertificateExpired,
    CertificateUnknown,
    IllegalParameter,
    UnknownCa,
    AccessDenied,
    DecodeError,
    DecryptError,
    ProtocolVersion,
    InsufficientSecurity,
    InternalError,
    UserCanceled,
    NoRenegotiation,
    UnsupportedExtension,
    Unknown(u8),
}

impl AlertDescription {
    pub fn from_u8(value: u8) -> Self {
        use AlertDescription::*;
        match value {
            0 => CloseNotify,
            10 => UnexpectedMessage,
            20 => BadRecordMac,
            22 => RecordOverflow,
            30 => DecompressionFailure,
            40 => HandshakeFailure,
            42 => BadCertificate,
            43 => UnsupportedCertificate,
            44 => CertificateRevoked,
            45 => CertificateExpired,
            46 => CertificateUnknown,
            47 => IllegalParameter,
            48 => UnknownCa,
            49 => AccessDenied,
            50 => DecodeError,
            51 => DecryptError,
            70 => ProtocolVersion,
            71 => InsufficientSecurity,
            80 => InternalError,
            90 => UserCanceled,
            100 => NoRenegotiation,
            110 => UnsupportedExtension,
            _ => Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        use AlertDescription::*;
        match self {
            CloseNotify => 0,
            UnexpectedMessage => 10,
            BadRecordMac => 20,
            RecordOverflow => 22,
            DecompressionFailure => 30,
            HandshakeFailure => 40,
            BadCertificate => 42,
            UnsupportedCertificate => 43,
            CertificateRevoked => 44,
            CertificateExpired => 45,
            CertificateUnknown => 46,
            IllegalParameter => 47,
            UnknownCa => 48,
            AccessDenied => 49,
            DecodeError => 50,
            DecryptError => 51,
            ProtocolVersion => 70,
            InsufficientSecurity => 71,
            InternalError => 80,
            UserCanceled => 90,
            NoRenegotiation => 100,
            UnsupportedExtension => 110,
            Unknown(value) => *value,
        }
    }
}

/// A 2-byte alert message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub description: AlertDescription,
}

impl Alert {
    pub const LEN: usize = 2;

    pub fn new(level: AlertLevel, description: AlertDescription) -> Self {
        Alert { level, description }
    }

    pub fn close_notify() -> Self {
        Alert::new(AlertLevel::Warning, AlertDescription::CloseNotify)
    }

    pub fn fatal(description: AlertDescription) -> Self {
        Alert::new(AlertLevel::Fatal, description)
    }

    pub fn is_fatal(&self) -> bool {
        self.level == AlertLevel::Fatal
    }

    pub fn is_close_notify(&self) -> bool {
        self.description == AlertDescription::CloseNotify
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Alert> {
        let (input, level) = be_u8(input)?;
        let (rest, description) = be_u8(input)?;
        Ok((
            rest,
            Alert {
                level: AlertLevel::from_u8(level),
                description: AlertDescription::from_u8(description),
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.push(self.level.as_u8());
        output.push(self.description.as_u8());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let alert = Alert::fatal(AlertDescription::HandshakeFailure);
        let mut serialized = Vec::new();
        alert.serialize(&mut serialized);
        assert_eq!(serialized, &[2, 40]);

        let (rest, parsed) = Alert::parse(&serialized).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, alert);
    }

    #[test]
    fn close_notify_is_warning() {
        let alert = Alert::close_notify();
        assert!(!alert.is_fatal());
        assert!(alert.is_close_notify());
    }
}
