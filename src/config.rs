use std::net::SocketAddr;
use std::time::Duration;

use crate::session::MAX_PLAINTEXT_FRAGMENT_LENGTH;

/// Credential material selecting the authentication mode. The blobs are
/// opaque to the connector and consumed by the handshaker.
#[derive(Debug, Clone)]
pub enum Credentials {
    PreSharedKey {
        identity: Vec<u8>,
        key: Vec<u8>,
    },
    Certificate {
        /// DER certificates, leaf first.
        chain: Vec<Vec<u8>>,
        /// DER (PKCS#8) private key.
        private_key: Vec<u8>,
    },
    RawPublicKey {
        /// DER SubjectPublicKeyInfo.
        public_key: Vec<u8>,
        private_key: Vec<u8>,
    },
}

/// Connector configuration
#[derive(Debug, Clone)]
pub struct Config {
    bind_address: SocketAddr,
    outbound_queue_capacity: usize,
    max_retransmissions: usize,
    retransmission_timeout: Duration,
    max_fragment_length_code: Option<u8>,
    mtu: Option<usize>,
    cipher_suites: Vec<u16>,
    credentials: Option<Credentials>,
    trust_anchors: Vec<Vec<u8>>,
}

impl Config {
    /// Create a new configuration builder bound to `bind_address`.
    pub fn builder(bind_address: SocketAddr) -> ConfigBuilder {
        ConfigBuilder {
            bind_address,
            outbound_queue_capacity: 1000,
            max_retransmissions: 4,
            retransmission_timeout: Duration::from_secs(1),
            max_fragment_length_code: None,
            mtu: None,
            cipher_suites: vec![
                0xC02B, // TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
                0xC0A8, // TLS_PSK_WITH_AES_128_CCM_8
            ],
            credentials: None,
            trust_anchors: Vec::new(),
        }
    }

    /// The address the connector binds its UDP socket to.
    #[inline(always)]
    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    /// Capacity of the bounded outbound message queue.
    #[inline(always)]
    pub fn outbound_queue_capacity(&self) -> usize {
        self.outbound_queue_capacity
    }

    /// Max number of retransmissions per flight.
    #[inline(always)]
    pub fn max_retransmissions(&self) -> usize {
        self.max_retransmissions
    }

    /// Initial flight retransmission timeout. Doubled on every resend.
    #[inline(always)]
    pub fn retransmission_timeout(&self) -> Duration {
        self.retransmission_timeout
    }

    /// Negotiated max_fragment_length code (RFC 6066), if any.
    #[inline(always)]
    pub fn max_fragment_length_code(&self) -> Option<u8> {
        self.max_fragment_length_code
    }

    /// MTU override. When unset the connector falls back to 1280, the
    /// IPv6 minimum.
    #[inline(always)]
    pub fn mtu(&self) -> Option<usize> {
        self.mtu
    }

    /// Cipher suites offered/accepted, by IANA id.
    #[inline(always)]
    pub fn cipher_suites(&self) -> &[u16] {
        &self.cipher_suites
    }

    /// Credential material, if configured.
    #[inline(always)]
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Trust anchors (DER certificates) for peer verification.
    #[inline(always)]
    pub fn trust_anchors(&self) -> &[Vec<u8>] {
        &self.trust_anchors
    }

    /// Largest plaintext fragment we accept: 16384, or less when a
    /// max_fragment_length code is configured.
    pub fn max_plaintext_fragment_length(&self) -> usize {
        match self.max_fragment_length_code {
            Some(1) => 512,
            Some(2) => 1024,
            Some(3) => 2048,
            Some(4) => 4096,
            _ => MAX_PLAINTEXT_FRAGMENT_LENGTH,
        }
    }
}

/// Builder for connector configuration.
pub struct ConfigBuilder {
    bind_address: SocketAddr,
    outbound_queue_capacity: usize,
    max_retransmissions: usize,
    retransmission_timeout: Duration,
    max_fragment_length_code: Option<u8>,
    mtu: Option<usize>,
    cipher_suites: Vec<u16>,
    credentials: Option<Credentials>,
    trust_anchors: Vec<Vec<u8>>,
}

impl ConfigBuilder {
    /// Set the outbound queue capacity.
    ///
    /// `send` never blocks; a full queue drops the message. Defaults to 1000.
    pub fn outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    /// Set the max number of retransmissions per flight.
    ///
    /// Defaults to 4.
    pub fn max_retransmissions(mut self, retransmissions: usize) -> Self {
        self.max_retransmissions = retransmissions;
        self
    }

    /// Set the initial retransmission timeout.
    ///
    /// Doubled on every resend. Defaults to 1 second.
    pub fn retransmission_timeout(mut self, timeout: Duration) -> Self {
        self.retransmission_timeout = timeout;
        self
    }

    /// Set the RFC 6066 max_fragment_length code (1..=4).
    ///
    /// Reduces the inbound datagram buffer accordingly. Defaults to none.
    pub fn max_fragment_length_code(mut self, code: u8) -> Self {
        self.max_fragment_length_code = Some(code);
        self
    }

    /// Override the MTU instead of the 1280 byte fallback.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Set the cipher suites to offer/accept (IANA ids).
    pub fn cipher_suites(mut self, suites: Vec<u16>) -> Self {
        self.cipher_suites = suites;
        self
    }

    /// Set the credential material (PSK, certificate or raw public key).
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Add a trust anchor (DER certificate).
    pub fn trust_anchor(mut self, anchor: Vec<u8>) -> Self {
        self.trust_anchors.push(anchor);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Config {
        Config {
            bind_address: self.bind_address,
            outbound_queue_capacity: self.outbound_queue_capacity,
            max_retransmissions: self.max_retransmissions,
            retransmission_timeout: self.retransmission_timeout,
            max_fragment_length_code: self.max_fragment_length_code,
            mtu: self.mtu,
            cipher_suites: self.cipher_suites,
            credentials: self.credentials,
            trust_anchors: self.trust_anchors,
        }
    }
}
