use std::collections::HashMap;
use std::net::SocketAddr;

use crate::message::{ContentType, Record, Sequence, SessionId};
use crate::window::EpochWindow;
use crate::Error;

/// Largest DTLSPlaintext.length we will produce or accept (2^14, RFC 6347 §4.3.1).
pub const MAX_PLAINTEXT_FRAGMENT_LENGTH: usize = 16384;

/// Identity of the authenticated peer, established during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdentity {
    /// PSK identity presented in the ClientKeyExchange.
    PreSharedKey(Vec<u8>),
    /// Subject of the peer's leaf certificate.
    Certificate(String),
    /// The peer's raw public key (DER SubjectPublicKeyInfo).
    RawPublicKey(Vec<u8>),
}

/// Per-epoch record protection, installed by the handshaker at epoch
/// transitions. Cipher-suite internals live behind this trait; the
/// connector never sees keys or algorithms.
pub trait RecordCipher: Send {
    /// Encrypt a record fragment. The sequence is part of the AEAD binding.
    fn encrypt(
        &self,
        content_type: ContentType,
        sequence: Sequence,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error>;

    /// Decrypt a record fragment; failure means drop the record.
    fn decrypt(
        &self,
        content_type: ContentType,
        sequence: Sequence,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Error>;

    /// Worst-case ciphertext expansion per record (nonce, tag, padding).
    fn expansion(&self) -> usize;
}

/// Negotiated security context for one peer.
///
/// Epochs are monotonic non-decreasing. A session with `write_epoch == 0`
/// holds no write cipher and can only emit plaintext records. Write
/// sequence numbers are allocated per epoch; the epoch 0 counter stays
/// live after the transition so handshake resends never collide.
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    is_client: bool,
    read_epoch: u16,
    write_epoch: u16,
    write_seq: HashMap<u16, u64>,
    replay: EpochWindow,
    cipher_suite: Option<u16>,
    read_cipher: Option<Box<dyn RecordCipher>>,
    write_cipher: Option<Box<dyn RecordCipher>>,
    max_fragment_length: usize,
    peer_identity: Option<PeerIdentity>,
}

impl Session {
    pub fn new(peer: SocketAddr, is_client: bool) -> Self {
        Self::with_initial_sequence(peer, is_client, 0)
    }

    /// Server sessions seed their epoch 0 write sequence from the
    /// CLIENT_HELLO record that triggered them (RFC 6347 §4.2.1).
    pub fn with_initial_sequence(peer: SocketAddr, is_client: bool, initial_seq: u64) -> Self {
        let mut write_seq = HashMap::new();
        write_seq.insert(0, initial_seq);

        Session {
            id: SessionId::empty(),
            peer,
            is_client,
            read_epoch: 0,
            write_epoch: 0,
            write_seq,
            replay: EpochWindow::new(),
            cipher_suite: None,
            read_cipher: None,
            write_cipher: None,
            max_fragment_length: MAX_PLAINTEXT_FRAGMENT_LENGTH,
            peer_identity: None,
        }
    }

    /// Build the session an abbreviated handshake resumes from a cached
    /// one: same id, suite and identity, fresh epochs and sequence state,
    /// possibly a new peer address.
    pub fn resume_from(prior: &Session, peer: SocketAddr, initial_seq: u64) -> Self {
        let mut session = Session::with_initial_sequence(peer, prior.is_client, initial_seq);
        session.id = prior.id;
        session.cipher_suite = prior.cipher_suite;
        session.max_fragment_length = prior.max_fragment_length;
        session.peer_identity = prior.peer_identity.clone();
        session
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn set_id(&mut self, id: SessionId) {
        self.id = id;
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn read_epoch(&self) -> u16 {
        self.read_epoch
    }

    pub fn write_epoch(&self) -> u16 {
        self.write_epoch
    }

    pub fn cipher_suite(&self) -> Option<u16> {
        self.cipher_suite
    }

    pub fn set_cipher_suite(&mut self, suite: u16) {
        self.cipher_suite = Some(suite);
    }

    pub fn peer_identity(&self) -> Option<&PeerIdentity> {
        self.peer_identity.as_ref()
    }

    pub fn set_peer_identity(&mut self, identity: PeerIdentity) {
        self.peer_identity = Some(identity);
    }

    pub fn max_fragment_length(&self) -> usize {
        self.max_fragment_length
    }

    /// Negotiated via the RFC 6066 max_fragment_length extension.
    pub fn set_max_fragment_length(&mut self, length: usize) {
        self.max_fragment_length = length.min(MAX_PLAINTEXT_FRAGMENT_LENGTH);
    }

    /// Largest datagram we will send to this peer: the fragment budget
    /// plus record header and the write cipher's expansion.
    pub fn max_datagram_size(&self) -> usize {
        let expansion = self
            .write_cipher
            .as_ref()
            .map(|c| c.expansion())
            .unwrap_or(0);
        self.max_fragment_length + Record::HEADER_LEN + expansion
    }

    /// Allocate the next outbound sequence number for `epoch`. Strictly
    /// increasing within an epoch, including across retransmissions.
    pub fn next_write_sequence(&mut self, epoch: u16) -> u64 {
        let counter = self.write_seq.entry(epoch).or_insert(0);
        let seq = *counter;
        *counter += 1;
        seq
    }

    /// Replay peek (RFC 6347 §4.1.2.6): run before any MAC check. The
    /// window itself only advances in [`Session::mark_record_as_read`]
    /// after a successful decrypt.
    pub fn is_record_processable(&self, epoch: u16, sequence_number: u64) -> bool {
        epoch == self.read_epoch && self.replay.is_fresh(epoch, sequence_number)
    }

    pub fn mark_record_as_read(&mut self, epoch: u16, sequence_number: u64) {
        self.replay.mark_seen(epoch, sequence_number);
    }

    /// Install the cipher for inbound records and advance the read epoch.
    pub fn set_read_cipher(&mut self, cipher: Box<dyn RecordCipher>) {
        self.read_cipher = Some(cipher);
        self.read_epoch += 1;
        self.replay.advance_epoch(self.read_epoch);
    }

    /// Install the cipher for outbound records and advance the write epoch.
    pub fn set_write_cipher(&mut self, cipher: Box<dyn RecordCipher>) {
        self.write_cipher = Some(cipher);
        self.write_epoch += 1;
    }

    /// Protect an outbound record fragment under `sequence.epoch`.
    pub fn encrypt(
        &self,
        content_type: ContentType,
        sequence: Sequence,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if sequence.epoch == 0 {
            return Ok(plaintext.to_vec());
        }
        let Some(cipher) = self.write_cipher.as_ref() else {
            return Err(Error::CryptoError(format!(
                "no write cipher for epoch {}",
                sequence.epoch
            )));
        };
        cipher.encrypt(content_type, sequence, plaintext)
    }

    /// Recover the plaintext of an inbound record fragment.
    pub fn decrypt(
        &self,
        content_type: ContentType,
        sequence: Sequence,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if sequence.epoch == 0 {
            return Ok(ciphertext.to_vec());
        }
        let Some(cipher) = self.read_cipher.as_ref() else {
            return Err(Error::CryptoError(format!(
                "no read cipher for epoch {}",
                sequence.epoch
            )));
        };
        cipher.decrypt(content_type, sequence, ciphertext)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("is_client", &self.is_client)
            .field("read_epoch", &self.read_epoch)
            .field("write_epoch", &self.write_epoch)
            .field("cipher_suite", &self.cipher_suite)
            .finish()
    }
}
