use std::fmt;

use crate::connection::Flight;
use crate::message::{Alert, AlertDescription, AlertLevel, ClientHello, Sequence};
use crate::session::Session;
use crate::RawData;

/// A handshake failure carrying the alert to report to the peer.
///
/// Fatal errors terminate the handshake (the established session, if any,
/// stays intact); non-fatal ones only discard the offending record.
#[derive(Debug)]
pub struct HandshakeError {
    pub level: AlertLevel,
    pub description: AlertDescription,
    pub reason: String,
}

impl HandshakeError {
    pub fn fatal(description: AlertDescription, reason: impl Into<String>) -> Self {
        HandshakeError {
            level: AlertLevel::Fatal,
            description,
            reason: reason.into(),
        }
    }

    pub fn warning(description: AlertDescription, reason: impl Into<String>) -> Self {
        HandshakeError {
            level: AlertLevel::Warning,
            description,
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.level == AlertLevel::Fatal
    }

    pub fn alert(&self) -> Alert {
        Alert::new(self.level, self.description)
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handshake error ({:?}/{:?}): {}",
            self.level, self.description, self.reason
        )
    }
}

impl std::error::Error for HandshakeError {}

/// One decrypted inbound record handed to the handshaker, after the router
/// has bound it to the right session.
#[derive(Debug)]
pub enum HandshakeInput<'a> {
    /// A handshake message (or fragment), including its 12-byte header.
    Handshake {
        sequence: Sequence,
        message: &'a [u8],
    },
    /// The one-byte ChangeCipherSpec payload.
    ChangeCipherSpec {
        sequence: Sequence,
        payload: &'a [u8],
    },
}

/// Observer of handshake completion.
pub trait SessionListener: Send {
    fn session_established(&self, session: &Session);
}

impl<F> SessionListener for F
where
    F: Fn(&Session) + Send,
{
    fn session_established(&self, session: &Session) {
        self(session)
    }
}

/// The per-peer handshake state machine, consumed as an external
/// collaborator in its four variants (client, server, resuming client,
/// resuming server; see [`HandshakerFactory`]).
///
/// The connector feeds it decrypted records and sends whatever flight it
/// returns. When the handshake completes, implementations must notify
/// their listeners and then surface the negotiated session through
/// [`Handshaker::take_established`].
pub trait Handshaker: Send {
    /// Process one inbound record; returns the next outbound flight, if
    /// this record completed one.
    fn process_message(
        &mut self,
        input: HandshakeInput<'_>,
    ) -> Result<Option<Flight>, HandshakeError>;

    /// The flight that opens the handshake (ClientHello for clients, the
    /// response flight for servers fed via `process_message`).
    fn start_handshake_message(&mut self) -> Result<Flight, HandshakeError>;

    /// Whether this handshake was started by the given CLIENT_HELLO, used
    /// to spot retransmitted duplicates without restarting.
    fn has_been_started_by(&self, client_hello: &ClientHello<'_>) -> bool;

    /// The session being negotiated.
    fn session(&self) -> &Session;

    fn session_mut(&mut self) -> &mut Session;

    fn add_session_listener(&mut self, listener: Box<dyn SessionListener>);

    /// The established session, once. `Some` exactly when the handshake
    /// has completed and the session has not yet been claimed.
    fn take_established(&mut self) -> Option<Session>;
}

/// Constructs the four handshaker variants.
///
/// Client constructors carry the deferred application message that
/// triggered the handshake; it is delivered in the first flight after the
/// session is established.
pub trait HandshakerFactory: Send + Sync {
    fn client(&self, session: Session, deferred: Option<RawData>) -> Box<dyn Handshaker>;

    /// `initial_message_seq` echoes the CLIENT_HELLO's message_seq so the
    /// server's flight numbering accounts for preceding cookie exchanges.
    fn server(&self, initial_message_seq: u16, session: Session) -> Box<dyn Handshaker>;

    fn resuming_client(&self, session: Session, deferred: Option<RawData>) -> Box<dyn Handshaker>;

    fn resuming_server(&self, initial_message_seq: u16, session: Session) -> Box<dyn Handshaker>;
}
