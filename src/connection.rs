use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::handshaker::Handshaker;
use crate::message::ContentType;
use crate::session::Session;
use crate::timer::ExponentialBackoff;

/// One record queued in a flight, kept as plaintext.
///
/// Sequence numbers are stamped from the session at every send, so a
/// retransmission never reuses a number. The explicit sequence exists only
/// for HELLO_VERIFY_REQUEST, which must echo the triggering record's
/// sequence number (RFC 6347 §4.2.1).
#[derive(Debug)]
pub struct FlightRecord {
    pub content_type: ContentType,
    pub epoch: u16,
    pub payload: Vec<u8>,
    pub explicit_sequence: Option<u64>,
}

impl FlightRecord {
    pub fn new(content_type: ContentType, epoch: u16, payload: Vec<u8>) -> Self {
        FlightRecord {
            content_type,
            epoch,
            payload,
            explicit_sequence: None,
        }
    }
}

/// An ordered group of records sent together and retransmitted as a unit.
pub struct Flight {
    pub peer: SocketAddr,
    pub records: SmallVec<[FlightRecord; 8]>,
    pub tries: usize,
    pub retransmit_needed: bool,
    /// Whether the flight is bound to a session (datagram sizing and
    /// sequence stamping) or sent statelessly at the connector MTU.
    pub session_bound: bool,
    pub(crate) backoff: Option<ExponentialBackoff>,
}

impl Flight {
    pub fn new(peer: SocketAddr) -> Self {
        Flight {
            peer,
            records: SmallVec::new(),
            tries: 0,
            retransmit_needed: true,
            session_bound: true,
            backoff: None,
        }
    }

    /// A flight that is fired once and never retransmitted (alerts,
    /// HELLO_VERIFY_REQUEST, application data).
    pub fn one_shot(peer: SocketAddr) -> Self {
        let mut flight = Flight::new(peer);
        flight.retransmit_needed = false;
        flight
    }

    pub fn add(&mut self, record: FlightRecord) -> &mut Self {
        self.records.push(record);
        self
    }

    pub(crate) fn arm_backoff(&mut self, initial: Duration, retries: usize) -> Duration {
        let backoff = self
            .backoff
            .get_or_insert_with(|| ExponentialBackoff::new(initial, retries));
        backoff.timeout()
    }
}

impl std::fmt::Debug for Flight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flight")
            .field("peer", &self.peer)
            .field("records", &self.records.len())
            .field("tries", &self.tries)
            .field("retransmit_needed", &self.retransmit_needed)
            .finish()
    }
}

/// Everything the connector tracks for one peer, owned under a single lock.
pub struct ConnectionInner {
    pub established: Option<Session>,
    pub handshaker: Option<Box<dyn Handshaker>>,
    pub pending_flight: Option<Flight>,
    pub resumption_required: bool,
    /// Bumped whenever the pending flight is replaced or cancelled; a
    /// retransmission deadline scheduled for an older generation fires as
    /// a no-op.
    pub flight_generation: u64,
}

/// Per-peer aggregate: at most one established session, one ongoing
/// handshaker and one pending flight. When both a session and a handshaker
/// exist, the handshake is a re-handshake and the session stays usable
/// until replaced.
pub struct Connection {
    peer: SocketAddr,
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    pub fn new(peer: SocketAddr) -> Self {
        Connection {
            peer,
            inner: Mutex::new(ConnectionInner {
                established: None,
                handshaker: None,
                pending_flight: None,
                resumption_required: false,
                flight_generation: 0,
            }),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock()
    }

    pub fn has_established_session(&self) -> bool {
        self.inner.lock().established.is_some()
    }

    pub fn has_ongoing_handshake(&self) -> bool {
        self.inner.lock().handshaker.is_some()
    }

    /// Drop the pending flight; any scheduled retransmission becomes stale.
    pub fn cancel_pending_flight(&self) {
        let mut inner = self.inner.lock();
        inner.pending_flight = None;
        inner.flight_generation += 1;
    }

    pub fn set_resumption_required(&self, required: bool) {
        self.inner.lock().resumption_required = required;
    }

    pub fn session_id(&self) -> Option<crate::message::SessionId> {
        self.inner
            .lock()
            .established
            .as_ref()
            .map(|s| *s.id())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("established", &inner.established.is_some())
            .field("ongoing_handshake", &inner.handshaker.is_some())
            .field("pending_flight", &inner.pending_flight.is_some())
            .field("resumption_required", &inner.resumption_required)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:5684".parse().unwrap()
    }

    #[test]
    fn new_connection_is_empty() {
        let conn = Connection::new(peer());
        assert!(!conn.has_established_session());
        assert!(!conn.has_ongoing_handshake());
        assert!(conn.session_id().is_none());
    }

    #[test]
    fn cancel_bumps_generation() {
        let conn = Connection::new(peer());
        {
            let mut inner = conn.lock();
            inner.pending_flight = Some(Flight::new(peer()));
        }
        let before = conn.lock().flight_generation;
        conn.cancel_pending_flight();
        let inner = conn.lock();
        assert!(inner.pending_flight.is_none());
        assert_eq!(inner.flight_generation, before + 1);
    }

    #[test]
    fn one_shot_flight_skips_retransmission() {
        let flight = Flight::one_shot(peer());
        assert!(!flight.retransmit_needed);
    }

    #[test]
    fn arm_backoff_returns_initial_then_doubles() {
        let mut flight = Flight::new(peer());
        let first = flight.arm_backoff(Duration::from_millis(200), 3);
        assert_eq!(first, Duration::from_millis(200));

        // Arming again does not reset the schedule
        let backoff = flight.backoff.as_mut().unwrap();
        backoff.attempt();
        let second = flight.arm_backoff(Duration::from_millis(200), 3);
        assert_eq!(second, Duration::from_millis(400));
    }
}
