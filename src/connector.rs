use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::Config;
use crate::connection::{Connection, ConnectionInner, Flight, FlightRecord};
use crate::cookie::CookieFactory;
use crate::fragment::FragmentBuffer;
use crate::handshaker::{HandshakeError, HandshakeInput, Handshaker, HandshakerFactory};
use crate::message::{
    parse_datagram, Alert, AlertDescription, AlertLevel, ClientHello, ContentType,
    HandshakeHeader, HandshakeType, HelloVerifyRequest, ProtocolVersion, Record, Sequence,
    SessionId,
};
use crate::session::{PeerIdentity, Session, MAX_PLAINTEXT_FRAGMENT_LENGTH};
use crate::store::{ConnectionStore, InMemoryConnectionStore};
use crate::timer::RetransmitTimer;
use crate::{Error, RawData};

/// Worst-case per-record ciphertext expansion across the supported cipher
/// suites (explicit nonce, auth tag, padding headroom).
pub const MAX_CIPHERTEXT_EXPANSION: usize = 64;

/// 13 bytes record header + 12 bytes handshake header.
const DATAGRAM_HEADER_OVERHEAD: usize = 25;

/// When the interface MTU is not configured, fall back to the IPv6 minimum.
const MTU_FALLBACK: usize = 1280;

/// How often the receiver re-checks the running flag while idle.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Receives decrypted application data together with the peer's identity.
pub trait DataHandler: Send + Sync {
    fn receive(&self, data: RawData);
}

impl<F> DataHandler for F
where
    F: Fn(RawData) + Send + Sync,
{
    fn receive(&self, data: RawData) {
        self(data)
    }
}

/// Notified for every alert observed, inbound or locally raised.
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, peer: SocketAddr, level: AlertLevel, description: AlertDescription);
}

impl<F> ErrorHandler for F
where
    F: Fn(SocketAddr, AlertLevel, AlertDescription) + Send + Sync,
{
    fn on_error(&self, peer: SocketAddr, level: AlertLevel, description: AlertDescription) {
        self(peer, level, description)
    }
}

/// Public facts about an established session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub cipher_suite: Option<u16>,
    pub read_epoch: u16,
    pub write_epoch: u16,
    pub peer_identity: Option<PeerIdentity>,
}

/// A DTLS 1.2 endpoint multiplexing many peers over one UDP socket.
///
/// The connector owns the socket and two worker threads: a receiver that
/// decodes and routes inbound records, and a sender that drains the bounded
/// outbound queue. A third thread schedules flight retransmissions.
/// Handshake logic itself is delegated to [`crate::Handshaker`]
/// implementations produced by the configured factory.
pub struct Connector {
    inner: Arc<Inner>,
    workers: Mutex<Option<Workers>>,
}

struct Workers {
    receiver: JoinHandle<()>,
    sender: JoinHandle<()>,
}

struct Inner {
    config: Arc<Config>,
    store: Arc<dyn ConnectionStore>,
    factory: Arc<dyn HandshakerFactory>,
    cookies: CookieFactory,
    fragments: Mutex<FragmentBuffer>,
    running: AtomicBool,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    mtu: AtomicUsize,
    last_bind: Mutex<Option<SocketAddr>>,
    outbound: Mutex<Option<Sender<RawData>>>,
    stop_signal: Mutex<Option<Sender<()>>>,
    timer: Mutex<Option<RetransmitTimer>>,
    data_handler: RwLock<Option<Box<dyn DataHandler>>>,
    error_handler: RwLock<Option<Box<dyn ErrorHandler>>>,
}

impl Connector {
    /// Create a connector with the default in-memory connection store.
    pub fn new(config: Config, factory: Arc<dyn HandshakerFactory>) -> Self {
        Self::with_store(config, factory, Arc::new(InMemoryConnectionStore::new()))
    }

    /// Create a connector backed by a caller-provided connection store.
    pub fn with_store(
        config: Config,
        factory: Arc<dyn HandshakerFactory>,
        store: Arc<dyn ConnectionStore>,
    ) -> Self {
        Connector {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                store,
                factory,
                cookies: CookieFactory::new(),
                fragments: Mutex::new(FragmentBuffer::new()),
                running: AtomicBool::new(false),
                socket: RwLock::new(None),
                mtu: AtomicUsize::new(0),
                last_bind: Mutex::new(None),
                outbound: Mutex::new(None),
                stop_signal: Mutex::new(None),
                timer: Mutex::new(None),
                data_handler: RwLock::new(None),
                error_handler: RwLock::new(None),
            }),
            workers: Mutex::new(None),
        }
    }

    /// Bind the socket and spawn the worker threads. Idempotent when
    /// already running. After [`Connector::stop`] this re-binds the
    /// previous address.
    pub fn start(&self) -> Result<(), Error> {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return Ok(());
        }

        let inner = &self.inner;
        let bind = inner
            .last_bind
            .lock()
            .unwrap_or_else(|| inner.config.bind_address());

        let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
        // make it easier to stop/start a server consecutively without delays
        socket.set_reuse_address(true)?;
        socket.bind(&bind.into())?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        let local = socket.local_addr()?;
        let socket = Arc::new(socket);

        let mtu = match inner.config.mtu() {
            Some(mtu) => mtu,
            None => {
                info!(
                    "Cannot determine MTU of network interface, using minimum MTU [{}] of IPv6 instead",
                    MTU_FALLBACK
                );
                MTU_FALLBACK
            }
        };
        inner.mtu.store(mtu, Ordering::SeqCst);

        let buffer_size = inner.config.max_plaintext_fragment_length()
            + MAX_CIPHERTEXT_EXPANSION
            + DATAGRAM_HEADER_OVERHEAD;

        *inner.last_bind.lock() = Some(local);
        *inner.socket.write() = Some(socket.clone());
        inner.running.store(true, Ordering::SeqCst);

        let weak = Arc::downgrade(inner);
        *inner.timer.lock() = Some(RetransmitTimer::spawn(move |peer, generation| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_flight_timeout(peer, generation);
            }
        }));

        let (out_tx, out_rx) = bounded::<RawData>(inner.config.outbound_queue_capacity());
        let (stop_tx, stop_rx) = bounded::<()>(1);
        *inner.outbound.lock() = Some(out_tx);
        *inner.stop_signal.lock() = Some(stop_tx);

        let recv_inner = inner.clone();
        let recv_socket = socket.clone();
        let receiver = std::thread::Builder::new()
            .name(format!("dconn-recv-{}", local))
            .spawn(move || {
                let mut buffer = vec![0u8; buffer_size];
                while recv_inner.running.load(Ordering::SeqCst) {
                    match recv_socket.recv_from(&mut buffer) {
                        Ok((0, _)) => {
                            // nothing to do
                        }
                        Ok((len, peer)) => recv_inner.process_datagram(peer, &buffer[..len]),
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            if recv_inner.running.load(Ordering::SeqCst) {
                                warn!("Error receiving datagram: {}", e);
                            }
                        }
                    }
                }
            })?;

        let send_inner = inner.clone();
        let sender = std::thread::Builder::new()
            .name(format!("dconn-send-{}", local))
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(out_rx) -> message => match message {
                        Ok(message) => send_inner.send_next_message(message),
                        Err(_) => break,
                    },
                }
            })?;

        *workers = Some(Workers { receiver, sender });

        info!(
            "DTLS connector listening on [{}] with MTU [{}] using (inbound) datagram buffer size [{} bytes]",
            local, mtu, buffer_size
        );
        Ok(())
    }

    /// Stop the worker threads, drop queued outbound messages and close
    /// the socket. The connection store is kept, so a subsequent
    /// [`Connector::start`] resumes with the same sessions.
    pub fn stop(&self) {
        let mut workers = self.workers.lock();
        let Some(Workers { receiver, sender }) = workers.take() else {
            return;
        };

        let inner = &self.inner;
        info!("Stopping DTLS connector on [{:?}]", inner.last_bind.lock());

        inner.running.store(false, Ordering::SeqCst);
        inner.mtu.store(0, Ordering::SeqCst);

        if let Some(timer) = inner.timer.lock().take() {
            timer.shutdown();
        }

        // Dropping the sender handle discards anything still queued
        *inner.outbound.lock() = None;
        if let Some(stop) = inner.stop_signal.lock().take() {
            let _ = stop.send(());
        }

        // best effort wake-up so the receiver observes the flag promptly
        let socket = inner.socket.write().take();
        if let (Some(socket), Some(local)) = (socket, *inner.last_bind.lock()) {
            let _ = socket.send_to(&[], wake_address(local));
        }

        let _ = receiver.join();
        let _ = sender.join();
    }

    /// Stop and additionally clear the connection store. The connector can
    /// still be restarted, but peers will need fresh handshakes.
    pub fn destroy(&self) {
        self.stop();
        self.inner.store.clear();
    }

    /// Re-start on the same address and port as the previous start.
    pub fn restart(&self) -> Result<(), Error> {
        self.start()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Enqueue an application message. Never blocks: oversize payloads are
    /// rejected and a full queue drops the message with a warning.
    pub fn send(&self, message: RawData) -> Result<(), Error> {
        if message.bytes.len() > MAX_PLAINTEXT_FRAGMENT_LENGTH {
            return Err(Error::MessageTooLarge(message.bytes.len()));
        }

        let outbound = self.inner.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(Error::NotRunning);
        };

        match tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                warn!(
                    "Outbound message queue is full! Dropping outbound message to peer [{}]",
                    message.peer
                );
                Err(Error::TransmitQueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(Error::NotRunning),
        }
    }

    /// Gracefully close the connection to `peer` with a close_notify.
    pub fn close(&self, peer: SocketAddr) {
        if let Some(connection) = self.inner.store.get(peer) {
            if connection.has_established_session() {
                self.inner
                    .terminate_connection(&connection, Some(Alert::close_notify()));
            }
        }
    }

    /// Force an abbreviated handshake before the next send to `peer`.
    pub fn force_resume(&self, peer: SocketAddr) {
        if let Some(connection) = self.inner.store.get(peer) {
            if connection.has_established_session() {
                connection.set_resumption_required(true);
            }
        }
    }

    /// The bound local address.
    pub fn address(&self) -> SocketAddr {
        self.inner
            .last_bind
            .lock()
            .unwrap_or_else(|| self.inner.config.bind_address())
    }

    /// The MTU in effect, or 0 when not running.
    pub fn mtu(&self) -> usize {
        self.inner.mtu.load(Ordering::SeqCst)
    }

    /// Largest plaintext payload deliverable to `peer` in one record.
    pub fn max_fragment_length(&self, peer: SocketAddr) -> usize {
        self.inner
            .store
            .get(peer)
            .and_then(|c| c.lock().established.as_ref().map(|s| s.max_fragment_length()))
            .unwrap_or_else(|| self.inner.config.max_plaintext_fragment_length())
    }

    /// Public facts of the established session with `peer`, if any.
    pub fn session_info(&self, peer: SocketAddr) -> Option<SessionInfo> {
        let connection = self.inner.store.get(peer)?;
        let guard = connection.lock();
        let session = guard.established.as_ref()?;
        Some(SessionInfo {
            id: *session.id(),
            peer: session.peer(),
            cipher_suite: session.cipher_suite(),
            read_epoch: session.read_epoch(),
            write_epoch: session.write_epoch(),
            peer_identity: session.peer_identity().cloned(),
        })
    }

    /// Install the receiver for decrypted application data.
    pub fn set_data_handler(&self, handler: Box<dyn DataHandler>) {
        *self.inner.data_handler.write() = Some(handler);
    }

    /// Install the handler notified about alerts.
    pub fn set_error_handler(&self, handler: Box<dyn ErrorHandler>) {
        *self.inner.error_handler.write() = Some(handler);
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wildcard bind addresses are not routable; wake the receiver through
/// loopback on the same port.
fn wake_address(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    };
    SocketAddr::new(ip, local.port())
}

impl Inner {
    // ------------------------------------------------------------------
    // Inbound path (receiver thread)
    // ------------------------------------------------------------------

    fn process_datagram(&self, peer: SocketAddr, data: &[u8]) {
        let (records, tail_error) = parse_datagram(data);
        if let Some(e) = tail_error {
            debug!("Discarding tail of datagram from [{}]: {}", peer, e);
        }
        trace!("Received {} DTLS records from [{}]", records.len(), peer);

        for record in &records {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                match record.content_type {
                    ContentType::ApplicationData => self.process_application_data(peer, record),
                    ContentType::Alert => self.process_alert_record(peer, record),
                    ContentType::ChangeCipherSpec => self.process_change_cipher_spec(peer, record),
                    ContentType::Handshake => self.process_handshake_record(peer, record),
                    ContentType::Unknown(value) => {
                        debug!(
                            "Discarding record of unsupported type [{}] from peer [{}]",
                            value, peer
                        );
                    }
                }
            }));

            if outcome.is_err() {
                warn!(
                    "Unexpected error occurred while processing record from peer [{}]",
                    peer
                );
                if let Some(connection) = self.store.get(peer) {
                    self.terminate_connection(
                        &connection,
                        Some(Alert::fatal(AlertDescription::InternalError)),
                    );
                }
                break;
            }
        }
    }

    fn process_application_data(&self, peer: SocketAddr, record: &Record<'_>) {
        let Some(connection) = self.store.get(peer) else {
            debug!(
                "Discarding APPLICATION_DATA record received from peer [{}] without an active session",
                peer
            );
            return;
        };

        let mut delivery = None;
        {
            let mut guard = connection.lock();
            let inner = &mut *guard;
            let Some(session) = inner.established.as_mut() else {
                debug!(
                    "Discarding APPLICATION_DATA record received from peer [{}] without an active session",
                    peer
                );
                return;
            };

            let epoch = record.sequence.epoch;
            let seq = record.sequence.number;
            if session.read_epoch() != epoch {
                debug!(
                    "Discarding APPLICATION_DATA record [epoch={}] from [{}], expected epoch {}",
                    epoch,
                    peer,
                    session.read_epoch()
                );
                return;
            }

            // Replay detection before MAC validation (RFC 6347 §4.1.2.6)
            if !session.is_record_processable(epoch, seq) {
                debug!(
                    "Discarding duplicate APPLICATION_DATA record [{}] received from peer [{}]",
                    record.sequence, peer
                );
                return;
            }

            let plaintext =
                match session.decrypt(record.content_type, record.sequence, record.payload) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("Discarding APPLICATION_DATA record from [{}]: {}", peer, e);
                        return;
                    }
                };

            // The peer could only produce this under the new cipher state,
            // so our last handshake flight has arrived; stop resending it.
            inner.pending_flight = None;
            inner.flight_generation += 1;

            session.mark_record_as_read(epoch, seq);

            delivery = Some(RawData {
                peer,
                bytes: plaintext,
                identity: session.peer_identity().cloned(),
            });
        }

        if let Some(data) = delivery {
            if let Some(handler) = self.data_handler.read().as_ref() {
                handler.receive(data);
            }
        }
    }

    fn process_alert_record(&self, peer: SocketAddr, record: &Record<'_>) {
        let Some(connection) = self.store.get(peer) else {
            debug!(
                "Discarding ALERT record from [{}] received without existing connection",
                peer
            );
            return;
        };

        enum Disposition {
            None,
            Terminate,
        }

        let epoch = record.sequence.epoch;
        let (alert, disposition) = {
            let mut guard = connection.lock();
            let inner = &mut *guard;

            let session = if inner.established.as_ref().map(|s| s.read_epoch()) == Some(epoch) {
                inner.established.as_mut()
            } else if inner.handshaker.as_ref().map(|h| h.session().read_epoch()) == Some(epoch) {
                inner.handshaker.as_mut().map(|h| h.session_mut())
            } else {
                debug!(
                    "Epoch of ALERT record [epoch={}] from [{}] does not match expected epoch(s), discarding",
                    epoch, peer
                );
                return;
            };
            // Unwrap is ok, both arms above matched on Some.
            let session = session.unwrap();

            let plaintext =
                match session.decrypt(record.content_type, record.sequence, record.payload) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("Discarding undecryptable ALERT record from [{}]: {}", peer, e);
                        return;
                    }
                };

            let Ok((_, alert)) = Alert::parse(&plaintext) else {
                debug!("Discarding malformed ALERT record from [{}]", peer);
                return;
            };

            trace!(
                "Processing {:?} ALERT from [{}]: {:?}",
                alert.level,
                peer,
                alert.description
            );

            if alert.is_close_notify() {
                // RFC 5246 §7.2.1: answer with close_notify, then close
                self.send_alert(session, peer, Alert::close_notify());
                (alert, Disposition::Terminate)
            } else if alert.is_fatal() {
                (alert, Disposition::Terminate)
            } else {
                // non-fatal alerts do not require any special handling
                (alert, Disposition::None)
            }
        };

        if let Disposition::Terminate = disposition {
            self.terminate_connection(&connection, None);
        }

        if let Some(handler) = self.error_handler.read().as_ref() {
            handler.on_error(peer, alert.level, alert.description);
        }
    }

    fn process_change_cipher_spec(&self, peer: SocketAddr, record: &Record<'_>) {
        let Some(connection) = self.store.get(peer) else {
            debug!(
                "Received CHANGE_CIPHER_SPEC record from peer [{}] with no handshake going on",
                peer
            );
            return;
        };

        let result = {
            let mut guard = connection.lock();
            let Some(handshaker) = guard.handshaker.as_mut() else {
                debug!(
                    "Received CHANGE_CIPHER_SPEC record from peer [{}] with no handshake going on",
                    peer
                );
                return;
            };

            let epoch = record.sequence.epoch;
            if handshaker.session().read_epoch() != epoch {
                debug!(
                    "Discarding CHANGE_CIPHER_SPEC record [epoch={}] from [{}]",
                    epoch, peer
                );
                return;
            }

            let plaintext = match handshaker.session_mut().decrypt(
                record.content_type,
                record.sequence,
                record.payload,
            ) {
                Ok(p) => p,
                Err(e) => {
                    debug!("Discarding CHANGE_CIPHER_SPEC record from [{}]: {}", peer, e);
                    return;
                }
            };

            handshaker.process_message(HandshakeInput::ChangeCipherSpec {
                sequence: record.sequence,
                payload: &plaintext,
            })
        };

        match result {
            // Processing a CCS never produces an additional flight
            Ok(Some(_)) => debug!(
                "Ignoring flight produced while processing CHANGE_CIPHER_SPEC from [{}]",
                peer
            ),
            Ok(None) => {}
            Err(e) => self.handle_handshake_error(peer, e),
        }
    }

    fn process_handshake_record(&self, peer: SocketAddr, record: &Record<'_>) {
        trace!("Received HANDSHAKE record from peer [{}]", peer);
        let result = match self.store.get(peer) {
            None => self.process_handshake_no_connection(peer, record),
            Some(connection) => self.process_handshake_with_connection(peer, record, connection),
        };
        if let Err(e) = result {
            self.handle_handshake_error(peer, e);
        }
    }

    /// Handshake records from unknown peers: only a complete, plaintext
    /// CLIENT_HELLO can create state, and only after cookie verification.
    fn process_handshake_no_connection(
        &self,
        peer: SocketAddr,
        record: &Record<'_>,
    ) -> Result<(), HandshakeError> {
        if record.sequence.epoch > 0 {
            debug!(
                "Discarding unexpected handshake message [epoch={}] received from peer [{}] without existing connection",
                record.sequence.epoch, peer
            );
            return Ok(());
        }

        let Ok((_, header)) = HandshakeHeader::parse(record.payload) else {
            debug!("Discarding malformed handshake record from [{}]", peer);
            return Ok(());
        };

        let body_end = HandshakeHeader::LEN + header.fragment_length as usize;
        if record.payload.len() < body_end {
            debug!("Discarding truncated handshake record from [{}]", peer);
            return Ok(());
        }

        let whole: Vec<u8> = if header.is_whole() {
            record.payload[..body_end].to_vec()
        } else {
            let body = &record.payload[HandshakeHeader::LEN..body_end];
            match self.fragments.lock().add(peer, &header, body) {
                Some(message) => message,
                None => return Ok(()),
            }
        };

        // Unwrap is ok, `whole` always starts with a valid header.
        let (_, header) = HandshakeHeader::parse(&whole).unwrap();

        if header.msg_type != HandshakeType::ClientHello {
            debug!(
                "Discarding unexpected {:?} message from peer [{}]",
                header.msg_type, peer
            );
            return Ok(());
        }

        self.handle_client_hello(peer, record.sequence, &header, &whole, None)
    }

    /// Handshake records from known peers: bind to the session whose read
    /// epoch matches, then route CLIENT_HELLO / HELLO_REQUEST specially and
    /// hand everything else to the ongoing handshaker.
    fn process_handshake_with_connection(
        &self,
        peer: SocketAddr,
        record: &Record<'_>,
        connection: Arc<Connection>,
    ) -> Result<(), HandshakeError> {
        let epoch = record.sequence.epoch;

        let plaintext: Vec<u8> = {
            let mut guard = connection.lock();
            let inner = &mut *guard;

            let session =
                if inner.handshaker.as_ref().map(|h| h.session().read_epoch()) == Some(epoch) {
                    Some(inner.handshaker.as_mut().unwrap().session_mut())
                } else if inner.established.as_ref().map(|s| s.read_epoch()) == Some(epoch) {
                    Some(inner.established.as_mut().unwrap())
                } else if inner.established.is_some() && epoch == 0 {
                    // peer has lost track of the connection and starts over
                    None
                } else {
                    debug!(
                        "Discarding HANDSHAKE message [epoch={}] from peer [{}] which does not match expected epoch(s)",
                        epoch, peer
                    );
                    return Ok(());
                };

            match session {
                Some(session) => {
                    match session.decrypt(record.content_type, record.sequence, record.payload) {
                        Ok(p) => p,
                        Err(e) => {
                            debug!(
                                "Discarding undecryptable HANDSHAKE record from [{}]: {}",
                                peer, e
                            );
                            return Ok(());
                        }
                    }
                }
                None => record.payload.to_vec(),
            }
        };

        let Ok((_, header)) = HandshakeHeader::parse(&plaintext) else {
            debug!("Discarding malformed handshake record from [{}]", peer);
            return Ok(());
        };

        if header.is_whole() {
            let body_end = HandshakeHeader::LEN + header.fragment_length as usize;
            match header.msg_type {
                HandshakeType::ClientHello if plaintext.len() >= body_end => {
                    return self.handle_client_hello(
                        peer,
                        record.sequence,
                        &header,
                        &plaintext[..body_end],
                        Some(connection),
                    );
                }
                HandshakeType::HelloRequest => {
                    return self.process_hello_request(peer, &connection);
                }
                _ => {}
            }
        }

        let mut guard = connection.lock();
        let Some(handshaker) = guard.handshaker.as_mut() else {
            debug!(
                "Discarding {:?} message received from peer [{}] with no handshake going on",
                header.msg_type, peer
            );
            return Ok(());
        };

        let result = handshaker.process_message(HandshakeInput::Handshake {
            sequence: record.sequence,
            message: &plaintext,
        });
        self.progress_handshaker(peer, &mut guard, result)
    }

    /// CLIENT_HELLO handling common to both paths. The cookie exchange
    /// comes first: no per-peer state is committed before the peer has
    /// proven it receives on its claimed source address (RFC 6347 §4.2.1).
    fn handle_client_hello(
        &self,
        peer: SocketAddr,
        record_sequence: Sequence,
        header: &HandshakeHeader,
        message: &[u8],
        connection: Option<Arc<Connection>>,
    ) -> Result<(), HandshakeError> {
        debug!("Processing CLIENT_HELLO from peer [{}]", peer);

        let body = &message[HandshakeHeader::LEN..];
        let Ok((_, hello)) = ClientHello::parse(body) else {
            return Err(HandshakeError::fatal(
                AlertDescription::DecodeError,
                "malformed CLIENT_HELLO",
            ));
        };

        if let Err(expected) = self.cookies.verify(peer, &hello) {
            self.send_hello_verify(peer, record_sequence, header.message_seq, expected);
            return Ok(());
        }

        if let Some(connection) = connection {
            let already_started = {
                let guard = connection.lock();
                guard
                    .handshaker
                    .as_ref()
                    .map(|h| h.has_been_started_by(&hello))
                    .unwrap_or(false)
            };
            if already_started {
                // the client has sent this before; our response flight was
                // probably lost, so resend it instead of starting over
                let mut guard = connection.lock();
                self.retransmit_pending(peer, &mut guard);
                return Ok(());
            }

            if hello.has_session_id() {
                return self.resume_existing_session(
                    peer,
                    record_sequence,
                    header.message_seq,
                    &hello,
                    message,
                );
            }

            // RFC 6347 §4.2.8: reachability proven, replace the previous
            // connection with a fresh handshake
            self.terminate_connection(&connection, None);
            return self.start_new_handshake(peer, record_sequence, header.message_seq, message);
        }

        if hello.has_session_id() {
            self.resume_existing_session(peer, record_sequence, header.message_seq, &hello, message)
        } else {
            self.start_new_handshake(peer, record_sequence, header.message_seq, message)
        }
    }

    fn start_new_handshake(
        &self,
        peer: SocketAddr,
        record_sequence: Sequence,
        message_seq: u16,
        message: &[u8],
    ) -> Result<(), HandshakeError> {
        let connection = Arc::new(Connection::new(peer));
        self.store.put(connection.clone());

        // Outbound record numbering continues from the CLIENT_HELLO record
        // (RFC 6347 §4.2.1)
        let session =
            Session::with_initial_sequence(peer, false, record_sequence.number);

        let mut guard = connection.lock();
        guard.handshaker = Some(self.factory.server(message_seq, session));
        let result = guard
            .handshaker
            .as_mut()
            .unwrap()
            .process_message(HandshakeInput::Handshake {
                sequence: record_sequence,
                message,
            });
        self.progress_handshaker(peer, &mut guard, result)
    }

    fn resume_existing_session(
        &self,
        peer: SocketAddr,
        record_sequence: Sequence,
        message_seq: u16,
        hello: &ClientHello<'_>,
        message: &[u8],
    ) -> Result<(), HandshakeError> {
        debug!("Client [{}] wants to resume session", peer);

        let cached = self.store.find(&hello.session_id).and_then(|previous| {
            let resumable = {
                let guard = previous.lock();
                guard
                    .established
                    .as_ref()
                    .map(|prior| Session::resume_from(prior, peer, record_sequence.number))
            };
            resumable.map(|session| (previous, session))
        });

        let Some((previous, resumable)) = cached else {
            debug!(
                "Client [{}] tries to resume non-existing session, performing full handshake instead",
                peer
            );
            if let Some(connection) = self.store.get(peer) {
                self.terminate_connection(&connection, None);
            }
            return self.start_new_handshake(peer, record_sequence, message_seq, message);
        };

        let connection = Arc::new(Connection::new(peer));
        let mut handshaker = self.factory.resuming_server(message_seq, resumable);

        if previous.peer_addr() != peer {
            // the client moved; drop the old connection only once the new
            // session is actually established
            let store = self.store.clone();
            let old = previous.clone();
            handshaker.add_session_listener(Box::new(move |session: &Session| {
                debug!(
                    "Discarding existing connection to [{}] after successful resumption by peer [{}]",
                    old.peer_addr(),
                    session.peer()
                );
                old.cancel_pending_flight();
                store.remove(old.peer_addr());
            }));
        } else {
            self.terminate_connection(&previous, None);
        }

        self.store.put(connection.clone());

        let mut guard = connection.lock();
        guard.handshaker = Some(handshaker);
        let result = guard
            .handshaker
            .as_mut()
            .unwrap()
            .process_message(HandshakeInput::Handshake {
                sequence: record_sequence,
                message,
            });
        self.progress_handshaker(peer, &mut guard, result)
    }

    fn process_hello_request(
        &self,
        peer: SocketAddr,
        connection: &Arc<Connection>,
    ) -> Result<(), HandshakeError> {
        let mut guard = connection.lock();
        if guard.handshaker.is_some() {
            // RFC 5246 §7.4: ignore while a handshake is already ongoing
            debug!(
                "Ignoring HELLO_REQUEST received from [{}] while already in an ongoing handshake",
                peer
            );
            return Ok(());
        }

        // Re-handshake: the established session stays usable until the new
        // one replaces it.
        let mut handshaker = self.factory.client(Session::new(peer, true), None);
        let flight = handshaker.start_handshake_message()?;
        guard.handshaker = Some(handshaker);
        self.send_handshake_flight(peer, &mut guard, flight);
        Ok(())
    }

    fn send_hello_verify(
        &self,
        peer: SocketAddr,
        record_sequence: Sequence,
        message_seq: u16,
        cookie: crate::message::Cookie,
    ) {
        debug!(
            "Verifying client IP address [{}] using HELLO_VERIFY_REQUEST",
            peer
        );

        let request = HelloVerifyRequest::new(ProtocolVersion::DTLS1_2, cookie);
        let mut body = Vec::new();
        request.serialize(&mut body);

        // message_seq echoes the CLIENT_HELLO to allow multiple consecutive
        // cookie exchanges; the record sequence number echoes the triggering
        // record (RFC 6347 §4.2.1)
        let mut message = Vec::with_capacity(HandshakeHeader::LEN + body.len());
        HandshakeHeader {
            msg_type: HandshakeType::HelloVerifyRequest,
            length: body.len() as u32,
            message_seq,
            fragment_offset: 0,
            fragment_length: body.len() as u32,
        }
        .serialize(&mut message);
        message.extend_from_slice(&body);

        let mut record = FlightRecord::new(ContentType::Handshake, 0, message);
        record.explicit_sequence = Some(record_sequence.number);

        let mut flight = Flight::one_shot(peer);
        flight.session_bound = false;
        flight.add(record);
        self.send_flight(None, &mut flight);
    }

    // ------------------------------------------------------------------
    // Outbound path (sender thread)
    // ------------------------------------------------------------------

    fn send_next_message(&self, message: RawData) {
        let peer = message.peer;
        trace!("Sending application layer message to peer [{}]", peer);

        let connection = match self.store.get(peer) {
            Some(c) => c,
            None => {
                let c = Arc::new(Connection::new(peer));
                self.store.put(c.clone());
                c
            }
        };

        let mut guard = connection.lock();

        if guard.established.is_none() {
            // no session with peer available, start a fresh handshake
            // carrying the deferred message
            let mut handshaker = self.factory.client(Session::new(peer, true), Some(message));
            match handshaker.start_handshake_message() {
                Ok(flight) => {
                    guard.handshaker = Some(handshaker);
                    self.send_handshake_flight(peer, &mut guard, flight);
                }
                Err(e) => warn!("Cannot start handshake with peer [{}]: {}", peer, e),
            }
        } else if guard.resumption_required {
            // abbreviated handshake: replace the connection, the message
            // rides along deferred
            let resumable = {
                // Unwrap is ok, established was checked above.
                let prior = guard.established.as_ref().unwrap();
                Session::resume_from(prior, peer, 0)
            };
            drop(guard);
            self.terminate_connection(&connection, None);

            let new_connection = Arc::new(Connection::new(peer));
            self.store.put(new_connection.clone());

            let mut handshaker = self.factory.resuming_client(resumable, Some(message));
            let mut new_guard = new_connection.lock();
            match handshaker.start_handshake_message() {
                Ok(flight) => {
                    new_guard.handshaker = Some(handshaker);
                    self.send_handshake_flight(peer, &mut new_guard, flight);
                }
                Err(e) => warn!("Cannot resume session with peer [{}]: {}", peer, e),
            }
        } else {
            let inner = &mut *guard;
            // Unwrap is ok, established was checked above.
            let session = inner.established.as_mut().unwrap();
            let mut flight = Flight::one_shot(peer);
            flight.add(FlightRecord::new(
                ContentType::ApplicationData,
                session.write_epoch(),
                message.bytes,
            ));
            self.send_flight(Some(session), &mut flight);
        }
    }

    // ------------------------------------------------------------------
    // Flights
    // ------------------------------------------------------------------

    /// Send a flight produced by a handshaker: replaces the pending flight
    /// and schedules retransmission when the flight wants it.
    fn send_handshake_flight(
        &self,
        peer: SocketAddr,
        inner: &mut ConnectionInner,
        mut flight: Flight,
    ) {
        // cancel the previous schedule (if any)
        inner.pending_flight = None;
        inner.flight_generation += 1;

        {
            let session = match inner.handshaker.as_mut() {
                Some(h) => Some(h.session_mut()),
                None => inner.established.as_mut(),
            };
            self.send_flight(session, &mut flight);
        }

        if flight.retransmit_needed {
            let delay = flight.arm_backoff(
                self.config.retransmission_timeout(),
                self.config.max_retransmissions(),
            );
            inner.pending_flight = Some(flight);
            self.schedule_retransmission(peer, inner.flight_generation, delay);
        }
    }

    /// Serialize, protect and emit a flight, packing records greedily into
    /// datagrams bounded by the session's datagram budget or the MTU.
    fn send_flight(&self, mut session: Option<&mut Session>, flight: &mut Flight) {
        let max_datagram_size = if flight.session_bound {
            session
                .as_deref()
                .map(|s| s.max_datagram_size())
                .unwrap_or_else(|| self.mtu.load(Ordering::SeqCst))
        } else {
            self.mtu.load(Ordering::SeqCst)
        };

        let mut datagrams: Vec<Vec<u8>> = Vec::new();
        let mut current: Vec<u8> = Vec::new();

        for record in &flight.records {
            // Sequence numbers come from the session at every send so
            // retransmissions never reuse one.
            let number = match record.explicit_sequence {
                Some(seq) => seq,
                None => match session.as_deref_mut() {
                    Some(s) => s.next_write_sequence(record.epoch),
                    None => {
                        warn!(
                            "Dropping record for [{}] without session or explicit sequence",
                            flight.peer
                        );
                        continue;
                    }
                },
            };
            let sequence = Sequence::new(record.epoch, number);

            let fragment = if record.epoch == 0 {
                record.payload.clone()
            } else {
                let Some(s) = session.as_deref() else {
                    warn!("Dropping protected record for [{}] without session", flight.peer);
                    continue;
                };
                match s.encrypt(record.content_type, sequence, &record.payload) {
                    Ok(ciphertext) => ciphertext,
                    Err(e) => {
                        warn!("Cannot protect record for [{}]: {}", flight.peer, e);
                        continue;
                    }
                }
            };

            let mut wire = Vec::with_capacity(Record::HEADER_LEN + fragment.len());
            Record {
                content_type: record.content_type,
                version: ProtocolVersion::DTLS1_2,
                sequence,
                payload: &fragment,
            }
            .serialize(&mut wire);

            if wire.len() > max_datagram_size {
                // should not occur, the handshaker fragments at construction
                info!(
                    "{:?} record of {} bytes for peer [{}] exceeds max. datagram size [{}], discarding",
                    record.content_type,
                    wire.len(),
                    flight.peer,
                    max_datagram_size
                );
                continue;
            }

            if current.len() + wire.len() > max_datagram_size {
                datagrams.push(std::mem::take(&mut current));
            }
            current.extend_from_slice(&wire);
        }

        if !current.is_empty() {
            datagrams.push(current);
        }

        trace!(
            "Sending flight of {} record(s) to peer [{}] using {} datagram(s) of max {} bytes",
            flight.records.len(),
            flight.peer,
            datagrams.len(),
            max_datagram_size
        );

        for datagram in datagrams {
            self.send_datagram(flight.peer, &datagram);
        }
    }

    fn send_alert(&self, session: &mut Session, peer: SocketAddr, alert: Alert) {
        let mut payload = Vec::with_capacity(Alert::LEN);
        alert.serialize(&mut payload);

        let mut flight = Flight::one_shot(peer);
        flight.add(FlightRecord::new(
            ContentType::Alert,
            session.write_epoch(),
            payload,
        ));
        self.send_flight(Some(session), &mut flight);
    }

    fn send_datagram(&self, peer: SocketAddr, data: &[u8]) {
        let socket = self.socket.read().clone();
        match socket {
            Some(socket) => {
                if let Err(e) = socket.send_to(data, peer) {
                    warn!("Could not send datagram to [{}]: {}", peer, e);
                }
            }
            None => debug!("Socket is closed, discarding packet for [{}]", peer),
        }
    }

    fn retransmit_pending(&self, peer: SocketAddr, guard: &mut ConnectionInner) {
        let inner = &mut *guard;
        let Some(flight) = inner.pending_flight.as_mut() else {
            debug!("No pending flight to retransmit for [{}]", peer);
            return;
        };
        flight.tries += 1;
        let session = match inner.handshaker.as_mut() {
            Some(h) => Some(h.session_mut()),
            None => inner.established.as_mut(),
        };
        self.send_flight(session, flight);
    }

    // ------------------------------------------------------------------
    // Retransmission timer
    // ------------------------------------------------------------------

    fn schedule_retransmission(&self, peer: SocketAddr, generation: u64, delay: Duration) {
        if let Some(timer) = self.timer.lock().as_ref() {
            timer.schedule(delay, peer, generation);
        }
    }

    fn handle_flight_timeout(&self, peer: SocketAddr, generation: u64) {
        let Some(connection) = self.store.get(peer) else {
            return;
        };
        let mut guard = connection.lock();
        if guard.flight_generation != generation {
            // the flight was acked, replaced or cancelled in the meantime
            return;
        }

        let inner = &mut *guard;
        let Some(flight) = inner.pending_flight.as_mut() else {
            return;
        };
        let Some(backoff) = flight.backoff.as_mut() else {
            return;
        };

        if !backoff.can_retry() {
            debug!(
                "Flight for [{}] has reached maximum number of retransmissions",
                peer
            );
            return;
        }

        backoff.attempt();
        flight.tries += 1;
        let next_delay = backoff.timeout();
        debug!("Re-transmitting flight for [{}] (try {})", peer, flight.tries);

        let session = match inner.handshaker.as_mut() {
            Some(h) => Some(h.session_mut()),
            None => inner.established.as_mut(),
        };
        self.send_flight(session, flight);

        self.schedule_retransmission(peer, generation, next_delay);
    }

    // ------------------------------------------------------------------
    // Handshake progress and termination
    // ------------------------------------------------------------------

    /// Common tail after feeding the handshaker: send whatever flight it
    /// produced and claim the session once established.
    fn progress_handshaker(
        &self,
        peer: SocketAddr,
        inner: &mut ConnectionInner,
        result: Result<Option<Flight>, HandshakeError>,
    ) -> Result<(), HandshakeError> {
        if let Some(flight) = result? {
            self.send_handshake_flight(peer, inner, flight);
        }

        let established = inner
            .handshaker
            .as_mut()
            .and_then(|h| h.take_established());
        if let Some(established) = established {
            debug!("Session with peer [{}] established", peer);
            self.store.put_session_id(*established.id(), peer);
            inner.established = Some(established);
            inner.handshaker = None;
            inner.resumption_required = false;
        }

        Ok(())
    }

    fn handle_handshake_error(&self, peer: SocketAddr, error: HandshakeError) {
        if error.is_fatal() {
            warn!("Handshake with peer [{}] failed: {}", peer, error);
            self.terminate_ongoing_handshake(peer, error.description);
            if let Some(handler) = self.error_handler.read().as_ref() {
                handler.on_error(peer, error.level, error.description);
            }
        } else {
            debug!("Discarding record from peer [{}]: {}", peer, error);
        }
    }

    /// Abort the ongoing handshake with a fatal alert. An established
    /// session, if any, stays intact; without one the whole connection
    /// goes away.
    fn terminate_ongoing_handshake(&self, peer: SocketAddr, description: AlertDescription) {
        let Some(connection) = self.store.get(peer) else {
            return;
        };

        let mut guard = connection.lock();
        if guard.handshaker.is_none() {
            return;
        }
        info!("Aborting handshake with peer [{}]: {:?}", peer, description);

        let alert = Alert::fatal(description);
        if guard.established.is_none() {
            drop(guard);
            self.terminate_connection(&connection, Some(alert));
        } else {
            let inner = &mut *guard;
            if let Some(handshaker) = inner.handshaker.as_mut() {
                self.send_alert(handshaker.session_mut(), peer, alert);
            }
            inner.handshaker = None;
            inner.pending_flight = None;
            inner.flight_generation += 1;
        }
    }

    /// Tear the connection down: cancel the pending flight, optionally
    /// send a final alert, and remove all per-peer state. A fatal alert is
    /// followed by local teardown whether or not the datagram arrives.
    fn terminate_connection(&self, connection: &Connection, alert: Option<Alert>) {
        {
            let mut guard = connection.lock();
            guard.pending_flight = None;
            guard.flight_generation += 1;

            match alert {
                Some(alert) => {
                    debug!(
                        "Terminating connection with peer [{}], reason [{:?}]",
                        connection.peer_addr(),
                        alert.description
                    );
                    let inner = &mut *guard;
                    let session = match inner.established.as_mut() {
                        Some(s) => Some(s),
                        None => inner.handshaker.as_mut().map(|h| h.session_mut()),
                    };
                    if let Some(session) = session {
                        self.send_alert(session, connection.peer_addr(), alert);
                    }
                }
                None => {
                    debug!(
                        "Terminating connection with peer [{}]",
                        connection.peer_addr()
                    );
                }
            }
        }

        self.store.remove(connection.peer_addr());
        self.fragments.lock().evict_peer(connection.peer_addr());
    }
}
