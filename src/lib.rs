//! dconn — multi-peer DTLS 1.2 connector (RFC 6347)
//!
//! dconn is the transport core of a DTLS 1.2 endpoint: it multiplexes many
//! peers over a single UDP socket, routes inbound records to per-peer state,
//! drives handshake flights with retransmission and reassembly, performs
//! stateless cookie verification and enforces the record layer's semantics
//! (epochs, sequence numbers, replay windows, alert-driven termination).
//!
//! # Goals
//! - **DTLS 1.2 record routing**: epochs, replay windows, per-peer sessions.
//! - **Safety**: `forbid(unsafe_code)` throughout the crate.
//! - **Anti-amplification**: stateless HMAC cookies; no per-peer state
//!   before return-routability is proven.
//! - **Reliability**: flight retransmission with exponential backoff and
//!   handshake fragment reassembly, which UDP itself does not provide.
//!
//! ## Non-goals
//! - **Cipher-suite internals** (consumed via the [`RecordCipher`] trait)
//! - **Handshake message internals** (consumed via the [`Handshaker`] trait)
//! - **Certificate chain validation**
//! - **DTLS 1.3**
//!
//! # Integration model
//!
//! The connector owns the socket and three background threads: a receiver,
//! a sender draining the bounded outbound queue, and a retransmission
//! timer. You supply a [`HandshakerFactory`] for the four handshake
//! variants (client, server, resuming client, resuming server) and receive
//! decrypted application data through a [`DataHandler`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use dconn::{Config, Connector, RawData};
//! # fn handshaker_factory() -> Arc<dyn dconn::HandshakerFactory> { unimplemented!() }
//!
//! fn main() -> Result<(), dconn::Error> {
//!     let config = Config::builder("0.0.0.0:5684".parse().unwrap()).build();
//!     let connector = Connector::new(config, handshaker_factory());
//!
//!     connector.set_data_handler(Box::new(|data: RawData| {
//!         println!("{} bytes from {}", data.bytes.len(), data.peer);
//!     }));
//!
//!     connector.start()?;
//!
//!     // send() is non-blocking; a handshake starts automatically when no
//!     // session exists with the peer
//!     connector.send(RawData::new("192.0.2.1:5684".parse().unwrap(), b"hello".to_vec()))?;
//!
//!     connector.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Lifecycle
//!
//! [`Connector::stop`] keeps the connection store, so a subsequent
//! [`Connector::start`] re-binds the same address with all sessions intact.
//! [`Connector::destroy`] additionally clears the store.
#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::upper_case_acronyms)]

// DTLS 1.2 handshake flow, with the stateless cookie exchange in front:
//
// Client                                               Server
//
// 1     ClientHello                  -------->
//
// 2                                  <--------   HelloVerifyRequest
//                                                 (contains cookie)
//
// 3     ClientHello                  -------->
//       (with cookie)
// 4                                                     ServerHello
//                                                      Certificate*
//                                                ServerKeyExchange*
//                                               CertificateRequest*
//                                    <--------      ServerHelloDone
// 5     Certificate*
//       ClientKeyExchange
//       CertificateVerify*
//       [ChangeCipherSpec]
//       Finished                     -------->
// 6                                              [ChangeCipherSpec]
//                                    <--------             Finished
//       Application Data             <------->     Application Data

#[macro_use]
extern crate log;

use std::net::SocketAddr;

mod util;

pub mod message;

mod fragment;
pub use fragment::FragmentBuffer;

mod window;
pub use window::ReplayWindow;

mod cookie;
pub use cookie::CookieFactory;

mod timer;
pub use timer::ExponentialBackoff;

mod error;
pub use error::Error;

mod config;
pub use config::{Config, ConfigBuilder, Credentials};

mod session;
pub use session::{PeerIdentity, RecordCipher, Session, MAX_PLAINTEXT_FRAGMENT_LENGTH};

mod handshaker;
pub use handshaker::{
    HandshakeError, HandshakeInput, Handshaker, HandshakerFactory, SessionListener,
};

mod connection;
pub use connection::{Connection, ConnectionInner, Flight, FlightRecord};

mod store;
pub use store::{ConnectionStore, InMemoryConnectionStore};

mod connector;
pub use connector::{
    Connector, DataHandler, ErrorHandler, SessionInfo, MAX_CIPHERTEXT_EXPANSION,
};

/// An application message bound to a peer address, together with the
/// peer's identity when known.
#[derive(Debug)]
pub struct RawData {
    /// The remote endpoint.
    pub peer: SocketAddr,
    /// The (plaintext) payload.
    pub bytes: Vec<u8>,
    /// The authenticated peer identity, populated on inbound delivery.
    pub identity: Option<PeerIdentity>,
}

impl RawData {
    /// A message to `peer` with no identity attached.
    pub fn new(peer: SocketAddr, bytes: Vec<u8>) -> Self {
        RawData {
            peer,
            bytes,
            identity: None,
        }
    }
}
