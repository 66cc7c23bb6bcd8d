//! Stateless cookie exchange (RFC 6347 §4.2.1).


use std::sync::Arc;

use connector_common::*;
use dconn::{Config, ConnectionStore, Connector, InMemoryConnectionStore};

#[test]
fn cookie_exchange_round_trip() {
    let _ = env_logger::try_init();
    let store = Arc::new(InMemoryConnectionStore::new());
    let config = Config::builder("127.0.0.1:0".parse().unwrap()).build();
    let connector = Connector::with_store(config, StubFactory::new(), store.clone());
    connector.start().expect("start connector");
    let server = connector.address();

    let client = raw_socket();

    // CLIENT_HELLO with an empty cookie
    let body = client_hello_body(&[7u8; 32], &[], &[]);
    let hello = handshake_message(CLIENT_HELLO, 7, &body);
    client
        .send_to(&record(CT_HANDSHAKE, 0, 42, &hello), server)
        .expect("send hello");

    let (datagram, _) = recv_datagram(&client);
    let records = parse_records(&datagram);
    assert_eq!(records.len(), 1);
    let verify = &records[0];
    assert_eq!(verify.ctype, CT_HANDSHAKE);
    assert_eq!(verify.epoch, 0);
    // record sequence number echoes the CLIENT_HELLO record
    assert_eq!(verify.seq, 42);
    // handshake type and message_seq echo
    assert_eq!(verify.fragment[0], HELLO_VERIFY_REQUEST);
    assert_eq!(
        u16::from_be_bytes([verify.fragment[4], verify.fragment[5]]),
        7
    );

    // no connection state was committed by the unverified hello
    assert_eq!(store.len(), 0);

    // resend with the returned cookie
    let cookie = cookie_from_hello_verify(&verify.fragment);
    assert!(!cookie.is_empty());
    let body = client_hello_body(&[7u8; 32], &[], &cookie);
    let hello = handshake_message(CLIENT_HELLO, 8, &body);
    client
        .send_to(&record(CT_HANDSHAKE, 0, 43, &hello), server)
        .expect("resend hello");

    let (datagram, _) = recv_datagram(&client);
    let records = parse_records(&datagram);
    assert_eq!(records[0].fragment[0], SERVER_HELLO);
    // server records continue from the triggering record's sequence number
    assert_eq!(records[0].seq, 43);
    assert_eq!(store.len(), 1);

    connector.stop();
}

#[test]
fn tampered_cookie_gets_another_hello_verify() {
    let _ = env_logger::try_init();
    let store = Arc::new(InMemoryConnectionStore::new());
    let config = Config::builder("127.0.0.1:0".parse().unwrap()).build();
    let connector = Connector::with_store(config, StubFactory::new(), store.clone());
    connector.start().expect("start connector");
    let server = connector.address();

    let client = raw_socket();

    let body = client_hello_body(&[9u8; 32], &[], &[]);
    client
        .send_to(
            &record(CT_HANDSHAKE, 0, 0, &handshake_message(CLIENT_HELLO, 0, &body)),
            server,
        )
        .expect("send hello");
    let (datagram, _) = recv_datagram(&client);
    let mut cookie = cookie_from_hello_verify(&parse_records(&datagram)[0].fragment);

    // flip one bit
    cookie[0] ^= 0x01;
    let body = client_hello_body(&[9u8; 32], &[], &cookie);
    client
        .send_to(
            &record(CT_HANDSHAKE, 0, 1, &handshake_message(CLIENT_HELLO, 1, &body)),
            server,
        )
        .expect("resend hello");

    let (datagram, _) = recv_datagram(&client);
    assert_eq!(parse_records(&datagram)[0].fragment[0], HELLO_VERIFY_REQUEST);
    assert_eq!(store.len(), 0);

    connector.stop();
}
