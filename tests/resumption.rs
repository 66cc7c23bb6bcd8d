//! Session resumption, including the address-change case.


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use connector_common::*;
use dconn::message::SessionId;
use dconn::{Config, Connection, ConnectionStore, Connector, InMemoryConnectionStore, Session};

fn seed_established(
    store: &InMemoryConnectionStore,
    peer: SocketAddr,
    session_id: &[u8],
) {
    let connection = Arc::new(Connection::new(peer));
    {
        let mut guard = connection.lock();
        let mut session = Session::new(peer, false);
        session.set_id(session_id.try_into().unwrap());
        session.set_cipher_suite(0xC02B);
        guard.established = Some(session);
    }
    store.put(connection);
    store.put_session_id(session_id.try_into().unwrap(), peer);
}

#[test]
fn resumption_with_address_change_replaces_old_connection() {
    let _ = env_logger::try_init();
    let store = Arc::new(InMemoryConnectionStore::new());
    let config = Config::builder("127.0.0.1:0".parse().unwrap()).build();
    let connector = Connector::with_store(config, StubFactory::new(), store.clone());
    connector.start().expect("start connector");
    let server = connector.address();

    // a previously completed handshake left session S at address alpha
    let alpha: SocketAddr = "127.0.0.1:39999".parse().unwrap();
    let session_id = [9u8; 16];
    seed_established(&store, alpha, &session_id);

    // the client reappears at beta, resuming by session id; first pass the
    // cookie exchange
    let beta = raw_socket();
    let body = client_hello_body(&[3u8; 32], &session_id, &[]);
    beta.send_to(
        &record(CT_HANDSHAKE, 0, 0, &handshake_message(CLIENT_HELLO, 0, &body)),
        server,
    )
    .expect("send hello");
    let (datagram, _) = recv_datagram(&beta);
    let verify = &parse_records(&datagram)[0];
    assert_eq!(verify.fragment[0], HELLO_VERIFY_REQUEST);
    // the unverified resumption attempt created no state and removed none
    assert_eq!(store.len(), 1);

    let cookie = cookie_from_hello_verify(&verify.fragment);
    let body = client_hello_body(&[3u8; 32], &session_id, &cookie);
    beta.send_to(
        &record(CT_HANDSHAKE, 0, 1, &handshake_message(CLIENT_HELLO, 1, &body)),
        server,
    )
    .expect("resend hello");

    // the abbreviated flight arrives at beta
    let (datagram, _) = recv_datagram(&beta);
    assert_eq!(parse_records(&datagram)[0].fragment[0], SERVER_HELLO);

    let beta_addr = beta.local_addr().unwrap();
    let resumed = store.get(beta_addr).expect("connection at new address");
    assert!(resumed.has_established_session());

    // the connection at the old address is gone, and the session id now
    // resolves to the new address
    assert!(store.get(alpha).is_none());
    assert_eq!(store.len(), 1);
    let sid: SessionId = session_id.as_slice().try_into().unwrap();
    let found = store.find(&sid).expect("session id resolvable");
    assert_eq!(found.peer_addr(), beta_addr);

    connector.stop();
}

#[test]
fn resuming_an_unknown_session_falls_back_to_full_handshake() {
    let _ = env_logger::try_init();
    let store = Arc::new(InMemoryConnectionStore::new());
    let config = Config::builder("127.0.0.1:0".parse().unwrap()).build();
    let connector = Connector::with_store(config, StubFactory::new(), store.clone());
    connector.start().expect("start connector");
    let server = connector.address();

    let client = raw_socket();
    let unknown_id = [0x55u8; 8];

    let body = client_hello_body(&[4u8; 32], &unknown_id, &[]);
    client
        .send_to(
            &record(CT_HANDSHAKE, 0, 0, &handshake_message(CLIENT_HELLO, 0, &body)),
            server,
        )
        .expect("send hello");
    let (datagram, _) = recv_datagram(&client);
    let cookie = cookie_from_hello_verify(&parse_records(&datagram)[0].fragment);

    let body = client_hello_body(&[4u8; 32], &unknown_id, &cookie);
    client
        .send_to(
            &record(CT_HANDSHAKE, 0, 1, &handshake_message(CLIENT_HELLO, 1, &body)),
            server,
        )
        .expect("resend hello");

    // a full handshake answers instead
    let (datagram, _) = recv_datagram(&client);
    assert_eq!(parse_records(&datagram)[0].fragment[0], SERVER_HELLO);
    assert_eq!(store.len(), 1);
    let connection = store.get(client.local_addr().unwrap()).unwrap();
    // full (not resuming) handshake: nothing established yet
    assert!(!connection.has_established_session());
    assert!(connection.has_ongoing_handshake());

    connector.stop();
}

#[test]
fn force_resume_triggers_abbreviated_handshake_on_next_send() {
    let _ = env_logger::try_init();
    let store = Arc::new(InMemoryConnectionStore::new());
    let config = Config::builder("127.0.0.1:0".parse().unwrap())
        .retransmission_timeout(Duration::from_millis(400))
        .build();
    let connector = Connector::with_store(config, StubFactory::new(), store.clone());
    connector.start().expect("start connector");

    let peer = raw_socket();
    let peer_addr = peer.local_addr().unwrap();
    let session_id = [7u8; 4];
    seed_established(&store, peer_addr, &session_id);

    connector.force_resume(peer_addr);
    connector
        .send(dconn::RawData::new(peer_addr, b"again".to_vec()))
        .expect("enqueue");

    // instead of application data, a resuming CLIENT_HELLO bearing the old
    // session id goes out in plaintext
    let (datagram, _) = recv_datagram(&peer);
    let records = parse_records(&datagram);
    assert_eq!(records[0].ctype, CT_HANDSHAKE);
    assert_eq!(records[0].epoch, 0);
    assert_eq!(records[0].fragment[0], CLIENT_HELLO);
    // session id offered in the hello (offset 12 header + 2 version + 32 random)
    let sid_len = records[0].fragment[46] as usize;
    assert_eq!(sid_len, session_id.len());
    assert_eq!(&records[0].fragment[47..47 + sid_len], &session_id);

    connector.stop();
}
