//! Connector lifecycle: start, stop, restart, destroy.


use std::sync::Arc;

use connector_common::*;
use dconn::{Config, Connection, ConnectionStore, Connector, InMemoryConnectionStore};

#[test]
fn start_is_idempotent() {
    let _ = env_logger::try_init();
    let config = Config::builder("127.0.0.1:0".parse().unwrap()).build();
    let connector = Connector::new(config, StubFactory::new());

    connector.start().expect("first start");
    let address = connector.address();
    connector.start().expect("second start");
    assert_eq!(connector.address(), address);
    assert!(connector.is_running());

    connector.stop();
    assert!(!connector.is_running());
    // stopping twice is harmless
    connector.stop();
}

#[test]
fn restart_rebinds_the_same_address_and_keeps_the_store() {
    let _ = env_logger::try_init();
    let store = Arc::new(InMemoryConnectionStore::new());
    let config = Config::builder("127.0.0.1:0".parse().unwrap()).build();
    let connector = Connector::with_store(config, StubFactory::new(), store.clone());

    connector.start().expect("start");
    let address = connector.address();

    let peer = "127.0.0.1:40001".parse().unwrap();
    store.put(Arc::new(Connection::new(peer)));

    connector.stop();
    // stop keeps the connection store
    assert_eq!(store.len(), 1);

    connector.restart().expect("restart");
    assert_eq!(connector.address(), address);
    assert!(connector.is_running());
    assert_eq!(store.len(), 1);

    connector.stop();
}

#[test]
fn destroy_clears_the_store() {
    let _ = env_logger::try_init();
    let store = Arc::new(InMemoryConnectionStore::new());
    let config = Config::builder("127.0.0.1:0".parse().unwrap()).build();
    let connector = Connector::with_store(config, StubFactory::new(), store.clone());

    connector.start().expect("start");
    store.put(Arc::new(Connection::new("127.0.0.1:40002".parse().unwrap())));

    connector.destroy();
    assert!(store.is_empty());
    assert!(!connector.is_running());

    // destroy does not preclude a fresh start
    connector.start().expect("start after destroy");
    connector.stop();
}

#[test]
fn mtu_reports_fallback_while_running_and_zero_when_stopped() {
    let _ = env_logger::try_init();
    let config = Config::builder("127.0.0.1:0".parse().unwrap()).build();
    let connector = Connector::new(config, StubFactory::new());

    assert_eq!(connector.mtu(), 0);
    connector.start().expect("start");
    // no override configured: the IPv6 minimum is assumed
    assert_eq!(connector.mtu(), 1280);
    connector.stop();
    assert_eq!(connector.mtu(), 0);
}

#[test]
fn configured_mtu_override_is_used() {
    let _ = env_logger::try_init();
    let config = Config::builder("127.0.0.1:0".parse().unwrap())
        .mtu(1400)
        .build();
    let connector = Connector::new(config, StubFactory::new());
    connector.start().expect("start");
    assert_eq!(connector.mtu(), 1400);
    connector.stop();
}

#[test]
fn max_fragment_length_defaults_to_plaintext_cap() {
    let _ = env_logger::try_init();
    let config = Config::builder("127.0.0.1:0".parse().unwrap()).build();
    let connector = Connector::new(config, StubFactory::new());
    let peer = "127.0.0.1:40003".parse().unwrap();
    assert_eq!(connector.max_fragment_length(peer), 16384);
}
