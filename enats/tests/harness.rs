// Testing the harness looks like this:
// 1. Construct a harness and start it
// 2. Connect extra clients to harness.url()
// 3. Move messages between them and the harness client
// 4. Stop the harness and check the port is released

use enats::{Config, EmbeddedNats, Error, State};
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn init() {
    let _ = pretty_env_logger::try_init();
}

fn started() -> EmbeddedNats {
    init();
    let mut harness = EmbeddedNats::with_config(Config::default()).unwrap();
    harness.start().unwrap();
    harness
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[test]
fn test_port_is_free_at_construction() {
    init();
    let mut harness = EmbeddedNats::with_config(Config::default()).unwrap();
    assert_eq!(harness.state(), State::Constructed);
    assert!(harness.conn().is_none());
    assert!(port_is_free(harness.port()));
    assert_eq!(harness.url(), format!("nats://localhost:{}", harness.port()));

    harness.start().unwrap();
    assert_eq!(harness.state(), State::Running);
    assert!(harness.conn().is_some());
    harness.stop().unwrap();
}

#[test]
fn test_publish_reaches_external_subscriber() {
    let mut harness = started();

    let external = nats::connect(&harness.url()[..]).unwrap();
    let sub = external.subscribe("test.subject").unwrap();
    external.flush().unwrap();

    let conn = harness.conn().unwrap();
    conn.publish("test.subject", "payload").unwrap();
    conn.flush().unwrap();

    let msg = sub.next_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(msg.subject, "test.subject");
    assert_eq!(msg.data, b"payload".to_vec());

    external.close();
    harness.stop().unwrap();
}

#[test]
fn test_request_reply_through_harness() {
    let mut harness = started();

    let responder = nats::connect(&harness.url()[..]).unwrap();
    let sub = responder.subscribe("svc.echo").unwrap();
    responder.flush().unwrap();
    let worker = thread::spawn(move || {
        let req = sub.next_timeout(RECV_TIMEOUT).unwrap();
        req.respond(&req.data).unwrap();
    });

    let resp = harness
        .conn()
        .unwrap()
        .request_timeout("svc.echo", "ping", RECV_TIMEOUT)
        .unwrap();
    assert_eq!(resp.data, b"ping".to_vec());

    worker.join().unwrap();
    responder.close();
    harness.stop().unwrap();
}

#[test]
fn test_request_without_responders_fails_fast() {
    let mut harness = started();
    let began = Instant::now();
    let result = harness.conn().unwrap().request_timeout(
        "nobody.home",
        "ping",
        Duration::from_secs(5),
    );
    assert!(result.is_err());
    // the server answers with a no-responders status instead of
    // leaving the request to time out
    assert!(
        began.elapsed() < Duration::from_secs(2),
        "request took {:?}",
        began.elapsed()
    );
    harness.stop().unwrap();
}

#[test]
fn test_start_fails_when_port_is_taken() {
    init();
    let mut harness = EmbeddedNats::with_config(Config {
        ready_timeout_ms: 500,
        ..Config::default()
    })
    .unwrap();
    let squatter = TcpListener::bind(("127.0.0.1", harness.port())).unwrap();

    match harness.start() {
        Err(Error::ServerNotReady { port, timeout }) => {
            assert_eq!(port, harness.port());
            assert_eq!(timeout, Duration::from_millis(500));
        }
        other => panic!("expected ServerNotReady, got {:?}", other),
    }
    assert_eq!(harness.state(), State::Stopped);
    assert!(harness.conn().is_none());

    // a failed harness holds nothing once the squatter leaves
    drop(squatter);
    assert!(port_is_free(harness.port()));
}

#[test]
fn test_publish_after_stop_fails() {
    let mut harness = started();
    let conn = harness.conn().unwrap().clone();
    conn.publish("test.subject", "before").unwrap();

    harness.stop().unwrap();
    assert_eq!(harness.state(), State::Stopped);
    assert!(harness.conn().is_none());
    assert!(conn.publish("test.subject", "payload").is_err());
}

#[test]
fn test_harnesses_are_isolated() {
    let mut a = started();
    let mut b = started();
    assert_ne!(a.port(), b.port());

    let client_a = nats::connect(&a.url()[..]).unwrap();
    let client_b = nats::connect(&b.url()[..]).unwrap();
    let sub_a = client_a.subscribe("test.subject").unwrap();
    let sub_b = client_b.subscribe("test.subject").unwrap();
    client_a.flush().unwrap();
    client_b.flush().unwrap();

    a.conn().unwrap().publish("test.subject", "for a").unwrap();
    b.conn().unwrap().publish("test.subject", "for b").unwrap();

    assert_eq!(sub_a.next_timeout(RECV_TIMEOUT).unwrap().data, b"for a".to_vec());
    assert_eq!(sub_b.next_timeout(RECV_TIMEOUT).unwrap().data, b"for b".to_vec());
    assert!(sub_a.next_timeout(Duration::from_millis(200)).is_err());
    assert!(sub_b.next_timeout(Duration::from_millis(200)).is_err());

    client_a.close();
    client_b.close();
    a.stop().unwrap();
    b.stop().unwrap();
}

#[test]
fn test_stop_releases_port() {
    let mut harness = started();
    let port = harness.port();
    assert!(!port_is_free(port));
    harness.stop().unwrap();
    assert!(port_is_free(port));
}

#[test]
fn test_drop_releases_port() {
    let harness = started();
    let port = harness.port();
    drop(harness);
    assert!(port_is_free(port));
}

#[test]
fn test_lifecycle_misuse_is_an_error() {
    init();
    let mut harness = EmbeddedNats::with_config(Config::default()).unwrap();
    match harness.stop() {
        Err(Error::InvalidState { op, state }) => {
            assert_eq!(op, "stop");
            assert_eq!(state, State::Constructed);
        }
        other => panic!("expected InvalidState, got {:?}", other),
    }

    harness.start().unwrap();
    assert!(matches!(
        harness.start(),
        Err(Error::InvalidState {
            op: "start",
            state: State::Running
        })
    ));

    harness.stop().unwrap();
    assert!(matches!(
        harness.stop(),
        Err(Error::InvalidState {
            op: "stop",
            state: State::Stopped
        })
    ));
    assert!(matches!(
        harness.start(),
        Err(Error::InvalidState {
            op: "start",
            state: State::Stopped
        })
    ));
}

#[test]
fn test_server_tracks_clients() {
    let mut harness = started();
    assert_eq!(harness.server().num_clients(), 1);
    assert!(!harness.server().addrs().is_empty());

    let external = nats::connect(&harness.url()[..]).unwrap();
    let _sub = external.subscribe("test.>").unwrap();
    external.flush().unwrap();
    assert_eq!(harness.server().num_clients(), 2);
    assert!(harness.server().num_subscriptions() >= 1);

    external.close();
    harness.stop().unwrap();
}
