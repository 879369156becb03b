//! End-to-end transport tests over loopback
//!
//! Usage:
//!   RUST_LOG=emerald=debug cargo test --test transport_test -- --nocapture

use std::fmt::Debug;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use emerald::{
    Client, ClientEvent, ConnectionHandle, Error, Server, ServerConfig, ServerEvent, ServerHandler,
    ServerState,
};
use tracing_subscriber::EnvFilter;

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn start_server(capacity: usize) -> (Server, Receiver<ServerEvent>, u16) {
    init_tracing();
    let server = Server::with_config(ServerConfig::new(capacity).with_host("127.0.0.1"));
    let (tx, rx) = mpsc::channel::<ServerEvent>();
    let addr = server.listen(0, tx).unwrap();

    let listening = expect(&rx, |e| match e {
        ServerEvent::Listening(a) => Some(a),
        _ => None,
    });
    assert_eq!(listening, addr);
    assert_eq!(server.state(), ServerState::Listening);
    (server, rx, addr.port())
}

fn connect_client(port: u16) -> (Client, Receiver<ClientEvent>) {
    let client = Client::new();
    let (tx, rx) = mpsc::channel::<ClientEvent>();
    client.connect("127.0.0.1", port, tx).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ClientEvent::Connected);
    (client, rx)
}

/// Wait for the first event `pick` accepts, skipping the others
fn expect<E: Debug, T>(rx: &Receiver<E>, mut pick: impl FnMut(E) -> Option<T>) -> T {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = rx
            .recv_timeout(remaining)
            .expect("timed out waiting for event");
        if let Some(value) = pick(event) {
            return value;
        }
    }
}

/// Events that arrive within a short quiet period
fn drain_for<E>(rx: &Receiver<E>, period: Duration) -> Vec<E> {
    let deadline = Instant::now() + period;
    let mut seen = Vec::new();
    while let Ok(event) = rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        seen.push(event);
    }
    seen
}

fn accepted(rx: &Receiver<ServerEvent>) -> ConnectionHandle {
    expect(rx, |e| match e {
        ServerEvent::ClientConnected(c) => Some(c),
        _ => None,
    })
}

/// Receive completions may be chunked arbitrarily; gather `len` bytes
fn server_bytes(rx: &Receiver<ServerEvent>, len: usize) -> (ConnectionHandle, Vec<u8>) {
    let mut buf = Vec::new();
    let mut from = None;
    while buf.len() < len {
        let (conn, data) = expect(rx, |e| match e {
            ServerEvent::DataReceived(c, d) => Some((c, d)),
            _ => None,
        });
        buf.extend_from_slice(&data);
        from = Some(conn);
    }
    (from.unwrap(), buf)
}

fn client_bytes(rx: &Receiver<ClientEvent>, len: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    while buf.len() < len {
        let data = expect(rx, |e| match e {
            ClientEvent::DataReceived(d) => Some(d),
            _ => None,
        });
        buf.extend_from_slice(&data);
    }
    buf
}

#[test]
fn test_echo_ping_pong() {
    let (server, srx, port) = start_server(1);
    let (client, crx) = connect_client(port);
    let conn = accepted(&srx);
    assert!(conn.is_alive());

    client.send(b"ping".to_vec()).unwrap();
    let (from, data) = server_bytes(&srx, 4);
    assert_eq!(data, b"ping");
    assert_eq!(from, conn);

    server.send(&conn, b"pong".to_vec()).unwrap();
    assert_eq!(client_bytes(&crx, 4), b"pong");

    let sent = expect(&srx, |e| match e {
        ServerEvent::DataSent(_, n) => Some(n),
        _ => None,
    });
    assert_eq!(sent, 4);

    client.stop();
    server.stop();
    server.wait().unwrap();
}

#[test]
fn test_client_reports_data_sent() {
    let (server, srx, port) = start_server(1);
    let (client, crx) = connect_client(port);
    let _conn = accepted(&srx);

    client.send(&b"hello world"[..]).unwrap();
    let sent = expect(&crx, |e| match e {
        ClientEvent::DataSent(n) => Some(n),
        _ => None,
    });
    assert_eq!(sent, 11);

    server.stop();
    server.wait().unwrap();
}

#[test]
fn test_exhausted_pool_rejects_connection() {
    let (server, srx, port) = start_server(0);

    // Handshake completes in the kernel before the server looks at the pool
    let (_client, crx) = connect_client(port);

    expect(&srx, |e| match e {
        ServerEvent::ConnectionRejected(peer) => Some(peer),
        ServerEvent::ClientConnected(c) => panic!("unexpected connection {:?}", c),
        _ => None,
    });
    assert_eq!(server.connection_count(), 0);
    assert!(server.connections().is_empty());

    // The rejected socket is closed
    expect(&crx, |e| match e {
        ClientEvent::Disconnected => Some(()),
        _ => None,
    });

    let late = drain_for(&srx, QUIET);
    assert!(!late
        .iter()
        .any(|e| matches!(e, ServerEvent::ClientConnected(_))));

    server.stop();
    server.wait().unwrap();
}

#[test]
fn test_client_stop_disconnects_exactly_once() {
    let (server, srx, port) = start_server(2);
    let (client, crx) = connect_client(port);
    let conn = accepted(&srx);
    assert_eq!(server.pool().size(), 1);

    client.stop();
    let gone = expect(&srx, |e| match e {
        ServerEvent::ClientDisconnected(c) => Some(c),
        _ => None,
    });
    assert_eq!(gone, conn);
    assert!(!gone.is_alive());
    assert!(server.connection(conn.id()).is_none());
    assert_eq!(server.pool().size(), 2);
    assert_eq!(server.pool().outstanding(), 0);

    // Client side is normalised too
    expect(&crx, |e| match e {
        ClientEvent::Disconnected => Some(()),
        _ => None,
    });

    let late = drain_for(&srx, QUIET);
    assert!(!late
        .iter()
        .any(|e| matches!(e, ServerEvent::ClientDisconnected(_))));

    server.stop();
    server.wait().unwrap();
}

#[test]
fn test_double_stop_and_double_dispose_are_harmless() {
    let (server, srx, port) = start_server(1);
    let (client, crx) = connect_client(port);
    let conn = accepted(&srx);

    conn.disconnect();
    conn.disconnect();
    expect(&srx, |e| match e {
        ServerEvent::ClientDisconnected(c) => Some(c),
        _ => None,
    });
    expect(&crx, |e| match e {
        ClientEvent::Disconnected => Some(()),
        _ => None,
    });

    client.stop();
    client.stop();
    client.wait().unwrap();

    let late = drain_for(&srx, QUIET);
    assert!(!late
        .iter()
        .any(|e| matches!(e, ServerEvent::ClientDisconnected(_))));
    assert_eq!(server.pool().size(), 1);
    assert_eq!(server.pool().outstanding(), 0);

    assert!(matches!(conn.send(b"late".to_vec()), Err(Error::NotConnected)));
    assert!(matches!(client.send(b"late".to_vec()), Err(Error::NotConnected)));

    server.stop();
    server.stop();
    server.wait().unwrap();
}

#[test]
fn test_registry_tracks_pool_ownership() {
    let (server, srx, port) = start_server(3);

    let clients: Vec<_> = (0..3).map(|_| connect_client(port)).collect();
    let conns: Vec<_> = (0..3).map(|_| accepted(&srx)).collect();

    assert_eq!(server.connection_count(), 3);
    assert_eq!(server.pool().size(), 0);
    assert_eq!(server.pool().outstanding(), 3);

    let listed = server.connections();
    assert_eq!(listed.len(), 3);
    for conn in &conns {
        assert!(listed.contains(conn));
    }
    // Listed in accept order
    assert!(listed
        .windows(2)
        .all(|w| w[0].id().as_usize() < w[1].id().as_usize()));

    // Fourth peer finds the pool empty
    let (_extra, _extra_rx) = connect_client(port);
    expect(&srx, |e| match e {
        ServerEvent::ConnectionRejected(_) => Some(()),
        _ => None,
    });
    assert_eq!(server.connection_count(), 3);

    clients[1].0.stop();
    expect(&srx, |e| match e {
        ServerEvent::ClientDisconnected(c) => Some(c),
        _ => None,
    });
    assert_eq!(server.connection_count(), 2);
    assert_eq!(server.pool().size(), 1);
    assert_eq!(server.pool().outstanding(), 2);

    // Freed descriptor admits a new connection, under a fresh id
    let (_late, _late_rx) = connect_client(port);
    let late = accepted(&srx);
    assert!(conns.iter().all(|c| c.id().as_usize() < late.id().as_usize()));
    assert_eq!(server.connection_count(), 3);
    assert_eq!(server.pool().size(), 0);

    server.stop();
    server.wait().unwrap();
    assert_eq!(server.connection_count(), 0);
    assert_eq!(server.pool().size(), 3);
}

#[test]
fn test_concurrent_sends_stay_per_connection() {
    const MESSAGES: usize = 200;

    let (server, srx, port) = start_server(2);
    let (_a, arx) = connect_client(port);
    let first = accepted(&srx);
    let (_b, brx) = connect_client(port);
    let second = accepted(&srx);

    let writers: Vec<_> = [(first, b'a'), (second, b'b')]
        .into_iter()
        .map(|(conn, tag)| {
            let server = server.clone();
            thread::spawn(move || {
                for _ in 0..MESSAGES {
                    server.send(&conn, vec![tag; 16]).unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    // Each client sees only its own stream, in full; which client got which
    // tag depends on accept order
    let got_a = client_bytes(&arx, MESSAGES * 16);
    let got_b = client_bytes(&brx, MESSAGES * 16);
    assert_eq!(got_a.len(), MESSAGES * 16);
    assert_eq!(got_b.len(), MESSAGES * 16);
    assert!(got_a.iter().all(|&b| b == got_a[0]));
    assert!(got_b.iter().all(|&b| b == got_b[0]));
    assert_ne!(got_a[0], got_b[0]);

    server.stop();
    server.wait().unwrap();
}

#[test]
fn test_large_payload_survives_partial_writes() {
    let (server, srx, port) = start_server(1);
    let (_client, crx) = connect_client(port);
    let conn = accepted(&srx);

    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    server.send(&conn, payload.clone()).unwrap();

    let received = client_bytes(&crx, payload.len());
    assert_eq!(received, payload);

    let sent = expect(&srx, |e| match e {
        ServerEvent::DataSent(_, n) => Some(n),
        _ => None,
    });
    assert_eq!(sent, payload.len());

    server.stop();
    server.wait().unwrap();
}

#[test]
fn test_server_stop_disconnects_everyone() {
    let (server, srx, port) = start_server(2);
    let (_a, arx) = connect_client(port);
    let (_b, brx) = connect_client(port);
    accepted(&srx);
    accepted(&srx);

    server.stop();
    server.wait().unwrap();

    let events = drain_for(&srx, QUIET);
    let disconnected = events
        .iter()
        .filter(|e| matches!(e, ServerEvent::ClientDisconnected(_)))
        .count();
    assert_eq!(disconnected, 2);
    assert!(matches!(events.last(), Some(ServerEvent::Stopped)));
    assert_eq!(server.state(), ServerState::Stopped);

    for rx in [&arx, &brx] {
        expect(rx, |e| match e {
            ClientEvent::Disconnected => Some(()),
            _ => None,
        });
    }

    let (tx, _rx) = mpsc::channel::<ServerEvent>();
    assert!(matches!(server.listen(0, tx), Err(Error::InvalidState { .. })));
}

#[test]
fn test_listen_twice_fails_fast() {
    let (server, _srx, _port) = start_server(1);

    let (tx, _rx) = mpsc::channel::<ServerEvent>();
    let err = server.listen(0, tx).unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(server.state(), ServerState::Listening);

    server.stop();
    server.wait().unwrap();
}

#[test]
fn test_foreign_connection_is_rejected() {
    let (server, srx, port) = start_server(1);
    let (other, _orx, _) = start_server(1);
    let (_client, _crx) = connect_client(port);
    let conn = accepted(&srx);

    let err = other.send(&conn, b"x".to_vec()).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));

    server.stop();
    other.stop();
    server.wait().unwrap();
    other.wait().unwrap();
}

#[test]
fn test_send_before_connect_is_reported() {
    let client = Client::new();
    assert!(!client.is_connected());
    assert!(matches!(client.send(b"x".to_vec()), Err(Error::NotConnected)));
    client.stop();
}

#[test]
fn test_connect_refused_is_reported() {
    init_tracing();
    let port = {
        let vacant = TcpListener::bind("127.0.0.1:0").unwrap();
        vacant.local_addr().unwrap().port()
    };

    let client = Client::new();
    let (tx, rx) = mpsc::channel::<ClientEvent>();

    // The refusal may surface from connect(2) itself or as the completion
    let kind = match client.connect("127.0.0.1", port, tx) {
        Ok(()) => expect(&rx, |e| match e {
            ClientEvent::ConnectFailed(kind) => Some(kind),
            other => panic!("unexpected event {:?}", other),
        }),
        Err(Error::Io { source, .. }) => source.kind(),
        Err(other) => panic!("unexpected error {:?}", other),
    };
    assert_eq!(kind, std::io::ErrorKind::ConnectionRefused);
    client.wait().unwrap();
    assert!(!client.is_connected());
    assert_ne!(client.state(), emerald::ClientState::Connected);
}

#[test]
fn test_unresolvable_host_fails_synchronously() {
    let client = Client::new();
    let (tx, _rx) = mpsc::channel::<ClientEvent>();
    let err = client.connect("host.invalid", 80, tx).unwrap_err();
    assert!(matches!(err, Error::Resolve { .. }));
    assert_eq!(client.state(), emerald::ClientState::Idle);
}

#[test]
fn test_client_reconnects_after_session_ends() {
    let (server, srx, port) = start_server(1);
    let (client, crx) = connect_client(port);
    accepted(&srx);

    client.stop();
    expect(&crx, |e| match e {
        ClientEvent::Disconnected => Some(()),
        _ => None,
    });
    expect(&srx, |e| match e {
        ServerEvent::ClientDisconnected(c) => Some(c),
        _ => None,
    });
    client.wait().unwrap();

    let (tx, rx) = mpsc::channel::<ClientEvent>();
    client.connect("127.0.0.1", port, tx).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ClientEvent::Connected);
    let conn = accepted(&srx);

    client.send(b"again".to_vec()).unwrap();
    let (from, data) = server_bytes(&srx, 5);
    assert_eq!(from, conn);
    assert_eq!(data, b"again");

    server.stop();
    server.wait().unwrap();
}

/// Reports arrivals only; received data is counted and dropped
struct Arrivals {
    connected: mpsc::Sender<ConnectionHandle>,
    received: Arc<AtomicBool>,
}

impl ServerHandler for Arrivals {
    fn on_client_connected(&mut self, _server: &Server, connection: &ConnectionHandle) {
        let _ = self.connected.send(connection.clone());
    }

    fn on_data_received(&mut self, _server: &Server, _connection: &ConnectionHandle, _data: Vec<u8>) {
        self.received.store(true, Ordering::Release);
    }
}

#[test]
fn test_flooding_peer_does_not_stall_accept() {
    init_tracing();
    let server = Server::with_config(ServerConfig::new(4).with_host("127.0.0.1"));
    let (tx, arrivals) = mpsc::channel();
    let received = Arc::new(AtomicBool::new(false));
    let addr = server
        .listen(
            0,
            Arrivals {
                connected: tx,
                received: received.clone(),
            },
        )
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let flooder = {
        let done = done.clone();
        thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let block = vec![0x5a; 1 << 20];
            while !done.load(Ordering::Acquire) {
                if stream.write_all(&block).is_err() {
                    break;
                }
            }
        })
    };

    arrivals.recv_timeout(TIMEOUT).unwrap();
    let deadline = Instant::now() + TIMEOUT;
    while !received.load(Ordering::Acquire) {
        assert!(Instant::now() < deadline, "flood never reached the server");
        thread::sleep(Duration::from_millis(5));
    }
    // Let the socket fill up
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    let _second = TcpStream::connect(addr).unwrap();
    arrivals
        .recv_timeout(Duration::from_secs(1))
        .expect("second peer not accepted while the first one floods");
    assert!(started.elapsed() < Duration::from_secs(1));

    done.store(true, Ordering::Release);
    server.stop();
    server.wait().unwrap();
    flooder.join().unwrap();
}
