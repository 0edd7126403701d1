//! Integration tests: real sockets on localhost, full pipelines on both
//! ends: framing, TLS, the secure channel, ordering under load and
//! shutdown.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use weft_core::codec::tls::config::{client_config_with_roots, server_config_from};
use weft_core::{
    ByteCursor, Client, ConnectionId, Context, EngineConfig, FrameCodec, Handler, PeerNode, Pipeline,
    SecureChannelCodec, SecureChannelConfig, Server, TlsCodec, WeftError, WorkerPoolConfig,
};

const TIMEOUT: Duration = Duration::from_secs(10);

// ── Helpers ──────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Event {
    Connect(ConnectionId),
    Read(ConnectionId, Vec<u8>),
    Disconnect(ConnectionId),
}

/// Terminal handler forwarding every event to a channel.
struct Recorder {
    tx: Mutex<Sender<Event>>,
    echo: bool,
    /// Close the connection after the first read.
    hang_up: bool,
}

impl Recorder {
    fn new(echo: bool) -> (Arc<Self>, Receiver<Event>) {
        Self::build(echo, false)
    }

    fn hanging_up() -> (Arc<Self>, Receiver<Event>) {
        Self::build(false, true)
    }

    fn build(echo: bool, hang_up: bool) -> (Arc<Self>, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(tx),
                echo,
                hang_up,
            }),
            rx,
        )
    }

    fn send(&self, event: Event) {
        let _ = self.tx.lock().send(event);
    }
}

impl Handler for Recorder {
    fn on_connect(&self, ctx: &Context<'_>) -> Result<(), WeftError> {
        self.send(Event::Connect(ctx.connection().id()));
        Ok(())
    }

    fn on_read(&self, ctx: &Context<'_>, mut msg: ByteCursor) -> Result<(), WeftError> {
        let body = msg.read_all();
        if self.echo {
            ctx.write(ByteCursor::from(body.as_slice()))?;
        }
        self.send(Event::Read(ctx.connection().id(), body));
        if self.hang_up {
            ctx.connection().close();
        }
        Ok(())
    }

    fn on_disconnect(&self, ctx: &Context<'_>) -> Result<(), WeftError> {
        self.send(Event::Disconnect(ctx.connection().id()));
        Ok(())
    }

    fn is_terminal(&self) -> bool {
        true
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        pool: WorkerPoolConfig {
            core_threads: 2,
            max_threads: 4,
            ..Default::default()
        },
        secure: SecureChannelConfig {
            key_bits: 512,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn pipeline(handlers: Vec<Arc<dyn Handler>>) -> Pipeline {
    Pipeline::builder().add(handlers).unwrap().build().unwrap()
}

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Next read payload, skipping connect events.
fn next_read(rx: &Receiver<Event>) -> Vec<u8> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left).expect("timed out waiting for data") {
            Event::Read(_, body) => return body,
            Event::Connect(_) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ── Framing ──────────────────────────────────────────────────────

#[test]
fn frame_echo_round_trip() {
    let cfg = config();
    let (server_sink, server_rx) = Recorder::new(true);
    let mut server = Server::bind(
        localhost(),
        pipeline(vec![Arc::new(FrameCodec::new(0, 3, 3).unwrap()), server_sink]),
        &cfg,
    )
    .unwrap();

    // The client writes raw frames and sees whole frames back.
    let (client_sink, client_rx) = Recorder::new(false);
    let mut client = Client::new(
        pipeline(vec![
            Arc::new(FrameCodec::new(0, 3, 3).unwrap().strip_header(false)),
            client_sink,
        ]),
        &cfg,
    )
    .unwrap();

    let conn = client.connect(server.local_addr()).unwrap();
    client
        .send(&conn, ByteCursor::from(&b"\x00\x00\x05HELLO"[..]))
        .unwrap();

    assert_eq!(next_read(&server_rx), b"HELLO");
    assert_eq!(next_read(&client_rx), b"\x00\x00\x05HELLO");

    client.shutdown();
    server.stop();
}

#[test]
fn many_connections_keep_their_order() {
    const CONNECTIONS: usize = 8;
    const MESSAGES: usize = 50;

    let cfg = config();
    let (server_sink, _server_rx) = Recorder::new(true);
    let mut server = Server::bind(
        localhost(),
        pipeline(vec![Arc::new(FrameCodec::new(0, 2, 2).unwrap()), server_sink]),
        &cfg,
    )
    .unwrap();

    let (client_sink, client_rx) = Recorder::new(false);
    let mut client = Client::new(
        pipeline(vec![Arc::new(FrameCodec::new(0, 2, 2).unwrap()), client_sink]),
        &cfg,
    )
    .unwrap();

    let conns: Vec<_> = (0..CONNECTIONS)
        .map(|_| client.connect(server.local_addr()).unwrap())
        .collect();
    let tags: HashMap<ConnectionId, usize> = conns.iter().enumerate().map(|(i, c)| (c.id(), i)).collect();

    // Senders run in parallel so writes for different connections race.
    std::thread::scope(|scope| {
        for (i, conn) in conns.iter().enumerate() {
            let client = &client;
            scope.spawn(move || {
                for m in 0..MESSAGES {
                    let msg = format!("conn-{i}:msg-{m:03}:{}", "x".repeat(m * 7));
                    client.send(conn, ByteCursor::from(msg.as_bytes())).unwrap();
                }
            });
        }
    });

    let mut seen: HashMap<usize, Vec<String>> = HashMap::new();
    let mut total = 0;
    while total < CONNECTIONS * MESSAGES {
        match client_rx.recv_timeout(TIMEOUT).expect("timed out waiting for echoes") {
            Event::Read(id, body) => {
                seen.entry(tags[&id]).or_default().push(String::from_utf8(body).unwrap());
                total += 1;
            }
            Event::Connect(_) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    for i in 0..CONNECTIONS {
        let got = &seen[&i];
        assert_eq!(got.len(), MESSAGES);
        for (m, msg) in got.iter().enumerate() {
            assert!(msg.starts_with(&format!("conn-{i}:msg-{m:03}:")), "{msg}");
            assert_eq!(msg.len(), format!("conn-{i}:msg-{m:03}:").len() + m * 7);
        }
    }

    client.shutdown();
    server.stop();
}

// ── Secure channel ───────────────────────────────────────────────

#[test]
fn secure_channel_round_trip() {
    let cfg = config();
    let codec = SecureChannelCodec::new(&cfg.secure).unwrap();
    let (server_sink, server_rx) = Recorder::new(true);
    let mut server = Server::bind(
        localhost(),
        pipeline(vec![Arc::new(codec.clone()), server_sink]),
        &cfg,
    )
    .unwrap();

    let (client_sink, client_rx) = Recorder::new(false);
    let mut client = Client::new(pipeline(vec![Arc::new(codec), client_sink]), &cfg).unwrap();

    let conn = client.connect(server.local_addr()).unwrap();
    // Both go out as soon as the session key is in place.
    let big: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    client.send(&conn, ByteCursor::from(&b"ping"[..])).unwrap();
    client.send(&conn, ByteCursor::from(big.as_slice())).unwrap();

    assert_eq!(next_read(&server_rx), b"ping");
    assert_eq!(next_read(&server_rx), big);
    assert_eq!(next_read(&client_rx), b"ping");
    assert_eq!(next_read(&client_rx), big);

    client.shutdown();
    server.stop();
}

// ── TLS ──────────────────────────────────────────────────────────

#[test]
fn tls_echo_round_trip() {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let cfg = config();
    let server_tls = TlsCodec::server(server_config_from("TLSv1.3", vec![cert_der.clone()], key).unwrap());
    let client_tls = TlsCodec::client(
        client_config_with_roots("TLS", vec![cert_der]).unwrap(),
        "localhost",
    )
    .unwrap();

    let (server_sink, server_rx) = Recorder::new(true);
    let mut server = Server::bind(localhost(), pipeline(vec![Arc::new(server_tls), server_sink]), &cfg).unwrap();
    let (client_sink, client_rx) = Recorder::new(false);
    let mut client = Client::new(pipeline(vec![Arc::new(client_tls), client_sink]), &cfg).unwrap();

    let conn = client.connect(server.local_addr()).unwrap();
    client.send(&conn, ByteCursor::from(&b"hello over tls"[..])).unwrap();

    // The connect event only arrives once the handshake is done.
    match client_rx.recv_timeout(TIMEOUT).unwrap() {
        Event::Connect(id) => assert_eq!(id, conn.id()),
        other => panic!("expected connect, got {other:?}"),
    }
    assert_eq!(next_read(&server_rx), b"hello over tls");
    assert_eq!(next_read(&client_rx), b"hello over tls");

    client.shutdown();
    server.stop();
}

// ── Peer links ───────────────────────────────────────────────────

#[test]
fn peer_nodes_exchange_over_secure_links() {
    let cfg = config();
    let (hub_sink, hub_rx) = Recorder::new(true);
    let mut hub = PeerNode::start(localhost(), &[], vec![hub_sink], &cfg).unwrap();

    let (edge_sink, edge_rx) = Recorder::new(false);
    let mut edge = PeerNode::start(localhost(), &[hub.local_addr()], vec![edge_sink], &cfg).unwrap();
    assert_eq!(edge.peers(), vec![hub.local_addr()]);
    let link = edge.link(hub.local_addr()).unwrap();

    edge.send(hub.local_addr(), ByteCursor::from(&b"gossip"[..])).unwrap();
    assert_eq!(next_read(&hub_rx), b"gossip");
    assert_eq!(next_read(&edge_rx), b"gossip");

    let stranger: SocketAddr = "127.0.0.1:9".parse().unwrap();
    assert!(matches!(
        edge.send(stranger, ByteCursor::from(&b"?"[..])),
        Err(WeftError::UnknownPeer(addr)) if addr == stranger
    ));

    assert!(edge.disconnect(hub.local_addr()));
    assert!(!edge.disconnect(hub.local_addr()));
    assert_eq!(edge_rx.recv_timeout(TIMEOUT).unwrap(), Event::Disconnect(link.id()));
    assert!(edge.peers().is_empty());

    edge.stop();
    hub.stop();
}

// ── Lifecycle ────────────────────────────────────────────────────

#[test]
fn stop_fires_disconnect_on_both_ends() {
    let cfg = config();
    let (server_sink, server_rx) = Recorder::new(false);
    let mut server = Server::bind(localhost(), pipeline(vec![server_sink]), &cfg).unwrap();
    let (client_sink, client_rx) = Recorder::new(false);
    let mut client = Client::new(pipeline(vec![client_sink]), &cfg).unwrap();

    let conn = client.connect(server.local_addr()).unwrap();
    assert!(matches!(client_rx.recv_timeout(TIMEOUT).unwrap(), Event::Connect(_)));
    let server_id = match server_rx.recv_timeout(TIMEOUT).unwrap() {
        Event::Connect(id) => id,
        other => panic!("expected connect, got {other:?}"),
    };
    wait_for(|| server.active_connections() == 1);

    server.stop();
    assert!(!server.is_running());
    assert_eq!(server_rx.recv_timeout(TIMEOUT).unwrap(), Event::Disconnect(server_id));
    // The client sees the peer go away.
    assert_eq!(client_rx.recv_timeout(TIMEOUT).unwrap(), Event::Disconnect(conn.id()));
    wait_for(|| conn.is_closed());
    assert!(client.send(&conn, ByteCursor::from(&b"late"[..])).is_err());

    client.shutdown();
}

#[test]
fn handler_close_fires_disconnect() {
    let cfg = config();
    let (sink, rx) = Recorder::hanging_up();
    let mut server = Server::bind(localhost(), pipeline(vec![sink]), &cfg).unwrap();

    let mut peer = std::net::TcpStream::connect(server.local_addr()).unwrap();
    peer.set_read_timeout(Some(TIMEOUT)).unwrap();
    let id = match rx.recv_timeout(TIMEOUT).unwrap() {
        Event::Connect(id) => id,
        other => panic!("expected connect, got {other:?}"),
    };
    peer.write_all(b"bye").unwrap();
    assert_eq!(next_read(&rx), b"bye");
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Disconnect(id));

    let mut buf = [0u8; 8];
    assert_eq!(peer.read(&mut buf).unwrap(), 0);
    wait_for(|| server.active_connections() == 0);
    // Exactly one disconnect.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    server.stop();
}

#[test]
fn application_close_fires_disconnect() {
    let cfg = config();
    let (server_sink, _server_rx) = Recorder::new(false);
    let mut server = Server::bind(localhost(), pipeline(vec![server_sink]), &cfg).unwrap();
    let (sink, rx) = Recorder::new(false);
    let mut client = Client::new(pipeline(vec![sink]), &cfg).unwrap();

    let conn = client.connect(server.local_addr()).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Connect(conn.id()));
    conn.close();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Disconnect(conn.id()));

    client.shutdown();
    server.stop();
}

#[test]
fn connect_failure_reports_disconnect() {
    let cfg = config();
    // Grab a port and release it so nothing is listening there.
    let addr = std::net::TcpListener::bind(localhost()).unwrap().local_addr().unwrap();

    let (sink, rx) = Recorder::new(false);
    let mut client = Client::new(pipeline(vec![sink]), &cfg).unwrap();
    let conn = client.connect(addr).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Event::Disconnect(conn.id()));
    assert!(conn.is_closed());
    client.shutdown();
}
