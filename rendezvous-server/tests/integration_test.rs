//! Integration tests for the rendezvous server
//!
//! Each test binds a server on an ephemeral loopback port, runs it on a
//! background thread and talks to it with plain sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use punch_proto::{decode, encode, Message, Op, Shutdown, StreamDecoder};
use rendezvous_server::{Phase, Registry, RendezvousServer, ServerConfig, ServerError};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct TestServer {
    udp: SocketAddr,
    tcp: Option<SocketAddr>,
    registry: Arc<Registry>,
    shutdown: Shutdown,
    handle: Option<JoinHandle<Result<(), ServerError>>>,
}

impl TestServer {
    fn start(config: ServerConfig) -> Self {
        let server = RendezvousServer::bind(config).unwrap();
        let udp = server.udp_addrs()[0];
        let tcp = server.tcp_addrs().first().copied();
        let registry = server.registry();
        let shutdown = Shutdown::new();
        let handle = server.spawn(shutdown.clone()).unwrap();

        TestServer {
            udp,
            tcp,
            registry,
            shutdown,
            handle: Some(handle),
        }
    }

    fn loopback() -> Self {
        Self::start(loopback_config())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn loopback_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        listen: vec!["127.0.0.1".parse().unwrap()],
        ..ServerConfig::default()
    }
}

struct Client {
    socket: UdpSocket,
}

impl Client {
    fn new() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
        Client { socket }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    fn send(&self, to: SocketAddr, msg: &Message) {
        self.socket.send_to(&encode(msg).unwrap(), to).unwrap();
    }

    fn recv(&self) -> Message {
        let mut buf = [0u8; 2048];
        let (len, _) = self.socket.recv_from(&mut buf).unwrap();
        decode(&buf[..len]).unwrap()
    }

    fn recv_nothing(&self, wait: Duration) -> bool {
        self.socket.set_read_timeout(Some(wait)).unwrap();
        let mut buf = [0u8; 2048];
        let silent = self.socket.recv_from(&mut buf).is_err();
        self.socket.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
        silent
    }
}

/// Poll `cond` until it holds or a few seconds pass
fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

// ============================================================================
// NAT probes
// ============================================================================

#[test]
fn test_probe_replies_carry_observed_address() {
    let server = TestServer::loopback();
    let client = Client::new();

    client.send(server.udp, &Message::new(Op::Ping1, "p1"));
    let pong1 = client.recv();
    assert_eq!(pong1.op, Op::Pong1);
    assert_eq!(pong1.public, client.addr().to_string());

    client.send(server.udp, &Message::new(Op::Ping2, "p1"));
    let pong2 = client.recv();
    assert_eq!(pong2.op, Op::Pong2);
    assert_eq!(pong2.public, pong1.public);
}

#[test]
fn test_tcp_probe_reply() {
    let server = TestServer::loopback();
    let tcp = server.tcp.expect("TCP listener");

    let mut stream = TcpStream::connect(tcp).unwrap();
    stream.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
    let local = stream.local_addr().unwrap();

    // Two probes in one write exercise the stream framing
    let mut bytes = encode(&Message::new(Op::Ping1, "p1")).unwrap();
    bytes.extend(encode(&Message::new(Op::Ping2, "p1")).unwrap());
    stream.write_all(&bytes).unwrap();

    let mut decoder = StreamDecoder::new();
    let mut replies = Vec::new();
    let mut buf = [0u8; 1024];
    while replies.len() < 2 {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "server closed early");
        decoder.push(&buf[..n]);
        while let Some(msg) = decoder.next_message() {
            replies.push(msg.unwrap());
        }
    }

    assert_eq!(replies[0].op, Op::Pong1);
    assert_eq!(replies[1].op, Op::Pong2);
    assert_eq!(replies[0].public, local.to_string());
    assert_eq!(replies[1].public, local.to_string());
}

// ============================================================================
// Matching
// ============================================================================

/// Two peers complete the probes, report, and one requests a match
#[test]
fn test_two_peers_are_introduced() {
    let server = TestServer::loopback();
    let p1 = Client::new();
    let p2 = Client::new();

    for (client, id) in [(&p1, "p1"), (&p2, "p2")] {
        client.send(server.udp, &Message::new(Op::Ping1, id));
        assert_eq!(client.recv().op, Op::Pong1);
        client.send(server.udp, &Message::new(Op::Ping2, id));
        assert_eq!(client.recv().op, Op::Pong2);
        client.send(server.udp, &Message::new(Op::Report, id));
    }

    let registry = Arc::clone(&server.registry);
    assert!(wait_for(|| {
        ["p1", "p2"]
            .iter()
            .all(|id| registry.get(id).map(|r| r.phase) == Some(Phase::Seeking))
    }));
    assert_eq!(registry.len(), 2);

    p1.send(server.udp, &Message::new(Op::Request, "p1").with_ping_num(20));

    let pong3 = p1.recv();
    assert_eq!(pong3.op, Op::Pong3);
    assert_eq!(pong3.msg, "p2");
    assert_eq!(pong3.peer, p2.addr().to_string());
    assert_eq!(pong3.ping_num, 20);

    let notify = p2.recv();
    assert_eq!(notify.op, Op::Notify);
    assert_eq!(notify.msg, "p1");
    assert_eq!(notify.peer, p1.addr().to_string());
    assert_eq!(notify.ping_num, 20);

    assert!(wait_for(|| registry.get("p1").is_none() && registry.get("p2").is_none()));

    // p2's own request, sent after the match, finds nobody and registers nothing
    p2.send(server.udp, &Message::new(Op::Request, "p2").with_ping_num(20));
    assert!(p2.recv_nothing(Duration::from_millis(300)));
    assert!(registry.get("p1").is_none());
    assert!(registry.get("p2").is_none());
    assert!(registry.is_empty());
}

#[test]
fn test_request_alone_waits() {
    let server = TestServer::loopback();
    let p1 = Client::new();

    p1.send(server.udp, &Message::new(Op::Request, "p1"));
    assert!(p1.recv_nothing(Duration::from_millis(300)));
    assert!(server.registry.get("p1").is_none());
}

#[test]
fn test_relay_between_peers() {
    let server = TestServer::loopback();
    let p1 = Client::new();
    let p2 = Client::new();

    p1.send(
        server.udp,
        &Message::new(Op::Relay, "p1")
            .with_peer(p2.addr().to_string())
            .with_msg("hi"),
    );

    let relayed = p2.recv();
    assert_eq!(relayed.op, Op::Relay);
    assert_eq!(relayed.id, "p1");
    assert_eq!(relayed.peer, p1.addr().to_string());
    assert_eq!(relayed.msg, "hi");
}

// ============================================================================
// Expiry and robustness
// ============================================================================

#[test]
fn test_records_expire_after_ttl() {
    let server = TestServer::start(ServerConfig {
        record_ttl: Duration::from_millis(200),
        report_interval: Duration::ZERO,
        sweep_interval: Duration::from_millis(50),
        ..loopback_config()
    });
    let p1 = Client::new();

    p1.send(server.udp, &Message::new(Op::Report, "p1"));
    let registry = Arc::clone(&server.registry);
    assert!(wait_for(|| registry.get("p1").is_some()));
    assert!(wait_for(|| registry.get("p1").is_none()));
}

#[test]
fn test_bad_datagrams_do_not_stop_the_server() {
    let server = TestServer::loopback();
    let client = Client::new();

    client.socket.send_to(b"definitely not json", server.udp).unwrap();
    client.socket.send_to(br#"{"id":"p1"}"#, server.udp).unwrap();
    client.send(server.udp, &Message::new(Op::Ping1, ""));
    client.send(server.udp, &Message::new(Op::from("teleport"), "p1"));

    client.send(server.udp, &Message::new(Op::Ping1, "p1"));
    assert_eq!(client.recv().op, Op::Pong1);
}

#[test]
fn test_shutdown_stops_server() {
    let server = RendezvousServer::bind(loopback_config()).unwrap();
    let shutdown = Shutdown::new();
    let handle = server.spawn(shutdown.clone()).unwrap();

    thread::sleep(Duration::from_millis(50));
    shutdown.trigger();

    let start = Instant::now();
    handle.join().unwrap().unwrap();
    assert!(start.elapsed() < Duration::from_secs(3));
}
