//! TCP observed-address listener
//!
//! Mirrors the `ping1`/`ping2` exchange over TCP. A TCP connection already
//! pins one public endpoint, so nothing here touches the registry. Envelopes
//! arrive as a byte stream and are framed with [`StreamDecoder`].

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use punch_proto::message::RECV_BUFFER_SIZE;
use punch_proto::{encode, Shutdown, StreamDecoder};

use crate::discovery::build_observed_reply;
use crate::metrics::Metrics;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Connections beyond this are closed on accept
const MAX_CONNECTIONS: usize = 1024;

/// Connections silent for this long are closed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: StreamDecoder,
    outbox: Vec<u8>,
    last_activity: Instant,
}

pub struct TcpProbeListener {
    poll: Poll,
    /// Listener tokens are `0..listeners.len()`
    listeners: Vec<TcpListener>,
    local_addrs: Vec<SocketAddr>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    idle_timeout: Duration,
}

impl TcpProbeListener {
    /// Bind one listener per address
    pub fn bind(addrs: &[SocketAddr]) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listeners = Vec::with_capacity(addrs.len());
        let mut local_addrs = Vec::with_capacity(addrs.len());

        for (i, addr) in addrs.iter().enumerate() {
            let std_listener = punch_proto::net::bind_tcp_listener(*addr, true)?;
            let mut listener = TcpListener::from_std(std_listener);
            poll.registry()
                .register(&mut listener, Token(i), Interest::READABLE)?;

            let local = listener.local_addr()?;
            log::info!("TCP listening on {}", local);
            local_addrs.push(local);
            listeners.push(listener);
        }

        let next_token = listeners.len();
        Ok(TcpProbeListener {
            poll,
            listeners,
            local_addrs,
            connections: HashMap::new(),
            next_token,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn run(mut self, metrics: Arc<Metrics>, shutdown: Shutdown) -> io::Result<()> {
        let mut events = Events::with_capacity(128);

        while !shutdown.is_triggered() {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                let token = event.token();
                if token.0 < self.listeners.len() {
                    self.accept(token.0, &metrics);
                } else {
                    self.service(token, &metrics);
                }
            }

            self.close_idle(Instant::now());
        }

        log::info!("TCP listener stopped ({} open connections)", self.connections.len());
        Ok(())
    }

    fn accept(&mut self, index: usize, metrics: &Metrics) {
        loop {
            let (mut stream, peer) = match self.listeners[index].accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("TCP accept on {} failed: {}", self.local_addrs[index], e);
                    break;
                }
            };

            if self.connections.len() >= MAX_CONNECTIONS {
                log::warn!("Too many TCP connections, closing {}", peer);
                Metrics::incr(&metrics.dropped_total);
                continue;
            }

            let token = Token(self.next_token);
            self.next_token += 1;

            if let Err(e) = self.poll.registry().register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                log::warn!("Failed to register TCP connection from {}: {}", peer, e);
                continue;
            }

            Metrics::incr(&metrics.tcp_connections_total);
            log::debug!("TCP connection from {}", peer);
            self.connections.insert(
                token,
                Connection {
                    stream,
                    peer,
                    decoder: StreamDecoder::new(),
                    outbox: Vec::new(),
                    last_activity: Instant::now(),
                },
            );
        }
    }

    fn service(&mut self, token: Token, metrics: &Metrics) {
        let open = match self.connections.get_mut(&token) {
            Some(conn) => conn.service(metrics),
            None => return,
        };

        if !open {
            if let Some(mut conn) = self.connections.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
                log::debug!("TCP connection from {} closed", conn.peer);
            }
        }
    }

    /// Drop connections that have been silent longer than the idle timeout
    fn close_idle(&mut self, now: Instant) {
        let timeout = self.idle_timeout;
        let idle: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| now.saturating_duration_since(conn.last_activity) >= timeout)
            .map(|(token, _)| *token)
            .collect();

        for token in idle {
            if let Some(mut conn) = self.connections.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
                log::debug!("TCP connection from {} idle for {:?}, closing", conn.peer, timeout);
            }
        }
    }
}

impl Connection {
    /// Read, answer and flush; returns false once the connection is done
    fn service(&mut self, metrics: &Metrics) -> bool {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let mut open = true;

        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    open = false;
                    break;
                }
                Ok(n) => {
                    self.last_activity = Instant::now();
                    self.decoder.push(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("TCP read from {} failed: {}", self.peer, e);
                    return false;
                }
            }
        }

        while let Some(result) = self.decoder.next_message() {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("Undecodable TCP data from {}: {}", self.peer, e);
                    Metrics::incr(&metrics.decode_errors_total);
                    continue;
                }
            };

            if msg.id.is_empty() {
                log::warn!("Dropping TCP '{}' from {} without id", msg.op, self.peer);
                Metrics::incr(&metrics.dropped_total);
                continue;
            }

            let reply = match build_observed_reply(&msg, self.peer) {
                Some(reply) => reply,
                None => {
                    log::warn!("Dropping unexpected TCP op '{}' from {}", msg.op, self.peer);
                    Metrics::incr(&metrics.dropped_total);
                    continue;
                }
            };

            match encode(&reply) {
                Ok(bytes) => {
                    self.outbox.extend_from_slice(&bytes);
                    Metrics::incr(&metrics.probes_answered_total);
                }
                Err(e) => log::warn!("Failed to encode TCP reply to {}: {}", self.peer, e),
            }
        }

        if !self.flush() {
            return false;
        }

        // Peer half-closed: keep the connection only until the replies are out
        open || !self.outbox.is_empty()
    }

    /// Write as much of the outbox as the socket takes; false on error
    fn flush(&mut self) -> bool {
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => return false,
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("TCP write to {} failed: {}", self.peer, e);
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdTcpStream;
    use std::thread;

    fn start(idle: Duration) -> (SocketAddr, Shutdown, thread::JoinHandle<io::Result<()>>) {
        let listener = TcpProbeListener::bind(&["127.0.0.1:0".parse().unwrap()])
            .unwrap()
            .with_idle_timeout(idle);
        let addr = listener.local_addrs()[0];
        let shutdown = Shutdown::new();
        let stop = shutdown.clone();
        let handle = thread::spawn(move || listener.run(Arc::new(Metrics::new()), stop));
        (addr, shutdown, handle)
    }

    #[test]
    fn test_silent_connection_closed_after_idle_timeout() {
        let (addr, shutdown, handle) = start(Duration::from_millis(200));

        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();

        let started = Instant::now();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0);
        assert!(started.elapsed() < Duration::from_secs(3));

        shutdown.trigger();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_active_connection_still_answered() {
        let (addr, shutdown, handle) = start(Duration::from_secs(5));

        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let ping = punch_proto::Message::new(punch_proto::Op::Ping1, "p1");
        stream.write_all(&encode(&ping).unwrap()).unwrap();

        let mut decoder = StreamDecoder::new();
        let mut buf = [0u8; 512];
        let reply = loop {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "closed before reply");
            decoder.push(&buf[..n]);
            if let Some(msg) = decoder.next_message() {
                break msg.unwrap();
            }
        };
        assert_eq!(reply.op, punch_proto::Op::Pong1);
        assert_eq!(reply.public, stream.local_addr().unwrap().to_string());

        shutdown.trigger();
        handle.join().unwrap().unwrap();
    }
}
