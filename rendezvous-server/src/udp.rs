//! Per-interface UDP listener
//!
//! One listener thread per bound address. The thread reads and decodes
//! datagrams and hands each one to the worker pool; replies go out on the
//! socket the request arrived on, so the peer sees the address it dialled.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};

use punch_proto::message::RECV_BUFFER_SIZE;
use punch_proto::{decode, encode, Shutdown};

use crate::dispatch::{Dispatch, Dispatcher};
use crate::handler::{Handler, Outbound};
use crate::metrics::Metrics;

const SOCKET_TOKEN: Token = Token(0);

/// Upper bound on how long shutdown can go unnoticed
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub struct UdpListener {
    poll: Poll,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpListener {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let std_socket = punch_proto::net::bind_udp(addr, false)?;
        let mut socket = UdpSocket::from_std(std_socket);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        let local_addr = socket.local_addr()?;
        log::info!("UDP listening on {}", local_addr);

        Ok(UdpListener {
            poll,
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Read until shutdown
    ///
    /// Per-datagram problems (decode errors, failed sends, a full queue) are
    /// logged and never end the loop.
    pub fn run(
        mut self,
        handler: Arc<Handler>,
        dispatcher: Dispatcher,
        metrics: Arc<Metrics>,
        shutdown: Shutdown,
    ) -> io::Result<()> {
        let mut events = Events::with_capacity(64);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        while !shutdown.is_triggered() {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    self.drain(&mut buf, &handler, &dispatcher, &metrics);
                }
            }
        }

        log::info!("UDP listener on {} stopped", self.local_addr);
        Ok(())
    }

    fn drain(
        &self,
        buf: &mut [u8],
        handler: &Arc<Handler>,
        dispatcher: &Dispatcher,
        metrics: &Arc<Metrics>,
    ) {
        loop {
            let (len, from) = match self.socket.recv_from(buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // Queued ICMP errors surface here once each; keep draining
                Err(e) => {
                    log::debug!("recv_from on {} failed: {}", self.local_addr, e);
                    continue;
                }
            };

            Metrics::incr(&metrics.datagrams_received_total);

            let msg = match decode(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("Undecodable datagram ({} bytes) from {}: {}", len, from, e);
                    Metrics::incr(&metrics.decode_errors_total);
                    continue;
                }
            };

            log::trace!("{} <- {}: {}", self.local_addr, from, msg);

            let socket = Arc::clone(&self.socket);
            let handler = Arc::clone(handler);
            let outcome = dispatcher.dispatch(Box::new(move || {
                for out in handler.handle(msg, from) {
                    send_outbound(&socket, &out);
                }
            }));

            match outcome {
                Dispatch::Queued => {}
                Dispatch::Dropped => {
                    log::warn!("Handler queue full, dropping datagram from {}", from);
                    Metrics::incr(&metrics.dropped_total);
                }
                Dispatch::Closed => {
                    log::debug!("Worker pool closed, dropping datagram from {}", from);
                    Metrics::incr(&metrics.dropped_total);
                }
            }
        }
    }
}

/// Encode and send one reply; failures only affect this datagram
pub fn send_outbound(socket: &UdpSocket, out: &Outbound) {
    let buf = match encode(&out.msg) {
        Ok(buf) => buf,
        Err(e) => {
            log::warn!("Failed to encode '{}' for {}: {}", out.msg.op, out.to, e);
            return;
        }
    };

    match socket.send_to(&buf, out.to) {
        Ok(_) => log::trace!("-> {}: {}", out.to, out.msg),
        Err(e) => log::warn!("Failed to send '{}' to {}: {}", out.msg.op, out.to, e),
    }
}
