//! Socket driver for a [`Session`]
//!
//! One mio poll over the agent's UDP socket. Each turn flushes whatever the
//! session queued, sleeps until the session's next deadline (never longer
//! than [`MAX_POLL`]), feeds received datagrams in and fires due timers.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};

use punch_proto::message::RECV_BUFFER_SIZE;
use punch_proto::{decode, encode, Shutdown};

use crate::error::AgentError;
use crate::session::{Session, SessionEnd};

const SOCKET_TOKEN: Token = Token(0);

/// Upper bound on one poll, so shutdown is noticed promptly
const MAX_POLL: Duration = Duration::from_millis(100);

pub struct Driver {
    poll: Poll,
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl Driver {
    /// Take over a non-blocking std socket
    pub fn new(socket: std::net::UdpSocket) -> io::Result<Self> {
        let mut socket = UdpSocket::from_std(socket);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        let local_addr = socket.local_addr()?;

        Ok(Driver {
            poll,
            socket,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run `session` to completion
    ///
    /// A triggered `shutdown` closes the session (sending `byebye` to a known
    /// peer) and returns [`SessionEnd::Cancelled`].
    pub fn drive(&mut self, session: &mut Session, shutdown: &Shutdown) -> Result<SessionEnd, AgentError> {
        let mut events = Events::with_capacity(64);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        session.start(Instant::now());

        loop {
            self.flush(session)?;

            if let Some(outcome) = session.take_outcome() {
                return outcome;
            }

            if shutdown.is_triggered() {
                log::info!("Shutdown requested");
                session.close();
                continue;
            }

            let now = Instant::now();
            let timeout = session
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(now))
                .unwrap_or(MAX_POLL)
                .min(MAX_POLL);

            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    self.drain(session, &mut buf);
                }
            }

            session.on_timeout(Instant::now());
        }
    }

    fn drain(&self, session: &mut Session, buf: &mut [u8]) {
        loop {
            let (len, from) = match self.socket.recv_from(buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("recv_from on {} failed: {}", self.local_addr, e);
                    continue;
                }
            };

            match decode(&buf[..len]) {
                Ok(msg) => {
                    log::trace!("<- {}: {}", from, msg);
                    session.handle(from, msg, Instant::now());
                }
                Err(e) => log::warn!("Undecodable datagram ({} bytes) from {}: {}", len, from, e),
            }
        }
    }

    /// Send everything the session queued
    ///
    /// A failed send to a rendezvous server is fatal; a failed send to the
    /// peer only loses that datagram, like any other lost UDP packet.
    fn flush(&self, session: &mut Session) -> Result<(), AgentError> {
        while let Some(transmit) = session.poll_transmit() {
            let bytes = match encode(&transmit.msg) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("Failed to encode '{}': {}", transmit.msg.op, e);
                    continue;
                }
            };

            match self.socket.send_to(&bytes, transmit.to) {
                Ok(_) => log::trace!("-> {}: {}", transmit.to, transmit.msg),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    log::warn!("Send buffer full, dropping '{}' to {}", transmit.msg.op, transmit.to);
                }
                Err(e) if session.is_server(transmit.to) => {
                    return Err(AgentError::ServerUnreachable {
                        addr: transmit.to,
                        source: e,
                    });
                }
                Err(e) => log::warn!("Failed to send '{}' to {}: {}", transmit.msg.op, transmit.to, e),
            }
        }
        Ok(())
    }
}
