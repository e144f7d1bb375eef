//! Agent session state machine
//!
//! The session is sans-IO: the driver feeds it decoded messages and clock
//! ticks, and drains the datagrams it wants sent. All timing comes in as an
//! explicit `Instant`, so every phase can be stepped deterministically.
//!
//! # State Machine
//!
//! ```text
//! Init → ConeCheckFirst → ConeCheckSecond → AwaitingMatch → Punching → SteadyState
//!             ↓                  ↓                ↓             ↓            ↓
//!          Timeout        NotConeNat/Timeout  NoPeerAddress  TraversalFailed  PeerClosed/Completed
//! ```
//!
//! The `report` heartbeat to server 1 runs from the end of the cone check
//! until the session finishes, alongside whichever phase is current.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use punch_proto::timer::earliest;
use punch_proto::{Budget, Jitter, Message, OneShot, Op, Ticker, BYEBYE, ECHO};

use crate::config::AgentConfig;
use crate::error::AgentError;

/// Most recent unknown probe senders remembered before a match
pub const MAX_EARLY_PROBES: usize = 16;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started
    Init,
    /// `ping1` sent to server 1, waiting for `pong1`
    ConeCheckFirst,
    /// `ping2` sent to server 2, waiting for `pong2`
    ConeCheckSecond,
    /// Cone NAT confirmed; requesting a match from server 1
    AwaitingMatch,
    /// Probing the introduced peer
    Punching,
    /// Path confirmed; exchanging hellos
    SteadyState,
    /// Outcome decided
    Finished,
}

/// How a session that did not fail came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer sent `byebye`
    PeerClosed,
    /// The configured number of hellos was sent, followed by `byebye`
    Completed,
    /// Cancelled locally
    Cancelled,
}

/// A datagram the driver should send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub to: SocketAddr,
    pub msg: Message,
}

/// The peer introduced by the rendezvous server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Peer id (`msg` of the `pong3`/`notify`)
    pub id: String,
    /// Public endpoint the server saw the peer at
    pub addr: SocketAddr,
}

/// Counters for what the session sent and saw
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub reports_sent: u32,
    pub requests_sent: u32,
    pub punch_probes_sent: u32,
    pub relays_sent: u32,
    pub hellos_sent: u32,
    pub echoes_sent: u32,
    pub probes_received: u32,
    pub hellos_received: u32,
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    config: AgentConfig,
    peer_id: String,
    server1: SocketAddr,
    server2: SocketAddr,
    state: SessionState,

    /// Public endpoints reported by server 1 and server 2
    public1: Option<String>,
    public2: Option<String>,
    /// Deadline for the pong currently awaited
    cone_deadline: Option<Instant>,

    /// Set once by the first usable introduction
    peer: OneShot<PeerInfo>,
    /// Set once by the first probe/hello from the peer
    punched: OneShot<Instant>,
    /// Where the peer's traffic actually came from
    peer_path: Option<SocketAddr>,
    /// Ids that probed us before we knew our peer, oldest first
    early_probes: VecDeque<String>,

    report_ticker: Option<Ticker>,
    request_ticker: Option<Ticker>,
    request_budget: Budget,
    punch_ticker: Option<Ticker>,
    punch_budget: Budget,
    /// The punch ticker is still running the initial delay
    punch_delayed: bool,
    hello_ticker: Option<Ticker>,
    hellos_sent: u32,

    transmits: VecDeque<Transmit>,
    outcome: Option<Result<SessionEnd, AgentError>>,
    stats: SessionStats,
}

impl Session {
    pub fn new(config: AgentConfig, peer_id: String, server1: SocketAddr, server2: SocketAddr) -> Self {
        let request_budget = Budget::new(config.request_attempts);
        let punch_budget = Budget::new(config.punch_attempts);
        Self {
            config,
            peer_id,
            server1,
            server2,
            state: SessionState::Init,
            public1: None,
            public2: None,
            cone_deadline: None,
            peer: OneShot::new(),
            punched: OneShot::new(),
            peer_path: None,
            early_probes: VecDeque::new(),
            report_ticker: None,
            request_ticker: None,
            request_budget,
            punch_ticker: None,
            punch_budget,
            punch_delayed: false,
            hello_ticker: None,
            hellos_sent: 0,
            transmits: VecDeque::new(),
            outcome: None,
            stats: SessionStats::default(),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.get()
    }

    pub fn is_punched(&self) -> bool {
        self.punched.is_fired()
    }

    /// Public endpoint confirmed by both servers
    pub fn public_endpoint(&self) -> Option<&str> {
        match (&self.public1, &self.public2) {
            (Some(a), Some(b)) if a == b => Some(a),
            _ => None,
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn is_server(&self, addr: SocketAddr) -> bool {
        addr == self.server1 || addr == self.server2
    }

    pub fn is_finished(&self) -> bool {
        self.state == SessionState::Finished
    }

    /// The outcome, once; `None` while running
    pub fn take_outcome(&mut self) -> Option<Result<SessionEnd, AgentError>> {
        self.outcome.take()
    }

    /// Next datagram to send
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// When [`Session::on_timeout`] next needs to run
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.is_finished() {
            return None;
        }
        earliest([
            self.cone_deadline,
            self.report_ticker.as_ref().map(Ticker::deadline),
            self.request_ticker.as_ref().map(Ticker::deadline),
            self.punch_ticker.as_ref().map(Ticker::deadline),
            self.hello_ticker.as_ref().map(Ticker::deadline),
        ])
    }

    // ------------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------------

    /// Begin the cone check
    pub fn start(&mut self, now: Instant) {
        if self.state != SessionState::Init {
            return;
        }
        log::info!("Session '{}': probing {} and {}", self.peer_id, self.server1, self.server2);

        let ping1 = self.message(Op::Ping1);
        self.send(self.server1, ping1);
        self.state = SessionState::ConeCheckFirst;
        self.cone_deadline = Some(now + self.config.dial_timeout);
    }

    /// Handle one decoded message from `from`
    pub fn handle(&mut self, from: SocketAddr, msg: Message, now: Instant) {
        if self.is_finished() {
            log::trace!("Session finished, ignoring '{}' from {}", msg.op, from);
            return;
        }

        match msg.op {
            Op::Pong1 => self.on_pong1(from, msg, now),
            Op::Pong2 => self.on_pong2(from, msg, now),
            Op::Pong3 | Op::Notify => self.on_introduction(from, msg, now),
            Op::Relay => self.on_relay(from, msg),
            Op::Hello => self.on_hello(from, msg, now),
            _ if msg.op.is_punch_probe() => self.on_probe(from, msg, now),
            _ => log::warn!("Ignoring unexpected '{}' from {}", msg.op, from),
        }
    }

    /// Fire whatever timers are due at `now`
    pub fn on_timeout(&mut self, now: Instant) {
        if self.is_finished() {
            return;
        }

        if let Some(deadline) = self.cone_deadline {
            if now >= deadline {
                let stage = if self.state == SessionState::ConeCheckFirst {
                    "pong1"
                } else {
                    "pong2"
                };
                log::warn!("No {} within {:?}", stage, self.config.dial_timeout);
                self.finish(Err(AgentError::Timeout { stage }));
                return;
            }
        }

        if poll_ticker(&mut self.report_ticker, now) {
            self.send_report();
        }

        match self.state {
            SessionState::AwaitingMatch => {
                if poll_ticker(&mut self.request_ticker, now) && !self.send_request() {
                    let attempts = self.request_budget.used();
                    log::warn!("No peer address received after {} requests", attempts);
                    self.finish(Err(AgentError::NoPeerAddress { attempts }));
                }
            }
            SessionState::Punching => {
                if poll_ticker(&mut self.punch_ticker, now) {
                    if self.punch_delayed {
                        self.punch_delayed = false;
                        let jitter = Jitter::new(self.config.punch_jitter);
                        if let Some(ticker) = self.punch_ticker.as_mut() {
                            ticker.reset(self.config.punch_interval, jitter, now);
                        }
                    }
                    if !self.send_probe() {
                        self.fail_punch();
                    }
                }
            }
            SessionState::SteadyState => {
                if poll_ticker(&mut self.hello_ticker, now) {
                    self.send_hello();
                }
            }
            _ => {}
        }
    }

    /// Cancel: say `byebye` to the peer if there is one, then finish
    pub fn close(&mut self) {
        if self.is_finished() {
            return;
        }
        if let Some(target) = self.peer_target() {
            log::info!("Closing session, sending {} to {}", BYEBYE, target);
            let bye = self.message(Op::Hello).with_msg(BYEBYE);
            self.send(target, bye);
        }
        self.finish(Ok(SessionEnd::Cancelled));
    }

    // ------------------------------------------------------------------------
    // Cone check
    // ------------------------------------------------------------------------

    fn on_pong1(&mut self, from: SocketAddr, msg: Message, now: Instant) {
        if self.state != SessionState::ConeCheckFirst || from != self.server1 {
            log::debug!("Discarding pong1 from {} in {:?}", from, self.state);
            return;
        }

        log::info!("Server 1 ({}) sees us at {}", from, msg.public);
        self.public1 = Some(msg.public);

        let ping2 = self.message(Op::Ping2);
        self.send(self.server2, ping2);
        self.state = SessionState::ConeCheckSecond;
        self.cone_deadline = Some(now + self.config.dial_timeout);
    }

    fn on_pong2(&mut self, from: SocketAddr, msg: Message, now: Instant) {
        if self.state != SessionState::ConeCheckSecond || from != self.server2 {
            log::debug!("Discarding pong2 from {} in {:?}", from, self.state);
            return;
        }

        log::info!("Server 2 ({}) sees us at {}", from, msg.public);
        self.cone_deadline = None;
        let first = self.public1.clone().unwrap_or_default();
        let second = msg.public;
        self.public2 = Some(second.clone());

        if first != second {
            log::warn!("Not a cone NAT ({} vs {}), giving up", first, second);
            self.finish(Err(AgentError::NotConeNat { first, second }));
            return;
        }

        log::info!("Cone NAT, public endpoint {}", first);
        self.state = SessionState::AwaitingMatch;

        self.send_report();
        self.report_ticker = Some(Ticker::new(self.config.report_interval, now));

        self.request_ticker = Some(Ticker::new(self.config.request_interval, now));
        if !self.send_request() {
            self.finish(Err(AgentError::NoPeerAddress { attempts: 0 }));
        }
    }

    fn send_report(&mut self) {
        let report = self.message(Op::Report);
        self.stats.reports_sent += 1;
        log::debug!("report -> {}", self.server1);
        self.send(self.server1, report);
    }

    /// Returns false once the request budget is spent
    fn send_request(&mut self) -> bool {
        if !self.request_budget.try_consume() {
            return false;
        }
        let request = self
            .message(Op::Request)
            .with_ping_num(self.punch_budget.limit());
        self.stats.requests_sent += 1;
        log::info!(
            "request {}/{} -> {}",
            self.request_budget.used(),
            self.request_budget.limit(),
            self.server1
        );
        self.send(self.server1, request);
        true
    }

    // ------------------------------------------------------------------------
    // Introduction and punching
    // ------------------------------------------------------------------------

    fn on_introduction(&mut self, from: SocketAddr, msg: Message, now: Instant) {
        if !self.is_server(from) {
            log::warn!("Ignoring '{}' from non-server {}", msg.op, from);
            return;
        }
        if self.state != SessionState::AwaitingMatch || self.peer.is_fired() {
            log::debug!("Discarding '{}' in {:?}", msg.op, self.state);
            return;
        }
        if msg.peer.is_empty() {
            log::debug!("Discarding '{}' without peer endpoint", msg.op);
            return;
        }

        let addr: SocketAddr = match msg.peer.parse() {
            Ok(addr) => addr,
            Err(e) => {
                self.finish(Err(AgentError::Resolve {
                    addr: msg.peer,
                    reason: e.to_string(),
                }));
                return;
            }
        };

        if msg.ping_num != 0 {
            self.punch_budget = Budget::new(msg.ping_num);
        }

        log::info!(
            "Got peer '{}' at {} ({} from {}), punching up to {} times",
            msg.msg,
            addr,
            msg.op,
            from,
            self.punch_budget.limit()
        );
        self.peer.fire(PeerInfo { id: msg.msg, addr });
        self.request_ticker = None;
        self.begin_punching(now);
    }

    fn begin_punching(&mut self, now: Instant) {
        self.state = SessionState::Punching;

        if self.config.punch_delay.is_zero() {
            let jitter = Jitter::new(self.config.punch_jitter);
            self.punch_ticker = Some(Ticker::with_jitter(self.config.punch_interval, jitter, now));
            if !self.send_probe() {
                self.fail_punch();
                return;
            }
        } else {
            log::info!("Delaying first probe by {:?}", self.config.punch_delay);
            self.punch_ticker = Some(Ticker::new(self.config.punch_delay, now));
            self.punch_delayed = true;
        }

        let early = match self.peer.get() {
            Some(peer) => self.early_probes.iter().any(|id| *id == peer.id).then_some(peer.addr),
            None => None,
        };
        if let Some(addr) = early {
            log::debug!("Peer probed us before the introduction");
            self.mark_punched(addr, now);
        }
    }

    /// Returns false once the punch budget is spent
    fn send_probe(&mut self) -> bool {
        let peer_addr = match self.peer.get() {
            Some(peer) => peer.addr,
            None => return false,
        };
        if !self.punch_budget.try_consume() {
            return false;
        }

        let attempt = self.punch_budget.used();
        let probe = self
            .message(self.config.probe_op.clone())
            .with_peer(peer_addr.to_string())
            .with_msg(format!("{} nat", self.config.probe_op))
            .with_ping_num(attempt);
        self.stats.punch_probes_sent += 1;
        log::debug!(
            "{} {}/{} -> {}",
            self.config.probe_op,
            attempt,
            self.punch_budget.limit(),
            peer_addr
        );
        self.send(peer_addr, probe);

        if self.config.relay_fallback {
            let relay = self
                .message(Op::Relay)
                .with_peer(peer_addr.to_string())
                .with_msg(format!("relay {}", attempt));
            self.stats.relays_sent += 1;
            self.send(self.server1, relay);
        }
        true
    }

    fn fail_punch(&mut self) {
        let attempts = self.punch_budget.used();
        log::warn!("Traversal failed after {} probes", attempts);
        self.finish(Err(AgentError::TraversalFailed { attempts }));
    }

    fn on_probe(&mut self, from: SocketAddr, msg: Message, now: Instant) {
        if matches!(
            self.state,
            SessionState::Init | SessionState::ConeCheckFirst | SessionState::ConeCheckSecond
        ) {
            log::debug!("Discarding '{}' from {} before the cone check", msg.op, from);
            return;
        }

        self.stats.probes_received += 1;

        if self.is_peer(&msg.id, from) && msg.is_byebye() {
            log::info!("Peer '{}' said {}", msg.id, BYEBYE);
            self.finish(Ok(SessionEnd::PeerClosed));
            return;
        }

        if !msg.is_echo() {
            let echo = self
                .message(msg.op.clone())
                .with_peer(from.to_string())
                .with_msg(ECHO);
            self.stats.echoes_sent += 1;
            self.send(from, echo);
        }

        if self.peer.get().is_none() {
            if !self.early_probes.contains(&msg.id) {
                log::debug!("Early '{}' from '{}' at {}", msg.op, msg.id, from);
                if self.early_probes.len() >= MAX_EARLY_PROBES {
                    self.early_probes.pop_front();
                }
                self.early_probes.push_back(msg.id);
            }
        } else if self.is_peer(&msg.id, from) {
            self.mark_punched(from, now);
        } else {
            log::debug!("Ignoring '{}' from unexpected '{}' at {}", msg.op, msg.id, from);
        }
    }

    /// The peer reached us: switch from probing to hellos
    fn mark_punched(&mut self, from: SocketAddr, now: Instant) {
        if self.state != SessionState::Punching || !self.punched.fire(now) {
            return;
        }

        if let Some(peer) = self.peer.get() {
            if peer.addr != from {
                log::info!("Peer '{}' introduced as {} but reached us from {}", peer.id, peer.addr, from);
            }
            log::info!(
                "PUNCH success with '{}' at {} after {} probe(s)",
                peer.id,
                from,
                self.punch_budget.used()
            );
        }

        self.peer_path = Some(from);
        self.punch_ticker = None;
        self.state = SessionState::SteadyState;
        self.hello_ticker = Some(Ticker::new(self.config.hello_interval, now));
        self.send_hello();
    }

    // ------------------------------------------------------------------------
    // Steady state
    // ------------------------------------------------------------------------

    fn on_hello(&mut self, from: SocketAddr, msg: Message, now: Instant) {
        if !self.is_peer(&msg.id, from) {
            log::debug!("Ignoring hello from '{}' at {}", msg.id, from);
            return;
        }

        self.stats.hellos_received += 1;

        if msg.is_byebye() {
            log::info!("Peer '{}' said {}", msg.id, BYEBYE);
            self.finish(Ok(SessionEnd::PeerClosed));
            return;
        }

        // A hello proves the path as well as a probe does
        self.mark_punched(from, now);
        if self.is_finished() {
            return;
        }

        if msg.is_echo() {
            log::debug!("Hello acknowledged by '{}'", msg.id);
        } else {
            log::info!("Hello from '{}': {}", msg.id, msg.msg);
            let echo = self.message(Op::Hello).with_msg(ECHO);
            self.stats.echoes_sent += 1;
            self.send(from, echo);
        }
    }

    fn send_hello(&mut self) {
        let target = match self.peer_target() {
            Some(target) => target,
            None => return,
        };

        let text = format!("{}:HELLO@{}", self.peer_id, unix_time());
        let hello = self.message(Op::Hello).with_msg(text);
        self.hellos_sent += 1;
        self.stats.hellos_sent += 1;
        self.send(target, hello);

        if let Some(limit) = self.config.hello_limit {
            if self.hellos_sent >= limit {
                log::info!("Sent {} hello(s), closing", self.hellos_sent);
                let bye = self.message(Op::Hello).with_msg(BYEBYE);
                self.send(target, bye);
                self.finish(Ok(SessionEnd::Completed));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Relay
    // ------------------------------------------------------------------------

    /// A peer's relayed probe: answer it directly at the endpoint it came from
    fn on_relay(&mut self, from: SocketAddr, msg: Message) {
        if !self.is_server(from) {
            log::warn!("Ignoring relay from non-server {}", from);
            return;
        }
        if matches!(
            self.state,
            SessionState::Init | SessionState::ConeCheckFirst | SessionState::ConeCheckSecond
        ) {
            log::debug!("Discarding relay before the cone check");
            return;
        }

        let target: SocketAddr = match msg.peer.parse() {
            Ok(addr) => addr,
            Err(_) => {
                log::warn!("Relay from '{}' carries bad endpoint '{}'", msg.id, msg.peer);
                return;
            }
        };

        log::debug!("Relay from '{}' via {}, probing {}", msg.id, from, target);
        let probe = self
            .message(self.config.probe_op.clone())
            .with_peer(target.to_string())
            .with_msg(format!("{} relay", self.config.probe_op));
        self.send(target, probe);
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn message(&self, op: Op) -> Message {
        Message::new(op, self.peer_id.clone())
    }

    fn send(&mut self, to: SocketAddr, msg: Message) {
        self.transmits.push_back(Transmit { to, msg });
    }

    /// Whether a message with `id` from `from` is our peer's
    ///
    /// Peers are matched by id; an introduction without an id falls back to
    /// the endpoint.
    fn is_peer(&self, id: &str, from: SocketAddr) -> bool {
        match self.peer.get() {
            Some(peer) if peer.id.is_empty() => peer.addr == from,
            Some(peer) => peer.id == id,
            None => false,
        }
    }

    /// Where peer traffic goes: the observed path once punched, else the
    /// introduced endpoint
    fn peer_target(&self) -> Option<SocketAddr> {
        self.peer_path.or_else(|| self.peer.get().map(|p| p.addr))
    }

    fn finish(&mut self, result: Result<SessionEnd, AgentError>) {
        if self.outcome.is_none() && self.state != SessionState::Finished {
            self.outcome = Some(result);
        }
        self.state = SessionState::Finished;
        self.cone_deadline = None;
        self.report_ticker = None;
        self.request_ticker = None;
        self.punch_ticker = None;
        self.hello_ticker = None;
    }
}

fn poll_ticker(ticker: &mut Option<Ticker>, now: Instant) -> bool {
    ticker.as_mut().map_or(false, |t| t.poll(now))
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Tests
// ============================================================================
