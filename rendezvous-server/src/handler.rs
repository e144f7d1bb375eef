//! Per-message protocol handling
//!
//! The handler is pure with respect to I/O: it takes one decoded message and
//! its source address, updates the registry, and returns the datagrams to
//! send. Listeners own the sockets and do the sending.

use std::net::SocketAddr;
use std::sync::Arc;

use punch_proto::{Message, Op};

use crate::discovery::build_observed_reply;
use crate::metrics::Metrics;
use crate::registry::{Phase, Registry};

/// A datagram the caller should send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: SocketAddr,
    pub msg: Message,
}

pub struct Handler {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    relay_enabled: bool,
}

impl Handler {
    pub fn new(registry: Arc<Registry>, metrics: Arc<Metrics>, relay_enabled: bool) -> Self {
        Handler {
            registry,
            metrics,
            relay_enabled,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one inbound message from `from`
    pub fn handle(&self, msg: Message, from: SocketAddr) -> Vec<Outbound> {
        if msg.id.is_empty() {
            log::warn!("Dropping '{}' from {} without id", msg.op, from);
            Metrics::incr(&self.metrics.dropped_total);
            return Vec::new();
        }

        let public = from.to_string();

        match msg.op {
            Op::Ping1 | Op::Ping2 => {
                let phase = if msg.op == Op::Ping1 {
                    Phase::Probe1
                } else {
                    Phase::Probe2
                };
                self.registry.set(&msg.id, &public, phase);

                match build_observed_reply(&msg, from) {
                    Some(reply) => {
                        Metrics::incr(&self.metrics.probes_answered_total);
                        vec![Outbound { to: from, msg: reply }]
                    }
                    None => Vec::new(),
                }
            }
            Op::Report => {
                Metrics::incr(&self.metrics.reports_total);
                self.registry.set(&msg.id, &public, Phase::Seeking);
                Vec::new()
            }
            // Matching only; records come from ping1/ping2/report
            Op::Request => {
                Metrics::incr(&self.metrics.requests_total);
                self.introduce(&msg, from)
            }
            Op::Relay => self.relay(&msg, from),
            ref other => {
                log::warn!("Dropping unexpected op '{}' from {} ({})", other, from, msg.id);
                Metrics::incr(&self.metrics.dropped_total);
                Vec::new()
            }
        }
    }

    /// Pair the requester with any other seeking peer
    ///
    /// The requester gets `pong3`, the matched peer gets `notify`; both carry
    /// the other side's id in `msg` and endpoint in `peer`. Both records are
    /// removed so neither is matched again.
    fn introduce(&self, request: &Message, from: SocketAddr) -> Vec<Outbound> {
        let (peer_id, peer_public) = match self.registry.select_one_match(&request.id, Phase::Seeking) {
            Some(found) => found,
            None => {
                log::debug!("No match yet for '{}'", request.id);
                return Vec::new();
            }
        };

        let peer_addr: SocketAddr = match peer_public.parse() {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("Bad endpoint '{}' stored for '{}': {}", peer_public, peer_id, e);
                self.registry.delete(&peer_id);
                return Vec::new();
            }
        };

        let public = from.to_string();
        log::info!(
            "Matched '{}' ({}) <-> '{}' ({})",
            request.id,
            public,
            peer_id,
            peer_public
        );

        let to_requester = Message::new(Op::Pong3, request.id.clone())
            .with_public(public.clone())
            .with_peer(peer_public.clone())
            .with_msg(peer_id.clone())
            .with_ping_num(request.ping_num);

        let to_matched = Message::new(Op::Notify, peer_id.clone())
            .with_public(peer_public)
            .with_peer(public)
            .with_msg(request.id.clone())
            .with_ping_num(request.ping_num);

        self.registry.delete(&request.id);
        self.registry.delete(&peer_id);
        Metrics::incr(&self.metrics.matches_total);

        vec![
            Outbound {
                to: from,
                msg: to_requester,
            },
            Outbound {
                to: peer_addr,
                msg: to_matched,
            },
        ]
    }

    /// Forward a message to the endpoint in `peer`, stamped with the sender's
    /// endpoint so the receiver can answer directly
    fn relay(&self, msg: &Message, from: SocketAddr) -> Vec<Outbound> {
        if !self.relay_enabled {
            log::debug!("Relay disabled, dropping relay from '{}'", msg.id);
            Metrics::incr(&self.metrics.dropped_total);
            return Vec::new();
        }

        let target: SocketAddr = match msg.peer.parse() {
            Ok(addr) => addr,
            Err(_) => {
                log::warn!("Relay from '{}' has bad peer '{}'", msg.id, msg.peer);
                Metrics::incr(&self.metrics.dropped_total);
                return Vec::new();
            }
        };

        Metrics::incr(&self.metrics.relays_total);
        log::debug!("Relaying '{}' {} -> {}", msg.id, from, target);

        let forwarded = Message::new(Op::Relay, msg.id.clone())
            .with_public(target.to_string())
            .with_peer(from.to_string())
            .with_msg(msg.msg.clone());

        vec![Outbound {
            to: target,
            msg: forwarded,
        }]
    }
}
