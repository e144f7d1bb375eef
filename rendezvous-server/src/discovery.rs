//! Observed-address discovery
//!
//! Answers `ping1`/`ping2` with the source address the probe arrived from,
//! which lets the agent compare what two servers see and classify its NAT.
//! Shared by the UDP handler and the TCP listener.

use std::net::SocketAddr;

use punch_proto::{Message, Op};

/// Build the `pong1`/`pong2` answer to a probe observed from `from`
///
/// Returns `None` for anything that is not a `ping1`/`ping2`.
///
/// ```text
/// -> {"id":"p1:4000","op":"ping1"}
/// <- {"id":"p1:4000","public":"203.0.113.5:4000","op":"pong1"}
/// ```
pub fn build_observed_reply(request: &Message, from: SocketAddr) -> Option<Message> {
    let op = match request.op {
        Op::Ping1 => Op::Pong1,
        Op::Ping2 => Op::Pong2,
        _ => return None,
    };

    if from.is_ipv6() {
        log::debug!("Observed IPv6 source {} for '{}'", from, request.id);
    }

    Some(Message::new(op, request.id.clone()).with_public(from.to_string()))
}
