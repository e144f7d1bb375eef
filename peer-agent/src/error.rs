//! Agent error types
//!
//! A session ends in exactly one of these or in a [`SessionEnd`]. The
//! designed outcomes (non-cone NAT, exhausted budgets) are kept apart from
//! transport failures so callers can tell "cannot traverse" from "broken".
//!
//! [`SessionEnd`]: crate::session::SessionEnd

use std::io;
use std::net::SocketAddr;

use punch_proto::{ArgError, CodecError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The two servers saw different public endpoints for one local socket
    #[error("not a cone nat: server 1 saw {first}, server 2 saw {second}")]
    NotConeNat { first: String, second: String },

    /// The request budget ran out without an introduction
    #[error("no peer address received after {attempts} requests")]
    NoPeerAddress { attempts: u32 },

    /// The punch budget ran out without hearing from the peer
    #[error("punch failed: traversal failed after {attempts} probes")]
    TraversalFailed { attempts: u32 },

    #[error("failed to resolve {addr}: {reason}")]
    Resolve { addr: String, reason: String },

    /// A server did not answer a NAT probe in time
    #[error("timed out waiting for {stage}")]
    Timeout { stage: &'static str },

    /// A send to a rendezvous server failed
    #[error("failed to send to server {addr}: {source}")]
    ServerUnreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ArgError),
}
