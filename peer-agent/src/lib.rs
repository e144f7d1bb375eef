//! Peer agent for UDP hole punching
//!
//! The agent:
//! - Checks for a cone NAT by comparing the endpoints two servers observe
//! - Registers with server 1 and asks it for a partner
//! - Punches towards the introduced peer with a bounded number of probes
//! - Exchanges periodic hellos once the path is open
//!
//! [`session::Session`] holds the protocol logic without I/O;
//! [`driver::Driver`] runs it over a mio socket.

pub mod agent;
pub mod config;
pub mod driver;
pub mod error;
pub mod identity;
pub mod session;
pub mod tcp_probe;

pub use agent::PeerAgent;
pub use config::AgentConfig;
pub use error::AgentError;
pub use session::{PeerInfo, Session, SessionEnd, SessionState, SessionStats, Transmit};
pub use tcp_probe::{probe_tcp, TcpProbeReport};
