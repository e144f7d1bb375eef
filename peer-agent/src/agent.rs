//! Peer agent
//!
//! Owns the UDP socket and the peer id derived from it, and runs one
//! [`Session`] over them.

use std::net::{Ipv4Addr, SocketAddr};

use punch_proto::net::{bind_udp, resolve_ipv4};
use punch_proto::Shutdown;

use crate::config::AgentConfig;
use crate::driver::Driver;
use crate::error::AgentError;
use crate::identity::{derive_peer_id, random_base_id};
use crate::session::{Session, SessionEnd, SessionStats};

pub struct PeerAgent {
    config: AgentConfig,
    peer_id: String,
    server1: SocketAddr,
    server2: SocketAddr,
    driver: Driver,
    last_stats: Option<SessionStats>,
}

impl PeerAgent {
    /// Resolve both servers, bind the local socket and derive the peer id
    ///
    /// An empty `base_id` is replaced with a random one.
    pub fn bind(config: AgentConfig) -> Result<Self, AgentError> {
        let server1 = resolve_server(&config.server1)?;
        let server2 = resolve_server(&config.server2)?;

        let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.local_port));
        let socket = bind_udp(local, config.reuse_addr)?;
        let driver = Driver::new(socket)?;
        let local_addr = driver.local_addr();

        let base = if config.base_id.is_empty() {
            random_base_id()?
        } else {
            config.base_id.clone()
        };
        let peer_id = derive_peer_id(&base, local_addr.port());

        log::info!("Agent '{}' bound to {}", peer_id, local_addr);

        Ok(PeerAgent {
            config,
            peer_id,
            server1,
            server2,
            driver,
            last_stats: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.driver.local_addr()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn servers(&self) -> (SocketAddr, SocketAddr) {
        (self.server1, self.server2)
    }

    /// Counters from the most recent [`PeerAgent::run`]
    pub fn last_stats(&self) -> Option<SessionStats> {
        self.last_stats
    }

    /// Cone check, rendezvous and punching, until the session ends
    pub fn run(&mut self, shutdown: &Shutdown) -> Result<SessionEnd, AgentError> {
        let mut session = Session::new(
            self.config.clone(),
            self.peer_id.clone(),
            self.server1,
            self.server2,
        );
        let result = self.driver.drive(&mut session, shutdown);

        let stats = session.stats();
        log::info!(
            "Session '{}' done: {} request(s), {} probe(s) sent, {} received, {} hello(s) sent",
            self.peer_id,
            stats.requests_sent,
            stats.punch_probes_sent,
            stats.probes_received,
            stats.hellos_sent
        );
        self.last_stats = Some(stats);
        result
    }
}

/// Resolve a `host:port` server address to IPv4
pub(crate) fn resolve_server(addr: &str) -> Result<SocketAddr, AgentError> {
    resolve_ipv4(addr).map_err(|e| AgentError::Resolve {
        addr: addr.to_string(),
        reason: e.to_string(),
    })
}
