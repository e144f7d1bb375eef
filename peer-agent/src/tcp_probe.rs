//! Cone NAT check over TCP
//!
//! Dials both servers from one local port and sends `ping1`/`ping2` on the
//! respective streams. Address/port reuse lets the second dial share the
//! port the first one got. A cone NAT shows up as both servers reporting
//! the same public endpoint.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};

use punch_proto::net::connect_tcp_from;
use punch_proto::{encode, Message, Op, StreamDecoder};

use crate::agent::resolve_server;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::identity::{derive_peer_id, random_base_id};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpProbeReport {
    /// Local endpoint both streams were dialled from
    pub local: SocketAddr,
    /// Endpoint server 1 saw
    pub public1: String,
    /// Endpoint server 2 saw
    pub public2: String,
}

impl TcpProbeReport {
    pub fn is_cone(&self) -> bool {
        !self.public1.is_empty() && self.public1 == self.public2
    }
}

/// Run the TCP probe against the configured servers
pub fn probe_tcp(config: &AgentConfig) -> Result<TcpProbeReport, AgentError> {
    let server1 = resolve_server(&config.server1)?;
    let server2 = resolve_server(&config.server2)?;

    let first_local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.local_port));
    let mut stream1 = dial(first_local, server1, config)?;

    // Pin the second dial to the port the first one ended up with
    let local = stream1.local_addr()?;
    let second_local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, local.port()));
    let mut stream2 = dial(second_local, server2, config)?;

    let base = if config.base_id.is_empty() {
        random_base_id()?
    } else {
        config.base_id.clone()
    };
    let id = derive_peer_id(&base, local.port());
    log::info!("TCP probe '{}' from {}", id, local);

    let public1 = exchange(&mut stream1, Message::new(Op::Ping1, id.clone()), Op::Pong1, "pong1")?;
    log::info!("Server 1 ({}) sees us at {}", server1, public1);

    let public2 = exchange(&mut stream2, Message::new(Op::Ping2, id), Op::Pong2, "pong2")?;
    log::info!("Server 2 ({}) sees us at {}", server2, public2);

    Ok(TcpProbeReport {
        local,
        public1,
        public2,
    })
}

fn dial(local: SocketAddr, server: SocketAddr, config: &AgentConfig) -> Result<TcpStream, AgentError> {
    connect_tcp_from(local, server, config.dial_timeout, config.reuse_addr).map_err(|source| {
        AgentError::ServerUnreachable {
            addr: server,
            source,
        }
    })
}

/// Send `request` and return the `public` field of the first `expect` reply
fn exchange(
    stream: &mut TcpStream,
    request: Message,
    expect: Op,
    stage: &'static str,
) -> Result<String, AgentError> {
    stream.write_all(&encode(&request)?)?;

    let mut decoder = StreamDecoder::new();
    let mut buf = [0u8; 1024];
    loop {
        while let Some(result) = decoder.next_message() {
            match result {
                Ok(msg) if msg.op == expect => return Ok(msg.public),
                Ok(msg) => log::debug!("Ignoring '{}' while waiting for {}", msg.op, stage),
                Err(e) => log::warn!("Undecodable reply while waiting for {}: {}", stage, e),
            }
        }

        let n = match stream.read(&mut buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("server closed before {}", stage),
                )
                .into())
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(AgentError::Timeout { stage })
            }
            Err(e) => return Err(e.into()),
        };
        decoder.push(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_cone() {
        let report = TcpProbeReport {
            local: "10.0.0.2:5000".parse().unwrap(),
            public1: "203.0.113.5:40000".to_string(),
            public2: "203.0.113.5:40000".to_string(),
        };
        assert!(report.is_cone());

        let symmetric = TcpProbeReport {
            public2: "203.0.113.5:40001".to_string(),
            ..report.clone()
        };
        assert!(!symmetric.is_cone());

        let empty = TcpProbeReport {
            public1: String::new(),
            public2: String::new(),
            ..report
        };
        assert!(!empty.is_cone());
    }
}
