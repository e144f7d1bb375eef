//! Peer agent binary
//!
//! ```text
//! peer-agent --s1 <host:port> --s2 <host:port> [--mode udp|tcp] [--debug] ...
//! ```
//!
//! `udp` (default) runs the full session; `tcp` only runs the cone NAT check
//! over TCP. See [`AgentConfig::from_args`] for the remaining flags.

use punch_proto::args::{has_flag, parse_arg};
use punch_proto::{ArgError, Shutdown};

use peer_agent::{probe_tcp, AgentConfig, AgentError, PeerAgent};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    // --debug raises the default filter; RUST_LOG still wins
    let default_filter = if has_flag(&args, "--debug") { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .init();

    let config = AgentConfig::from_args(&args)?;
    let mode = parse_arg(&args, "--mode").unwrap_or_else(|| "udp".to_string());

    log::info!("Peer agent starting...");
    log::info!("  Mode:      {}", mode);
    log::info!("  Server 1:  {}", config.server1);
    log::info!("  Server 2:  {}", config.server2);
    log::info!("  Probes:    {} x {:?} ({})", config.punch_attempts, config.punch_interval, config.probe_op);

    match mode.as_str() {
        "udp" => run_udp(config),
        "tcp" => run_tcp(&config),
        other => Err(ArgError {
            flag: "--mode".to_string(),
            value: other.to_string(),
            reason: "expected udp or tcp".to_string(),
        }
        .into()),
    }
}

fn run_udp(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = Shutdown::new();
    shutdown.register_signals()?;

    let mut agent = PeerAgent::bind(config)?;
    log::info!("  Peer id:   {}", agent.peer_id());
    log::info!("  Local:     {}", agent.local_addr());

    match agent.run(&shutdown) {
        Ok(end) => {
            log::info!("Session ended: {:?}", end);
            Ok(())
        }
        Err(e) => {
            log::error!("Session failed: {}", e);
            Err(e.into())
        }
    }
}

fn run_tcp(config: &AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let report = probe_tcp(config)?;
    if report.is_cone() {
        log::info!("Cone NAT over TCP, public endpoint {}", report.public1);
        Ok(())
    } else {
        Err(AgentError::NotConeNat {
            first: report.public1,
            second: report.public2,
        }
        .into())
    }
}
