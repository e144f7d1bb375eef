//! Agent configuration

use std::time::Duration;

use punch_proto::args::{has_flag, parse_arg, parse_duration_arg, parse_value};
use punch_proto::{ArgError, Op};

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_REQUEST_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_REQUEST_ATTEMPTS: u32 = 10;
pub const DEFAULT_PUNCH_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_PUNCH_JITTER: Duration = Duration::from_millis(100);
pub const DEFAULT_PUNCH_ATTEMPTS: u32 = 20;
pub const DEFAULT_HELLO_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// AgentConfig
// ============================================================================

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base identifier; the local port is appended to form the peer id
    pub base_id: String,
    /// First rendezvous server (`host:port`); also used for report/request
    pub server1: String,
    /// Second rendezvous server, used only for the NAT probe
    pub server2: String,
    /// Local port, 0 for ephemeral
    pub local_port: u16,
    /// Set SO_REUSEADDR/SO_REUSEPORT so UDP and TCP probes can share a port
    pub reuse_addr: bool,
    /// How long to wait for each `pong1`/`pong2`
    pub dial_timeout: Duration,
    pub report_interval: Duration,
    pub request_interval: Duration,
    pub request_attempts: u32,
    /// Base punch probe period; `punch_jitter` is added on top, randomly
    pub punch_interval: Duration,
    pub punch_jitter: Duration,
    /// Wait this long after the introduction before the first probe
    pub punch_delay: Duration,
    /// Probes sent before giving up (overridden by a non-zero `pingnum`)
    pub punch_attempts: u32,
    pub hello_interval: Duration,
    /// Send `byebye` and finish after this many hellos; `None` runs until cancelled
    pub hello_limit: Option<u32>,
    /// Opcode used for punch probes (`cping`, `pping` or `sping`)
    pub probe_op: Op,
    /// Also ask server 1 to relay each probe to the peer
    pub relay_fallback: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_id: String::new(),
            server1: String::new(),
            server2: String::new(),
            local_port: 0,
            reuse_addr: true,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            report_interval: DEFAULT_REPORT_INTERVAL,
            request_interval: DEFAULT_REQUEST_INTERVAL,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
            punch_interval: DEFAULT_PUNCH_INTERVAL,
            punch_jitter: DEFAULT_PUNCH_JITTER,
            punch_delay: Duration::ZERO,
            punch_attempts: DEFAULT_PUNCH_ATTEMPTS,
            hello_interval: DEFAULT_HELLO_INTERVAL,
            hello_limit: None,
            probe_op: Op::PeerPing,
            relay_fallback: false,
        }
    }
}

impl AgentConfig {
    /// Build from command-line arguments
    ///
    /// ```text
    /// --s1 <host:port>             Rendezvous server 1 (required)
    /// --s2 <host:port>             Rendezvous server 2 (required)
    /// --id <base>                  Base id (default: random)
    /// --local-port <n>             Local port (default: ephemeral)
    /// --no-reuse                   Do not set address/port reuse
    /// --dial-timeout <dur>         Wait for each pong (default 5s)
    /// --report-interval <dur>      Report heartbeat (default 20s)
    /// --request-interval <dur>     Match request period (default 2s)
    /// --request-num <n>            Match requests before giving up (default 10)
    /// --ping-peer-interval <dur>   Punch probe period (default 100ms)
    /// --ping-peer-jitter <dur>     Random extra delay per probe (default 100ms)
    /// --ping-peer-delay <dur>      Delay before the first probe (default 0)
    /// --ping-peer-num <n>          Punch probes before giving up (default 20)
    /// --probe-op <cping|pping|sping>
    /// --hello-interval <dur>       Steady-state hello period (default 10s)
    /// --hello-num <n>              Finish after this many hellos
    /// --relay                      Relay probes through server 1 as well
    /// ```
    pub fn from_args(args: &[String]) -> Result<Self, ArgError> {
        let mut config = Self::default();

        config.server1 = required(args, "--s1")?;
        config.server2 = required(args, "--s2")?;
        if let Some(id) = parse_arg(args, "--id") {
            config.base_id = id;
        }
        if let Some(port) = parse_value(args, "--local-port")? {
            config.local_port = port;
        }
        if has_flag(args, "--no-reuse") {
            config.reuse_addr = false;
        }
        if let Some(d) = parse_duration_arg(args, "--dial-timeout")? {
            config.dial_timeout = d;
        }
        if let Some(d) = parse_duration_arg(args, "--report-interval")? {
            config.report_interval = d;
        }
        if let Some(d) = parse_duration_arg(args, "--request-interval")? {
            config.request_interval = d;
        }
        if let Some(n) = parse_value(args, "--request-num")? {
            config.request_attempts = n;
        }
        if let Some(d) = parse_duration_arg(args, "--ping-peer-interval")? {
            config.punch_interval = d;
        }
        if let Some(d) = parse_duration_arg(args, "--ping-peer-jitter")? {
            config.punch_jitter = d;
        }
        if let Some(d) = parse_duration_arg(args, "--ping-peer-delay")? {
            config.punch_delay = d;
        }
        if let Some(n) = parse_value(args, "--ping-peer-num")? {
            config.punch_attempts = n;
        }
        if let Some(op) = parse_arg(args, "--probe-op") {
            config.probe_op = parse_probe_op(&op)?;
        }
        if let Some(d) = parse_duration_arg(args, "--hello-interval")? {
            config.hello_interval = d;
        }
        if let Some(n) = parse_value(args, "--hello-num")? {
            config.hello_limit = Some(n);
        }
        if has_flag(args, "--relay") {
            config.relay_fallback = true;
        }

        Ok(config)
    }
}

fn required(args: &[String], flag: &str) -> Result<String, ArgError> {
    parse_arg(args, flag).ok_or_else(|| ArgError {
        flag: flag.to_string(),
        value: String::new(),
        reason: "required".to_string(),
    })
}

fn parse_probe_op(value: &str) -> Result<Op, ArgError> {
    let op = Op::from(value.to_string());
    if op.is_punch_probe() {
        Ok(op)
    } else {
        Err(ArgError {
            flag: "--probe-op".to_string(),
            value: value.to_string(),
            reason: "expected cping, pping or sping".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::from_args(&args(&[
            "peer-agent", "udp", "--s1", "10.0.0.1:20018", "--s2", "10.0.0.2:20018",
        ]))
        .unwrap();

        assert_eq!(config.server1, "10.0.0.1:20018");
        assert_eq!(config.server2, "10.0.0.2:20018");
        assert!(config.base_id.is_empty());
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.punch_attempts, 20);
        assert_eq!(config.request_attempts, 10);
        assert_eq!(config.probe_op, Op::PeerPing);
        assert_eq!(config.hello_limit, None);
        assert!(config.reuse_addr);
        assert!(!config.relay_fallback);
    }

    #[test]
    fn test_overrides() {
        let config = AgentConfig::from_args(&args(&[
            "peer-agent",
            "--s1", "a:1",
            "--s2", "b:2",
            "--id", "me",
            "--local-port", "4000",
            "--ping-peer-interval", "50ms",
            "--ping-peer-num", "5",
            "--probe-op", "cping",
            "--hello-interval", "1s",
            "--hello-num", "3",
            "--relay",
            "--no-reuse",
        ]))
        .unwrap();

        assert_eq!(config.base_id, "me");
        assert_eq!(config.local_port, 4000);
        assert_eq!(config.punch_interval, Duration::from_millis(50));
        assert_eq!(config.punch_attempts, 5);
        assert_eq!(config.probe_op, Op::ClientPing);
        assert_eq!(config.hello_interval, Duration::from_secs(1));
        assert_eq!(config.hello_limit, Some(3));
        assert!(config.relay_fallback);
        assert!(!config.reuse_addr);
    }

    #[test]
    fn test_servers_required() {
        let err = AgentConfig::from_args(&args(&["peer-agent", "--s1", "a:1"])).unwrap_err();
        assert_eq!(err.flag, "--s2");
    }

    #[test]
    fn test_probe_op_must_be_probe() {
        let err = AgentConfig::from_args(&args(&[
            "peer-agent", "--s1", "a:1", "--s2", "b:2", "--probe-op", "hello",
        ]))
        .unwrap_err();
        assert_eq!(err.flag, "--probe-op");
    }
}
