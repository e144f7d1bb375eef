//! Server configuration

use std::net::IpAddr;
use std::time::Duration;

use punch_proto::args::{has_flag, parse_arg, parse_duration_arg, parse_value};
use punch_proto::ArgError;

// ============================================================================
// Defaults
// ============================================================================

/// Default UDP/TCP port
pub const DEFAULT_PORT: u16 = 20018;

/// Base lifetime of a registry record
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(10);

/// Agent report interval, added on top of the base TTL
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(20);

/// How often expired records are swept
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

pub const DEFAULT_WORKERS: usize = 4;

pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port for every listener (0 picks one ephemeral port, shared by UDP and TCP)
    pub port: u16,
    /// Addresses to listen on; empty means every local IPv4 interface
    pub listen: Vec<IpAddr>,
    pub record_ttl: Duration,
    pub report_interval: Duration,
    pub sweep_interval: Duration,
    /// Handler threads; 0 handles datagrams inline on the listener thread
    pub workers: usize,
    /// Pending datagrams per pool before new ones are dropped
    pub queue_depth: usize,
    /// Answer `ping1`/`ping2` over TCP as well
    pub tcp: bool,
    /// Forward `relay` messages between peers
    pub relay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            listen: Vec::new(),
            record_ttl: DEFAULT_RECORD_TTL,
            report_interval: DEFAULT_REPORT_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            workers: DEFAULT_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            tcp: true,
            relay: true,
        }
    }
}

impl ServerConfig {
    /// Build from command-line arguments
    ///
    /// ```text
    /// --port <n>               Listener port (default 20018)
    /// --listen <ip,ip,...>     Listen addresses (default: all IPv4 interfaces)
    /// --ttl <dur>              Base record lifetime (default 10s)
    /// --report-interval <dur>  Agent report interval added to the TTL (default 20s)
    /// --sweep-interval <dur>   Expiry sweep period (default 2s)
    /// --workers <n>            Handler threads (default 4)
    /// --queue <n>              Handler queue depth (default 1024)
    /// --no-tcp                 Disable the TCP probe listener
    /// --no-relay               Drop relay messages
    /// ```
    pub fn from_args(args: &[String]) -> Result<Self, ArgError> {
        let mut config = Self::default();

        if let Some(port) = parse_value(args, "--port")? {
            config.port = port;
        }
        if let Some(list) = parse_arg(args, "--listen") {
            config.listen = parse_ip_list(&list).map_err(|reason| ArgError {
                flag: "--listen".to_string(),
                value: list.clone(),
                reason,
            })?;
        }
        if let Some(ttl) = parse_duration_arg(args, "--ttl")? {
            config.record_ttl = ttl;
        }
        if let Some(interval) = parse_duration_arg(args, "--report-interval")? {
            config.report_interval = interval;
        }
        if let Some(interval) = parse_duration_arg(args, "--sweep-interval")? {
            config.sweep_interval = interval;
        }
        if let Some(workers) = parse_value(args, "--workers")? {
            config.workers = workers;
        }
        if let Some(depth) = parse_value(args, "--queue")? {
            config.queue_depth = depth;
        }
        if has_flag(args, "--no-tcp") {
            config.tcp = false;
        }
        if has_flag(args, "--no-relay") {
            config.relay = false;
        }

        Ok(config)
    }

    /// Lifetime given to a record on every write
    pub fn entry_ttl(&self) -> Duration {
        self.record_ttl + self.report_interval
    }
}

fn parse_ip_list(list: &str) -> Result<Vec<IpAddr>, String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<IpAddr>().map_err(|e| format!("{}: {}", s, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_args(&args(&["rendezvous-server"])).unwrap();
        assert_eq!(config.port, 20018);
        assert!(config.listen.is_empty());
        assert_eq!(config.entry_ttl(), Duration::from_secs(30));
        assert_eq!(config.sweep_interval, Duration::from_secs(2));
        assert!(config.tcp);
        assert!(config.relay);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_args(&args(&[
            "rendezvous-server",
            "--port",
            "3000",
            "--listen",
            "127.0.0.1, 10.0.0.1",
            "--ttl",
            "15s",
            "--report-interval",
            "500ms",
            "--workers",
            "0",
            "--no-tcp",
            "--no-relay",
        ]))
        .unwrap();

        assert_eq!(config.port, 3000);
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.entry_ttl(), Duration::from_millis(15_500));
        assert_eq!(config.workers, 0);
        assert!(!config.tcp);
        assert!(!config.relay);
    }

    #[test]
    fn test_bad_listen_address() {
        let err = ServerConfig::from_args(&args(&["s", "--listen", "127.0.0.1,nope"])).unwrap_err();
        assert_eq!(err.flag, "--listen");
    }
}
