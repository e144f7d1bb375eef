//! Lightweight Prometheus-compatible metrics for the rendezvous server.
//!
//! Atomic counters bumped from listener and handler threads. Rendered in
//! Prometheus text exposition format and logged when the server stops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    /// Datagrams read from any UDP listener (counter)
    pub datagrams_received_total: AtomicU64,
    /// Datagrams/stream objects that failed to decode (counter)
    pub decode_errors_total: AtomicU64,
    /// `pong1`/`pong2` answers sent over UDP or TCP (counter)
    pub probes_answered_total: AtomicU64,
    /// `report` heartbeats handled (counter)
    pub reports_total: AtomicU64,
    /// `request` messages handled (counter)
    pub requests_total: AtomicU64,
    /// Peer pairs introduced (counter)
    pub matches_total: AtomicU64,
    /// Relay messages forwarded (counter)
    pub relays_total: AtomicU64,
    /// Messages dropped: missing id, unknown op, full queue (counter)
    pub dropped_total: AtomicU64,
    /// Records removed by the expiry sweep (counter)
    pub expired_records_total: AtomicU64,
    /// TCP probe connections accepted (counter)
    pub tcp_connections_total: AtomicU64,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            datagrams_received_total: AtomicU64::new(0),
            decode_errors_total: AtomicU64::new(0),
            probes_answered_total: AtomicU64::new(0),
            reports_total: AtomicU64::new(0),
            requests_total: AtomicU64::new(0),
            matches_total: AtomicU64::new(0),
            relays_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            expired_records_total: AtomicU64::new(0),
            tcp_connections_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Bump a counter by one
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    ///
    /// `registry_records` is sampled by the caller, since the registry
    /// lives outside the metrics block.
    pub fn render(&self, registry_records: usize) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        let counters = [
            ("datagrams_received_total", "Datagrams received on UDP listeners", &self.datagrams_received_total),
            ("decode_errors_total", "Messages that failed to decode", &self.decode_errors_total),
            ("probes_answered_total", "pong1/pong2 answers sent", &self.probes_answered_total),
            ("reports_total", "Report heartbeats handled", &self.reports_total),
            ("requests_total", "Match requests handled", &self.requests_total),
            ("matches_total", "Peer pairs introduced", &self.matches_total),
            ("relays_total", "Relay messages forwarded", &self.relays_total),
            ("dropped_total", "Messages dropped without handling", &self.dropped_total),
            ("expired_records_total", "Registry records removed by the sweep", &self.expired_records_total),
            ("tcp_connections_total", "TCP probe connections accepted", &self.tcp_connections_total),
        ];

        let mut out = String::new();
        for (name, help, counter) in counters {
            out.push_str(&format!(
                "# HELP rendezvous_{name} {help}\n\
                 # TYPE rendezvous_{name} counter\n\
                 rendezvous_{name} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "# HELP rendezvous_registry_records Records currently in the registry\n\
             # TYPE rendezvous_registry_records gauge\n\
             rendezvous_registry_records {}\n\
             # HELP rendezvous_uptime_seconds Server uptime in seconds\n\
             # TYPE rendezvous_uptime_seconds gauge\n\
             rendezvous_uptime_seconds {}\n",
            registry_records, uptime,
        ));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
