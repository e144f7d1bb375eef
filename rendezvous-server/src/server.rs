//! Server assembly: listeners, worker pool and expiry sweep

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use punch_proto::Shutdown;

use crate::config::ServerConfig;
use crate::dispatch::WorkerPool;
use crate::error::ServerError;
use crate::handler::Handler;
use crate::interfaces::listen_addrs;
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::tcp::TcpProbeListener;
use crate::udp::UdpListener;

// ============================================================================
// RendezvousServer
// ============================================================================

/// A bound but not yet running server
///
/// Binding and running are separate so callers (and tests) can learn the
/// actual listener addresses before traffic starts.
pub struct RendezvousServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    udp: Vec<UdpListener>,
    tcp: Option<TcpProbeListener>,
}

impl RendezvousServer {
    /// Bind every listener named by `config`
    ///
    /// An address that fails to bind is logged and skipped; binding fails
    /// only if no UDP listener comes up at all. With port 0 each TCP listener
    /// takes the port its UDP sibling was given.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let mut udp = Vec::new();
        for addr in listen_addrs(&config.listen, config.port) {
            match UdpListener::bind(addr) {
                Ok(listener) => udp.push(listener),
                Err(source) => {
                    let err = ServerError::Bind { addr, source };
                    log::warn!("{}", err);
                }
            }
        }

        if udp.is_empty() {
            return Err(ServerError::NoListeners);
        }

        let tcp = if config.tcp {
            let addrs: Vec<SocketAddr> = udp.iter().map(UdpListener::local_addr).collect();
            match TcpProbeListener::bind(&addrs) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    log::warn!("TCP probe listener disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(RendezvousServer {
            registry: Arc::new(Registry::new(config.entry_ttl())),
            metrics: Arc::new(Metrics::new()),
            config,
            udp,
            tcp,
        })
    }

    pub fn udp_addrs(&self) -> Vec<SocketAddr> {
        self.udp.iter().map(UdpListener::local_addr).collect()
    }

    pub fn tcp_addrs(&self) -> Vec<SocketAddr> {
        self.tcp
            .as_ref()
            .map(|tcp| tcp.local_addrs().to_vec())
            .unwrap_or_default()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Serve until `shutdown` is triggered
    pub fn run(self, shutdown: Shutdown) -> Result<(), ServerError> {
        let RendezvousServer {
            config,
            registry,
            metrics,
            udp,
            tcp,
        } = self;

        let pool = WorkerPool::new(config.workers, config.queue_depth)?;
        let handler = Arc::new(Handler::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            config.relay,
        ));

        log::info!(
            "Rendezvous server running: {} UDP listener(s), TCP {}, {} worker(s), record TTL {:?}",
            udp.len(),
            if tcp.is_some() { "on" } else { "off" },
            pool.size(),
            registry.ttl()
        );

        let mut threads: Vec<(String, JoinHandle<std::io::Result<()>>)> = Vec::new();

        {
            let registry = Arc::clone(&registry);
            let metrics = Arc::clone(&metrics);
            let shutdown = shutdown.clone();
            let interval = config.sweep_interval;
            let handle = thread::Builder::new()
                .name("registry-sweep".to_string())
                .spawn(move || {
                    run_sweeper(&registry, &metrics, interval, &shutdown);
                    Ok(())
                })?;
            threads.push(("registry-sweep".to_string(), handle));
        }

        for listener in udp {
            let name = format!("udp-{}", listener.local_addr());
            let handler = Arc::clone(&handler);
            let dispatcher = pool.dispatcher();
            let metrics = Arc::clone(&metrics);
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || listener.run(handler, dispatcher, metrics, shutdown))?;
            threads.push((name, handle));
        }

        if let Some(tcp) = tcp {
            let metrics = Arc::clone(&metrics);
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name("tcp-probe".to_string())
                .spawn(move || tcp.run(metrics, shutdown))?;
            threads.push(("tcp-probe".to_string(), handle));
        }

        for (name, handle) in threads {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("{} exited with error: {}", name, e),
                Err(_) => log::error!("{} panicked", name),
            }
        }

        // Listener dispatchers are gone; dropping the pool joins the workers
        drop(pool);

        log::info!("Rendezvous server stopped\n{}", metrics.render(registry.len()));
        Ok(())
    }

    /// Run on a background thread
    pub fn spawn(self, shutdown: Shutdown) -> std::io::Result<JoinHandle<Result<(), ServerError>>> {
        thread::Builder::new()
            .name("rendezvous-server".to_string())
            .spawn(move || self.run(shutdown))
    }
}

/// Sweep expired records every `interval` until shutdown
pub fn run_sweeper(registry: &Registry, metrics: &Metrics, interval: Duration, shutdown: &Shutdown) {
    while !shutdown.sleep(interval) {
        let removed = registry.sweep_expired(Instant::now());
        if removed > 0 {
            log::debug!("Swept {} expired record(s), {} remaining", removed, registry.len());
            metrics
                .expired_records_total
                .fetch_add(removed as u64, std::sync::atomic::Ordering::Relaxed);
        }
    }
    log::debug!("Registry sweep stopped");
}
