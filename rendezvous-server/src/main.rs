//! Rendezvous server binary

use punch_proto::args::has_flag;
use punch_proto::Shutdown;
use rendezvous_server::{RendezvousServer, ServerConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    // --debug raises the default filter; RUST_LOG still wins
    let default_filter = if has_flag(&args, "--debug") { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    )
    .init();

    let config = ServerConfig::from_args(&args)?;

    log::info!("Rendezvous server starting...");
    log::info!("  Port:      {}", config.port);
    if config.listen.is_empty() {
        log::info!("  Listen:    all IPv4 interfaces");
    } else {
        log::info!("  Listen:    {:?}", config.listen);
    }
    log::info!("  TTL:       {:?}", config.entry_ttl());
    log::info!("  TCP:       {}", if config.tcp { "enabled" } else { "disabled" });
    log::info!("  Relay:     {}", if config.relay { "enabled" } else { "disabled" });

    let shutdown = Shutdown::new();
    shutdown.register_signals()?;

    let server = RendezvousServer::bind(config)?;
    server.run(shutdown)?;
    Ok(())
}
