//! Rendezvous server for UDP hole punching
//!
//! The server:
//! - Answers `ping1`/`ping2` with the observed source address (UDP and TCP)
//! - Keeps an expiring registry of peers that are seeking a partner
//! - Introduces two seeking peers to each other (`pong3` + `notify`)
//! - Optionally relays messages between peers that cannot punch through

pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod interfaces;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod tcp;
pub mod udp;

pub use config::ServerConfig;
pub use error::ServerError;
pub use registry::{Phase, PeerRecord, Registry};
pub use server::RendezvousServer;
