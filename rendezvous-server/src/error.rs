//! Server error types

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Every configured address failed to bind
    #[error("no listener could be started")]
    NoListeners,

    #[error(transparent)]
    Config(#[from] punch_proto::ArgError),
}
