//! Shared building blocks for the rendezvous server and the peer agent
//!
//! - [`message`]: the JSON wire envelope and its codec
//! - [`timer`]: tickers, attempt budgets and jitter for retry loops
//! - [`signal`]: one-shot latches and the shutdown flag
//! - [`net`]: socket construction with address/port reuse
//! - [`args`]: `--flag value` parsing for the binaries

pub mod args;
pub mod error;
pub mod message;
pub mod net;
pub mod signal;
pub mod timer;

pub use error::{ArgError, CodecError};
pub use message::{decode, encode, Message, Op, StreamDecoder, UnknownOp, BYEBYE, ECHO};
pub use signal::{OneShot, Shutdown};
pub use timer::{Budget, Jitter, Ticker};
