//! Error types shared by the codec

use thiserror::Error;

/// Failure to turn a message into bytes or back
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Input is not a valid envelope
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Envelope exceeds the datagram budget
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
}

/// Bad command-line value
#[derive(Debug, Error)]
#[error("invalid value {value:?} for {flag}: {reason}")]
pub struct ArgError {
    pub flag: String,
    pub value: String,
    pub reason: String,
}
