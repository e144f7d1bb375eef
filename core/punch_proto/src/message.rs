//! Wire envelope shared by the rendezvous server and peer agents
//!
//! Every datagram is one JSON object. Empty strings and zero counters are
//! omitted on encode so the short control messages stay well under the UDP
//! MTU.
//!
//! # Example
//!
//! ```text
//! {"id":"a1b2c3:40123","op":"request","pingnum":20}
//! {"id":"a1b2c3:40123","public":"203.0.113.5:40123","peer":"198.51.100.7:5000","msg":"f00d:5000","op":"pong3","pingnum":20}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

// ============================================================================
// Constants
// ============================================================================

/// Largest datagram we encode (keeps headroom below a 1500 byte MTU)
pub const MAX_MESSAGE_SIZE: usize = 1350;

/// Receive buffer size for sockets carrying envelopes
pub const RECV_BUFFER_SIZE: usize = 2048;

/// Payload that ends a peer-to-peer session
pub const BYEBYE: &str = "byebye";

/// Payload marking a reply to a probe or hello (never answered again)
pub const ECHO: &str = "echo";

// ============================================================================
// Operation Codes
// ============================================================================

/// Operation code carried in the `op` field
///
/// Codes are case-sensitive strings on the wire. Unrecognised codes decode
/// to [`Op::Other`] so the receiver can log them before dropping the message.
/// `Other` is only built through `From<String>`, so it never holds a known
/// code and every `Op` encodes to a string that decodes back to itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Op {
    /// First NAT probe (client -> server 1)
    Ping1,
    /// Second NAT probe (client -> server 2)
    Ping2,
    /// Heartbeat announcing the peer is seeking a match
    Report,
    /// Ask the server for a match (`request`, alias `ping3`)
    Request,
    /// Answer to `ping1`
    Pong1,
    /// Answer to `ping2`
    Pong2,
    /// Match answer sent to the requester
    Pong3,
    /// Match announcement sent to the waiting peer
    Notify,
    /// Message forwarded through the server
    Relay,
    /// Punch probe, client flavour
    ClientPing,
    /// Punch probe, peer flavour
    PeerPing,
    /// Punch probe, server-role flavour
    ServerPing,
    /// Post-punch liveness/data
    Hello,
    /// Anything else
    Other(UnknownOp),
}

/// Code text of an unrecognised op
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnknownOp(String);

impl UnknownOp {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Op {
    /// Wire representation
    pub fn as_str(&self) -> &str {
        match self {
            Op::Ping1 => "ping1",
            Op::Ping2 => "ping2",
            Op::Report => "report",
            Op::Request => "request",
            Op::Pong1 => "pong1",
            Op::Pong2 => "pong2",
            Op::Pong3 => "pong3",
            Op::Notify => "notify",
            Op::Relay => "relay",
            Op::ClientPing => "cping",
            Op::PeerPing => "pping",
            Op::ServerPing => "sping",
            Op::Hello => "hello",
            Op::Other(code) => code.as_str(),
        }
    }

    /// Whether this op is one of the punch probe flavours
    pub fn is_punch_probe(&self) -> bool {
        matches!(self, Op::ClientPing | Op::PeerPing | Op::ServerPing)
    }

    /// Whether this op carries a rendezvous introduction
    pub fn is_introduction(&self) -> bool {
        matches!(self, Op::Pong3 | Op::Notify)
    }
}

impl From<String> for Op {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ping1" => Op::Ping1,
            "ping2" => Op::Ping2,
            "report" => Op::Report,
            "request" | "ping3" => Op::Request,
            "pong1" => Op::Pong1,
            "pong2" => Op::Pong2,
            "pong3" => Op::Pong3,
            "notify" => Op::Notify,
            "relay" => Op::Relay,
            "cping" => Op::ClientPing,
            "pping" => Op::PeerPing,
            "sping" => Op::ServerPing,
            "hello" => Op::Hello,
            _ => Op::Other(UnknownOp(s)),
        }
    }
}

impl From<&str> for Op {
    fn from(s: &str) -> Self {
        Op::from(s.to_string())
    }
}

impl From<Op> for String {
    fn from(op: Op) -> Self {
        match op {
            Op::Other(code) => code.0,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Message
// ============================================================================

/// The wire envelope
///
/// Only `op` is mandatory. `public` is always filled in by the receiver from
/// the transport source address; whatever the sender put there is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sender's run-scoped identifier
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Local address as seen by the sender (diagnostic only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub local: String,
    /// Remote address as seen by the sender (diagnostic only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote: String,
    /// Observed source address of the message this one answers
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public: String,
    /// Public endpoint of an introduced peer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer: String,
    /// Free-form payload
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
    /// Operation code
    pub op: Op,
    /// Punch attempt counter/budget
    #[serde(default, rename = "pingnum", alias = "pingNum", skip_serializing_if = "is_zero")]
    pub ping_num: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Message {
    /// Create a message with only `op` and `id` set
    pub fn new(op: Op, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            local: String::new(),
            remote: String::new(),
            public: String::new(),
            peer: String::new(),
            msg: String::new(),
            op,
            ping_num: 0,
        }
    }

    pub fn with_public(mut self, public: impl Into<String>) -> Self {
        self.public = public.into();
        self
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }

    pub fn with_local(mut self, local: impl Into<String>) -> Self {
        self.local = local.into();
        self
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    pub fn with_ping_num(mut self, ping_num: u32) -> Self {
        self.ping_num = ping_num;
        self
    }

    /// Whether this message is the session-ending sentinel
    pub fn is_byebye(&self) -> bool {
        self.msg == BYEBYE
    }

    /// Whether this message is itself a reply and must not be answered
    pub fn is_echo(&self) -> bool {
        self.msg == ECHO
    }
}

impl fmt::Display for Message {
    /// Compact one-line form for log output, skipping empty fields
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op={}", self.op)?;
        for (name, value) in [
            ("id", &self.id),
            ("local", &self.local),
            ("remote", &self.remote),
            ("public", &self.public),
            ("peer", &self.peer),
            ("msg", &self.msg),
        ] {
            if !value.is_empty() {
                write!(f, " {}={}", name, value)?;
            }
        }
        if self.ping_num != 0 {
            write!(f, " pingnum={}", self.ping_num)?;
        }
        Ok(())
    }
}

// ============================================================================
// Encoding/Decoding
// ============================================================================

/// Encode a message into one datagram
pub fn encode(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let buf = serde_json::to_vec(msg).map_err(CodecError::Encode)?;
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge(buf.len()));
    }
    Ok(buf)
}

/// Decode one datagram
pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
    if buf.len() > RECV_BUFFER_SIZE {
        return Err(CodecError::TooLarge(buf.len()));
    }
    serde_json::from_slice(buf).map_err(CodecError::Decode)
}

/// Incremental decoder for envelopes arriving over a byte stream (TCP)
///
/// Objects may be split across reads or several may arrive in one read;
/// partial objects stay buffered until the rest shows up.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete message
    ///
    /// Returns `None` when more bytes are needed. A malformed object clears
    /// the buffer and yields the error once.
    pub fn next_message(&mut self) -> Option<Result<Message, CodecError>> {
        if self.buf.len() > RECV_BUFFER_SIZE * 4 {
            let len = self.buf.len();
            self.buf.clear();
            return Some(Err(CodecError::TooLarge(len)));
        }

        let (result, consumed) = {
            let mut iter = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Message>();
            match iter.next() {
                None => (None, self.buf.len()),
                Some(Ok(msg)) => (Some(Ok(msg)), iter.byte_offset()),
                Some(Err(e)) if e.is_eof() => (None, 0),
                Some(Err(e)) => (Some(Err(CodecError::Decode(e))), self.buf.len()),
            }
        };

        self.buf.drain(..consumed);
        result
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_fields_omitted() {
        let msg = Message::new(Op::Ping1, "p1:4000");
        let encoded = String::from_utf8(encode(&msg).unwrap()).unwrap();

        assert_eq!(encoded, r#"{"id":"p1:4000","op":"ping1"}"#);
    }

    #[test]
    fn test_pong3_roundtrip() {
        let msg = Message::new(Op::Pong3, "p1")
            .with_public("203.0.113.5:40000")
            .with_peer("198.51.100.7:5000")
            .with_msg("p2")
            .with_ping_num(20);

        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_ping3_alias_decodes_as_request() {
        let msg = decode(br#"{"id":"p1","op":"ping3"}"#).unwrap();
        assert_eq!(msg.op, Op::Request);
    }

    #[test]
    fn test_pingnum_camel_case_alias() {
        let msg = decode(br#"{"id":"p1","op":"request","pingNum":7}"#).unwrap();
        assert_eq!(msg.ping_num, 7);

        let encoded = String::from_utf8(encode(&msg).unwrap()).unwrap();
        assert!(encoded.contains(r#""pingnum":7"#));
    }

    #[test]
    fn test_unknown_op_preserved() {
        let msg = decode(br#"{"id":"p1","op":"teleport"}"#).unwrap();
        assert!(matches!(msg.op, Op::Other(_)));
        assert_eq!(msg.op, Op::from("teleport"));
        assert_eq!(msg.op.as_str(), "teleport");
        assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_known_codes_never_become_other() {
        for code in ["request", "ping3", "pong3", "notify", "hello"] {
            let op = Op::from(code);
            assert!(!matches!(op, Op::Other(_)), "{} parsed as unknown", code);

            let msg = Message::new(op, "p1");
            assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
        }
        assert_eq!(Op::from("ping3"), Op::Request);
    }

    #[test]
    fn test_diagnostic_addresses_roundtrip() {
        let msg = Message::new(Op::Ping1, "p1")
            .with_local("10.0.0.2:5000")
            .with_remote("192.0.2.1:20018");
        let encoded = String::from_utf8(encode(&msg).unwrap()).unwrap();
        assert!(encoded.contains(r#""local":"10.0.0.2:5000""#));
        assert!(encoded.contains(r#""remote":"192.0.2.1:20018""#));

        let decoded = decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.to_string(), "op=ping1 id=p1 local=10.0.0.2:5000 remote=192.0.2.1:20018");
    }

    #[test]
    fn test_missing_op_is_error() {
        assert!(matches!(decode(br#"{"id":"p1"}"#), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_malformed_is_error() {
        assert!(matches!(decode(b"not json"), Err(CodecError::Decode(_))));
        assert!(matches!(decode(b""), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_oversized_encode_rejected() {
        let msg = Message::new(Op::Hello, "p1").with_msg("x".repeat(MAX_MESSAGE_SIZE));
        assert!(matches!(encode(&msg), Err(CodecError::TooLarge(_))));
    }

    #[test]
    fn test_punch_probe_flavours() {
        assert!(Op::ClientPing.is_punch_probe());
        assert!(Op::PeerPing.is_punch_probe());
        assert!(Op::ServerPing.is_punch_probe());
        assert!(!Op::Hello.is_punch_probe());
        assert!(Op::Pong3.is_introduction());
        assert!(Op::Notify.is_introduction());
        assert!(!Op::Pong2.is_introduction());
    }

    #[test]
    fn test_display_skips_empty() {
        let msg = Message::new(Op::Report, "p1").with_public("1.2.3.4:5");
        assert_eq!(msg.to_string(), "op=report id=p1 public=1.2.3.4:5");
    }

    #[test]
    fn test_stream_decoder_split_and_coalesced() {
        let a = encode(&Message::new(Op::Ping1, "a")).unwrap();
        let b = encode(&Message::new(Op::Ping2, "b")).unwrap();

        let mut decoder = StreamDecoder::new();
        decoder.push(&a[..5]);
        assert!(decoder.next_message().is_none());

        decoder.push(&a[5..]);
        decoder.push(&b);

        let first = decoder.next_message().unwrap().unwrap();
        let second = decoder.next_message().unwrap().unwrap();
        assert_eq!(first.op, Op::Ping1);
        assert_eq!(second.op, Op::Ping2);
        assert!(decoder.next_message().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_stream_decoder_garbage_clears_buffer() {
        let mut decoder = StreamDecoder::new();
        decoder.push(b"}}}");
        assert!(matches!(decoder.next_message(), Some(Err(CodecError::Decode(_)))));
        assert_eq!(decoder.buffered(), 0);
    }
}
