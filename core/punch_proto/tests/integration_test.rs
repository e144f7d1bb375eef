//! Codec and stream-framing properties for punch_proto

use proptest::prelude::*;

use punch_proto::message::{MAX_MESSAGE_SIZE, RECV_BUFFER_SIZE};
use punch_proto::{decode, encode, CodecError, Message, Op, StreamDecoder};

// ============================================================================
// Strategies
// ============================================================================

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Ping1),
        Just(Op::Ping2),
        Just(Op::Report),
        Just(Op::Request),
        Just(Op::Pong1),
        Just(Op::Pong2),
        Just(Op::Pong3),
        Just(Op::Notify),
        Just(Op::Relay),
        Just(Op::ClientPing),
        Just(Op::PeerPing),
        Just(Op::ServerPing),
        Just(Op::Hello),
        // Any lowercase word, known codes included; `Op::from` maps those
        // to their variants
        "[a-z0-9]{1,10}".prop_map(Op::from),
    ]
}

fn endpoint_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        (any::<[u8; 4]>(), any::<u16>())
            .prop_map(|(ip, port)| format!("{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)),
    ]
}

fn message_strategy() -> impl Strategy<Value = Message> {
    (
        op_strategy(),
        "[a-f0-9]{0,16}(:[0-9]{1,5})?",
        (endpoint_strategy(), endpoint_strategy()),
        (endpoint_strategy(), endpoint_strategy()),
        ".{0,64}",
        any::<u32>(),
    )
        .prop_map(|(op, id, (local, remote), (public, peer), msg, ping_num)| {
            Message::new(op, id)
                .with_local(local)
                .with_remote(remote)
                .with_public(public)
                .with_peer(peer)
                .with_msg(msg)
                .with_ping_num(ping_num)
        })
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Any envelope survives a datagram round trip
    #[test]
    fn datagram_roundtrip(msg in message_strategy()) {
        let encoded = encode(&msg).unwrap();
        prop_assert!(encoded.len() <= MAX_MESSAGE_SIZE);
        prop_assert_eq!(decode(&encoded).unwrap(), msg);
    }

    /// A byte stream of envelopes decodes back in order, however it is chunked
    #[test]
    fn stream_roundtrip_any_chunking(
        msgs in prop::collection::vec(message_strategy(), 1..6),
        chunk in 1usize..64,
    ) {
        let mut bytes = Vec::new();
        for msg in &msgs {
            bytes.extend(encode(msg).unwrap());
        }

        let mut decoder = StreamDecoder::new();
        let mut decoded = Vec::new();
        for piece in bytes.chunks(chunk) {
            decoder.push(piece);
            while let Some(result) = decoder.next_message() {
                decoded.push(result.unwrap());
            }
        }

        prop_assert_eq!(decoded, msgs);
        prop_assert_eq!(decoder.buffered(), 0);
    }

    /// Decoding arbitrary bytes never panics
    #[test]
    fn decode_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode(&bytes);
    }
}

// ============================================================================
// Edge Cases
// ============================================================================

#[test]
fn test_oversized_datagram_rejected_before_parse() {
    let big = vec![b' '; RECV_BUFFER_SIZE + 1];
    assert!(matches!(decode(&big), Err(CodecError::TooLarge(_))));
}

#[test]
fn test_stream_recovers_after_garbage() {
    let mut decoder = StreamDecoder::new();
    decoder.push(b"[1,2,3]");
    assert!(matches!(decoder.next_message(), Some(Err(_))));

    decoder.push(&encode(&Message::new(Op::Report, "p1:1")).unwrap());
    let msg = decoder.next_message().unwrap().unwrap();
    assert_eq!(msg.op, Op::Report);
}

#[test]
fn test_newline_delimited_stream() {
    let mut decoder = StreamDecoder::new();
    decoder.push(b"{\"id\":\"a\",\"op\":\"ping1\"}\n{\"id\":\"b\",\"op\":\"ping2\"}\n");

    assert_eq!(decoder.next_message().unwrap().unwrap().id, "a");
    assert_eq!(decoder.next_message().unwrap().unwrap().id, "b");
    assert!(decoder.next_message().is_none());
    assert_eq!(decoder.buffered(), 0);
}
