//! Property tests for the wire codec and the chunk reassembler.

use bytes::Bytes;
use proptest::prelude::*;

use ble_http_bridge::protocol::{
    decode, encode, BoardFrame, FrameBuffer, PhoneFrame, RequestMethod,
};
use ble_http_bridge::writer::split_chunks;

fn arb_method() -> impl Strategy<Value = RequestMethod> {
    prop_oneof![
        Just(RequestMethod::Get),
        Just(RequestMethod::Post),
        Just(RequestMethod::Stream),
    ]
}

fn arb_board_frame() -> impl Strategy<Value = BoardFrame> {
    prop_oneof![
        (any::<u32>(), arb_method(), any::<String>(), proptest::option::of(any::<String>()))
            .prop_map(|(id, method, url, body)| BoardFrame::Request { id, method, url, body }),
        any::<u32>().prop_map(|id| BoardFrame::Cancel { id }),
        any::<u32>().prop_map(|id| BoardFrame::Ping { id }),
    ]
}

fn arb_phone_frame() -> impl Strategy<Value = PhoneFrame> {
    prop_oneof![
        (any::<u32>(), any::<String>()).prop_map(|(id, body)| PhoneFrame::Response { id, body }),
        (any::<u32>(), any::<String>()).prop_map(|(id, chunk)| PhoneFrame::StreamData { id, chunk }),
        any::<u32>().prop_map(|id| PhoneFrame::StreamClosed { id }),
        any::<u32>().prop_map(|id| PhoneFrame::Pong { id }),
        (proptest::option::of(any::<u32>()), any::<String>())
            .prop_map(|(id, message)| PhoneFrame::Error { id, message }),
    ]
}

/// Cut `bytes` at the given (unsorted, possibly repeated) offsets.
fn split_at_offsets(bytes: &[u8], offsets: &[usize]) -> Vec<Vec<u8>> {
    let mut cuts: Vec<usize> = offsets
        .iter()
        .map(|o| o % bytes.len().max(1))
        .filter(|&o| o > 0)
        .collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut pieces = Vec::new();
    let mut start = 0;
    for cut in cuts {
        pieces.push(bytes[start..cut].to_vec());
        start = cut;
    }
    pieces.push(bytes[start..].to_vec());
    pieces
}

proptest! {
    /// decode(encode(f)) == f for board frames.
    #[test]
    fn board_frame_round_trip(frame in arb_board_frame()) {
        let bytes = encode(&frame).unwrap();
        prop_assert_eq!(bytes.last(), Some(&b'\n'));
        prop_assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 1);

        let line = std::str::from_utf8(&bytes[..bytes.len() - 1]).unwrap();
        prop_assert_eq!(decode::<BoardFrame>(line), Ok(frame));
    }

    /// decode(encode(f)) == f for phone frames.
    #[test]
    fn phone_frame_round_trip(frame in arb_phone_frame()) {
        let bytes = encode(&frame).unwrap();
        let line = std::str::from_utf8(&bytes[..bytes.len() - 1]).unwrap();
        prop_assert_eq!(decode::<PhoneFrame>(line), Ok(frame));
    }

    /// Any split of one encoded frame reassembles into exactly that frame.
    #[test]
    fn reassembly_under_arbitrary_splitting(
        frame in arb_phone_frame(),
        offsets in proptest::collection::vec(any::<usize>(), 0..16),
    ) {
        let bytes = encode(&frame).unwrap();
        let mut buffer = FrameBuffer::new();
        let mut decoded = Vec::new();

        for piece in split_at_offsets(&bytes, &offsets) {
            decoded.extend(buffer.push::<PhoneFrame>(&piece));
        }

        prop_assert_eq!(decoded, vec![Ok(frame)]);
        prop_assert!(buffer.is_empty());
    }

    /// Several frames split by the writer come back in order.
    #[test]
    fn writer_chunks_reassemble_in_order(
        frames in proptest::collection::vec(arb_board_frame(), 1..6),
        max_chunk in 1usize..64,
    ) {
        let mut buffer = FrameBuffer::new();
        let mut decoded = Vec::new();

        for frame in &frames {
            let bytes = encode(frame).unwrap();
            for chunk in split_chunks(&bytes, max_chunk) {
                prop_assert!(chunk.len() <= max_chunk);
                decoded.extend(buffer.push::<BoardFrame>(&chunk));
            }
        }

        let expected: Vec<_> = frames.into_iter().map(Ok).collect();
        prop_assert_eq!(decoded, expected);
    }

    /// Chunks cover the input exactly, in order.
    #[test]
    fn split_chunks_covers_input(
        data in proptest::collection::vec(any::<u8>(), 0..512),
        max_chunk in 1usize..100,
    ) {
        let bytes = Bytes::from(data.clone());
        let chunks: Vec<Bytes> = split_chunks(&bytes, max_chunk).collect();

        prop_assert_eq!(chunks.len(), data.len().div_ceil(max_chunk));
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.to_vec()).collect();
        prop_assert_eq!(joined, data);
    }

    /// Garbage never panics the reassembler, and a valid frame after a
    /// delimiter still decodes.
    #[test]
    fn garbage_does_not_wedge_buffer(
        garbage in proptest::collection::vec(any::<u8>(), 0..256),
        id in any::<u32>(),
    ) {
        let mut buffer = FrameBuffer::new();
        let _ = buffer.push::<BoardFrame>(&garbage);
        let _ = buffer.push::<BoardFrame>(b"\n");

        let decoded = buffer.push::<BoardFrame>(&encode(&BoardFrame::Ping { id }).unwrap());
        prop_assert_eq!(decoded, vec![Ok(BoardFrame::Ping { id })]);
    }
}
