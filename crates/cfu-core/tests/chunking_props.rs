//! Property tests for chunk packing.

use cfu_core::payload::{BinRecords, ChunkCursor, PayloadChunker, encode_records};
use proptest::prelude::*;

fn arb_records() -> impl Strategy<Value = Vec<(u32, Vec<u8>)>> {
    prop::collection::vec(
        (any::<u32>(), prop::collection::vec(any::<u8>(), 1..=255)),
        1..12,
    )
}

/// Records laid out back to back from `base`.
fn arb_contiguous() -> impl Strategy<Value = (u32, Vec<Vec<u8>>)> {
    (
        0u32..0x1000_0000,
        prop::collection::vec(prop::collection::vec(any::<u8>(), 1..=255), 1..10),
    )
}

fn arb_chunker() -> impl Strategy<Value = PayloadChunker> {
    (prop_oneof![Just(1usize), Just(2), Just(4), Just(8)], 12usize..300)
        .prop_filter_map("no aligned room", |(alignment, buffer)| {
            PayloadChunker::new(buffer, 1, alignment).ok()
        })
}

/// Record data in payload order.
fn record_data(payload: &[u8]) -> Vec<u8> {
    BinRecords::new(payload)
        .map(|r| r.unwrap().data.to_vec())
        .collect::<Vec<_>>()
        .concat()
}

proptest! {
    #[test]
    fn chunks_reproduce_the_payload(records in arb_records(), chunker in arb_chunker()) {
        let payload = encode_records(records.iter().map(|(a, d)| (*a, &d[..])));

        let mut cursor = ChunkCursor::default();
        let mut sequence = 1u16;
        let mut data = Vec::new();
        let mut first_blocks = 0;
        let mut last_blocks = 0;
        while !cursor.is_done(&payload) {
            let chunk = chunker.fill(&payload, sequence, &mut cursor).unwrap();
            prop_assert!(!chunk.data.is_empty());
            prop_assert!(chunk.data.len() <= chunker.capacity());
            first_blocks += usize::from(chunk.is_first_block());
            last_blocks += usize::from(chunk.is_last_block());
            data.extend_from_slice(&chunk.data);
            sequence += 1;
        }

        prop_assert_eq!(data, record_data(&payload));
        prop_assert_eq!(first_blocks, 1);
        prop_assert_eq!(last_blocks, 1);
    }

    #[test]
    fn contiguous_images_fill_aligned_chunks(
        (base, pieces) in arb_contiguous(),
        chunker in arb_chunker(),
    ) {
        let mut address = base;
        let mut records = Vec::new();
        for piece in &pieces {
            records.push((address, &piece[..]));
            address += piece.len() as u32;
        }
        let payload = encode_records(records);

        let chunks: Vec<_> = chunker
            .chunks(&payload)
            .collect::<Result<_, _>>()
            .unwrap();
        let (last, rest) = chunks.split_last().unwrap();
        for chunk in rest {
            prop_assert_eq!(chunk.data.len(), chunker.capacity());
            prop_assert_eq!(chunk.data.len() % chunker.alignment(), 0);
        }
        prop_assert!(last.is_last_block());
        prop_assert!(last.data.len() <= chunker.capacity());

        let mut expected = base;
        for chunk in &chunks {
            prop_assert_eq!(chunk.address, expected);
            expected += chunk.data.len() as u32;
        }
    }

    #[test]
    fn resuming_from_any_cursor_matches(records in arb_records(), chunker in arb_chunker(), stop in 0usize..64) {
        let payload = encode_records(records.iter().map(|(a, d)| (*a, &d[..])));
        let all: Vec<_> = chunker.chunks(&payload).collect::<Result<_, _>>().unwrap();
        let stop = stop % all.len();

        let mut cursor = ChunkCursor::default();
        for i in 0..stop {
            chunker.fill(&payload, (i + 1) as u16, &mut cursor).unwrap();
        }
        let mut resumed = Vec::new();
        let mut sequence = (stop + 1) as u16;
        while !cursor.is_done(&payload) {
            resumed.push(chunker.fill(&payload, sequence, &mut cursor).unwrap());
            sequence += 1;
        }
        prop_assert_eq!(&resumed[..], &all[stop..]);
    }
}
