//! Databin reconstruction from shuffled, overlapping deliveries.

use jpip_streamer::databin::{
    ByteRange, ByteRangeStore, CopyOptions, DatabinId, DatabinRegistry, MessageHeader,
};
use jpip_streamer::error::DatabinError;

use super::test_utils::{content, shuffled};

fn assert_well_formed(store: &ByteRangeStore) {
    let ranges = store.existing_ranges();
    for pair in ranges.windows(2) {
        assert!(pair[0].end() < pair[1].start, "ranges {:?}", pair);
    }
    let sum: usize = ranges.iter().map(|r| r.length).sum();
    assert_eq!(store.loaded_bytes(), sum);
}

/// Chunks of `chunk` bytes, each starting `overlap` bytes early.
fn chunks(len: usize, chunk: usize, overlap: usize) -> Vec<(usize, usize)> {
    (0..len)
        .step_by(chunk)
        .map(|start| {
            let begin = start.saturating_sub(overlap);
            (begin, (start + chunk).min(len) - begin)
        })
        .collect()
}

#[test]
fn test_shuffled_overlapping_chunks_rebuild_resource() {
    let data = content(4000, 3);

    for (chunk, overlap, seed) in [(1, 0, 1), (7, 3, 2), (64, 0, 3), (100, 50, 4), (999, 998, 5)] {
        let pieces = chunks(data.len(), chunk, overlap);
        let mut store = ByteRangeStore::new();
        let mut added_total = 0;

        for idx in shuffled(pieces.len(), seed) {
            let (start, len) = pieces[idx];
            let mut header = MessageHeader::new(start, len);
            if start + len == data.len() {
                header = header.last();
            }
            added_total += store.add_data(&header, &data[start..start + len]).unwrap();
            assert_well_formed(&store);
        }

        assert_eq!(added_total, data.len(), "chunk {} overlap {}", chunk, overlap);
        assert!(store.is_all_databin_loaded());

        let mut copy = vec![0u8; data.len()];
        let copied = store
            .copy_bytes(&mut copy, 0, CopyOptions::new().force_all())
            .unwrap();
        assert_eq!(copied, Some(data.len()));
        assert_eq!(copy, data);
    }
}

#[test]
fn test_redelivery_is_idempotent() {
    let data = content(300, 9);
    let mut store = ByteRangeStore::new();

    let header = MessageHeader::new(100, 50);
    assert_eq!(store.add_data(&header, &data[100..150]).unwrap(), 50);
    assert_eq!(store.add_data(&header, &data[100..150]).unwrap(), 0);
    assert_eq!(store.loaded_bytes(), 50);
    assert_eq!(store.existing_ranges(), &[ByteRange::new(100, 50)]);
}

#[test]
fn test_message_body_inside_larger_buffer() {
    // A parsed response: 5 bytes of message header, then the body.
    let mut buffer = vec![0xAA; 5];
    buffer.extend_from_slice(b"payload");

    let mut store = ByteRangeStore::new();
    let header = MessageHeader::new(0, 7).with_body_start(5);
    store.add_data(&header, &buffer).unwrap();

    let mut out = [0u8; 7];
    store.copy_bytes(&mut out, 0, CopyOptions::new()).unwrap();
    assert_eq!(&out, b"payload");

    let beyond = MessageHeader::new(7, 8).with_body_start(5);
    assert!(matches!(
        store.add_data(&beyond, &buffer),
        Err(DatabinError::BodyOutOfSource { .. })
    ));
}

#[test]
fn test_partial_copy_stops_at_gap() {
    let data = content(20, 1);
    let mut store = ByteRangeStore::new();
    store.add_data(&MessageHeader::new(0, 7), &data[..7]).unwrap();
    store.add_data(&MessageHeader::new(10, 5), &data[10..15]).unwrap();

    let mut dest = vec![0xEE; 20];
    let copied = store
        .copy_bytes(&mut dest, 2, CopyOptions::new().starting_at(3))
        .unwrap();
    assert_eq!(copied, Some(4));
    assert_eq!(&dest[2..6], &data[3..7]);
    assert!(dest[..2].iter().all(|&b| b == 0xEE));
    assert!(dest[6..].iter().all(|&b| b == 0xEE));

    // Forced copy across the gap writes nothing.
    let mut dest = vec![0xEE; 20];
    let copied = store
        .copy_bytes(&mut dest, 0, CopyOptions::new().starting_at(5).max_length(10).force_all())
        .unwrap();
    assert_eq!(copied, None);
    assert!(dest.iter().all(|&b| b == 0xEE));
}

#[test]
fn test_registry_keeps_databins_apart() {
    let mut registry = DatabinRegistry::new();
    let a = DatabinId::precinct(1);
    let b = DatabinId::tile_header(1);

    registry.add_data(a, &MessageHeader::new(0, 3), b"abc").unwrap();
    registry
        .add_data(b, &MessageHeader::new(0, 2).last(), b"xy")
        .unwrap();

    assert_eq!(registry.databins().len(), 2);
    assert_eq!(registry.databins().total_loaded_bytes(), 5);
    assert!(!registry.databins().is_loaded(&a));
    assert!(registry.databins().is_loaded(&b));
}
