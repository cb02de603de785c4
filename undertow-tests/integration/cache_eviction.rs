//! Eviction invariants of the piece cache under arbitrary reader layouts.

use std::io::SeekFrom;
use std::sync::Arc;

use proptest::prelude::*;
use undertow_core::UndertowConfig;
use undertow_core::storage::Cache;
use undertow_core::storage::range::in_file_boundary;
use undertow_core::swarm::test_mocks::MockFileStream;
use undertow_core::swarm::{FileEntry, InfoHash, TorrentInfo};

const PIECE: u64 = 1024;

/// Two back-to-back files split at piece `split`.
fn layout(split: usize, total: usize) -> TorrentInfo {
    let first = split as u64 * PIECE;
    let second = (total - split) as u64 * PIECE;
    TorrentInfo {
        name: "season".to_string(),
        piece_length: PIECE,
        piece_count: total,
        files: vec![
            FileEntry {
                index: 0,
                path: "e01.mkv".to_string(),
                offset: 0,
                length: first,
            },
            FileEntry {
                index: 1,
                path: "e02.mkv".to_string(),
                offset: first,
                length: second,
            },
        ],
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_pass_keeps_protected_pieces_and_honours_capacity(
        split in 1usize..20,
        extra in 1usize..40,
        capacity_pieces in 2u64..16,
        readers in prop::collection::vec((0usize..2, 0.0f64..1.0), 0..3),
        written in prop::collection::vec(any::<bool>(), 60),
    ) {
        let total = split + extra;
        let info = layout(split, total);
        let mut config = UndertowConfig::for_testing();
        config.cache.cache_size = capacity_pieces * PIECE;
        let cache = Cache::new(&info, InfoHash::new([7u8; 20]), Arc::new(config));

        let mut opened = Vec::new();
        for (file_index, position) in &readers {
            let file = info.files[*file_index].clone();
            let offset = (file.length as f64 * position) as u64;
            let (stream, _) = MockFileStream::new(vec![0u8; file.length as usize]);
            let reader = cache.new_reader(file, Box::new(stream));
            tokio_test::block_on(reader.seek(SeekFrom::Start(offset))).unwrap();
            opened.push(reader);
        }

        for id in (0..total).filter(|id| written[*id]) {
            let piece = cache.piece(id);
            piece.write_at(&vec![id as u8; PIECE as usize], 0).unwrap();
            piece.mark_complete().unwrap();
        }

        cache.clean_pieces();

        let ranges: Vec<_> = opened.iter().filter_map(|r| r.pieces_range()).collect();
        let files: Vec<FileEntry> = opened.iter().map(|r| r.file().clone()).collect();
        let protected = |id: usize| {
            ranges.iter().any(|r| r.contains(id)) || in_file_boundary(files.iter(), PIECE, id)
        };

        let state = cache.state();
        for id in (0..total).filter(|id| written[*id] && protected(*id)) {
            prop_assert!(state.pieces.contains_key(&id), "protected piece {} evicted", id);
        }
        prop_assert!(
            state.filled <= cache.capacity() || state.pieces.keys().all(|id| protected(*id)),
            "filled {} over capacity {} with evictable pieces left",
            state.filled,
            cache.capacity()
        );
    }
}

#[test]
fn test_pass_without_readers_evicts_oldest_down_to_capacity() {
    let info = layout(4, 12);
    let mut config = UndertowConfig::for_testing();
    config.cache.cache_size = 4 * PIECE;
    let cache = Cache::new(&info, InfoHash::new([8u8; 20]), Arc::new(config));

    for id in 0..12 {
        let piece = cache.piece(id);
        piece.write_at(&vec![1u8; PIECE as usize], 0).unwrap();
        piece.mark_complete().unwrap();
    }
    cache.clean_pieces();

    let state = cache.state();
    assert!(state.filled <= 4 * PIECE);
    assert!(state.pieces.values().all(|p| p.completed && p.size == PIECE));
    assert!(cache.clean_pieces().is_empty());
}
