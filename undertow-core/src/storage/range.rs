//! Piece-range arithmetic behind eviction and prioritization.
//!
//! Converts reader positions into protected piece windows, merges them, and
//! decides which priority tier a piece deserves relative to a reader. Everything
//! here is pure so the cache pass stays a thin loop over these helpers.

use crate::swarm::{FileEntry, PiecePriority};

/// Bytes at each end of a file that are never evicted, unless a piece is larger.
pub const FILE_BOUNDARY_BYTES: u64 = 8 << 20;

/// Pieces past the readahead window that get [`PiecePriority::High`].
pub const HIGH_PRIORITY_PIECES: usize = 5;

/// Protected window of one active reader, in piece-index space (inclusive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub start: usize,
    pub end: usize,
    pub file: FileEntry,
}

impl Range {
    pub fn new(start: usize, end: usize, file: FileEntry) -> Self {
        Self { start, end, file }
    }

    pub fn contains(&self, id: usize) -> bool {
        id >= self.start && id <= self.end
    }
}

/// Piece index holding byte `offset` of `file`.
pub fn piece_index(file: &FileEntry, offset: u64, piece_length: u64) -> usize {
    ((file.offset + offset) / piece_length.max(1)) as usize
}

/// Byte window `[begin, end]` a reader protects inside its file.
///
/// The cache capacity is shared evenly between active readers; `percent` of a
/// share sits ahead of the position and the rest behind it.
pub fn reader_window(
    offset: u64,
    file_length: u64,
    capacity: u64,
    active_readers: usize,
    percent: u64,
) -> (u64, u64) {
    let share = capacity / active_readers.max(1) as u64;
    let percent = percent.min(100);
    let behind = share * (100 - percent) / 100;
    let ahead = share * percent / 100;

    let begin = offset.saturating_sub(behind);
    let end = offset.saturating_add(ahead).min(file_length);
    (begin, end)
}

/// Piece range for a reader window, clamped to the file's last byte.
pub fn window_to_range(file: &FileEntry, begin: u64, end: u64, piece_length: u64) -> Range {
    let last_byte = file.length.saturating_sub(1);
    Range::new(
        piece_index(file, begin.min(last_byte), piece_length),
        piece_index(file, end.min(last_byte), piece_length),
        file.clone(),
    )
}

/// Sorts by `(start, end)` and coalesces overlapping or adjacent ranges.
///
/// The file of the first range in each merged run is kept.
pub fn merge_ranges(mut ranges: Vec<Range>) -> Vec<Range> {
    if ranges.len() <= 1 {
        return ranges;
    }
    ranges.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));

    let mut merged: Vec<Range> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if last.end.saturating_add(1) >= range.start => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Whether `id` falls inside any of `ranges`.
pub fn in_ranges(ranges: &[Range], id: usize) -> bool {
    ranges.iter().any(|r| r.contains(id))
}

/// Inclusive piece spans covering the head and tail blocks of `file`.
pub fn boundary_pieces(file: &FileEntry, piece_length: u64) -> [(usize, usize); 2] {
    let span = piece_length.max(FILE_BOUNDARY_BYTES).min(file.length);
    let last_byte = file.length.saturating_sub(1);

    let head = (
        piece_index(file, 0, piece_length),
        piece_index(file, span.saturating_sub(1), piece_length),
    );
    let tail = (
        piece_index(file, file.length - span, piece_length),
        piece_index(file, last_byte, piece_length),
    );
    [head, tail]
}

/// Whether `id` lies in the head or tail block of any of `files`.
pub fn in_file_boundary<'a>(
    files: impl IntoIterator<Item = &'a FileEntry>,
    piece_length: u64,
    id: usize,
) -> bool {
    files.into_iter().any(|file| {
        boundary_pieces(file, piece_length)
            .iter()
            .any(|&(start, end)| id >= start && id <= end)
    })
}

/// Tier a piece at or after `reader_piece` deserves.
///
/// `readahead_piece` is the piece holding the last byte of the reader's
/// readahead window.
pub fn priority_tier(index: usize, reader_piece: usize, readahead_piece: usize) -> PiecePriority {
    if index == reader_piece {
        PiecePriority::Now
    } else if index == reader_piece + 1 {
        PiecePriority::Next
    } else if index > reader_piece && index <= readahead_piece {
        PiecePriority::Readahead
    } else if index > readahead_piece && index <= readahead_piece + HIGH_PRIORITY_PIECES {
        PiecePriority::High
    } else {
        PiecePriority::Normal
    }
}

/// Priority to push given the engine's current one, or `None` to leave it.
///
/// `High` and `Normal` never lower a piece that another reader already raised.
pub fn next_priority(current: PiecePriority, tier: PiecePriority) -> Option<PiecePriority> {
    match tier {
        PiecePriority::High | PiecePriority::Normal if current >= tier => None,
        _ if current == tier => None,
        _ => Some(tier),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const MIB: u64 = 1 << 20;

    fn file(offset: u64, length: u64) -> FileEntry {
        FileEntry {
            index: 0,
            path: "movie.mkv".to_string(),
            offset,
            length,
        }
    }

    fn span(start: usize, end: usize) -> Range {
        Range::new(start, end, file(0, 100 * MIB))
    }

    fn bounds(ranges: &[Range]) -> Vec<(usize, usize)> {
        ranges.iter().map(|r| (r.start, r.end)).collect()
    }

    #[test]
    fn test_merge_overlapping_ranges() {
        let merged = merge_ranges(vec![span(10, 12), span(3, 8), span(0, 5)]);
        assert_eq!(bounds(&merged), vec![(0, 8), (10, 12)]);
    }

    #[test]
    fn test_merge_adjacent_ranges() {
        let merged = merge_ranges(vec![span(0, 4), span(5, 7)]);
        assert_eq!(bounds(&merged), vec![(0, 7)]);
    }

    #[test]
    fn test_merge_contained_range() {
        let merged = merge_ranges(vec![span(0, 20), span(4, 6)]);
        assert_eq!(bounds(&merged), vec![(0, 20)]);
    }

    #[test]
    fn test_in_ranges_is_inclusive() {
        let ranges = vec![span(2, 4)];
        assert!(!in_ranges(&ranges, 1));
        assert!(in_ranges(&ranges, 2));
        assert!(in_ranges(&ranges, 4));
        assert!(!in_ranges(&ranges, 5));
        assert!(!in_ranges(&[], 0));
    }

    #[test]
    fn test_reader_window_splits_share() {
        // 20 MiB shared by two readers, 90% ahead
        let (begin, end) = reader_window(50 * MIB, 100 * MIB, 20 * MIB, 2, 90);
        assert_eq!(begin, 50 * MIB - MIB);
        assert_eq!(end, 50 * MIB + 9 * MIB);
    }

    #[test]
    fn test_reader_window_clamps_to_file() {
        let (begin, end) = reader_window(MIB, 4 * MIB, 16 * MIB, 1, 50);
        assert_eq!(begin, 0);
        assert_eq!(end, 4 * MIB);
    }

    #[test]
    fn test_window_to_range_accounts_for_file_offset() {
        let f = file(3 * MIB, 10 * MIB);
        let range = window_to_range(&f, 0, 10 * MIB, MIB);
        assert_eq!((range.start, range.end), (3, 12));
    }

    #[test]
    fn test_boundary_pieces_small_pieces() {
        // 1 MiB pieces: head and tail are 8 pieces each
        let f = file(0, 100 * MIB);
        assert_eq!(boundary_pieces(&f, MIB), [(0, 7), (92, 99)]);
    }

    #[test]
    fn test_boundary_pieces_large_pieces() {
        // 16 MiB pieces: a single piece at each end
        let f = file(0, 160 * MIB);
        assert_eq!(boundary_pieces(&f, 16 * MIB), [(0, 0), (9, 9)]);
    }

    #[test]
    fn test_boundary_pieces_unaligned_file() {
        let f = file(3 * MIB + 512, 20 * MIB);
        let [head, tail] = boundary_pieces(&f, MIB);
        assert_eq!(head, (3, 11));
        assert_eq!(tail, (15, 23));
    }

    #[test]
    fn test_boundary_short_file_fully_protected() {
        let f = file(0, 2 * MIB);
        for id in 0..2 {
            assert!(in_file_boundary([&f], MIB, id));
        }
        assert!(!in_file_boundary([&f], MIB, 2));
    }

    #[test]
    fn test_priority_tiers_around_reader() {
        // reader at piece 10, readahead reaching piece 14
        assert_eq!(priority_tier(10, 10, 14), PiecePriority::Now);
        assert_eq!(priority_tier(11, 10, 14), PiecePriority::Next);
        for id in 12..=14 {
            assert_eq!(priority_tier(id, 10, 14), PiecePriority::Readahead);
        }
        for id in 15..=19 {
            assert_eq!(priority_tier(id, 10, 14), PiecePriority::High);
        }
        for id in 20..30 {
            assert_eq!(priority_tier(id, 10, 14), PiecePriority::Normal);
        }
    }

    #[test]
    fn test_next_priority_does_not_downgrade() {
        assert_eq!(
            next_priority(PiecePriority::Now, PiecePriority::High),
            None
        );
        assert_eq!(
            next_priority(PiecePriority::High, PiecePriority::Normal),
            None
        );
        assert_eq!(
            next_priority(PiecePriority::None, PiecePriority::Normal),
            Some(PiecePriority::Normal)
        );
        assert_eq!(
            next_priority(PiecePriority::Normal, PiecePriority::High),
            Some(PiecePriority::High)
        );
        assert_eq!(
            next_priority(PiecePriority::Now, PiecePriority::Readahead),
            Some(PiecePriority::Readahead)
        );
        assert_eq!(next_priority(PiecePriority::Now, PiecePriority::Now), None);
    }

    proptest! {
        #[test]
        fn prop_merge_preserves_coverage(raw in prop::collection::vec((0usize..200, 0usize..20), 0..12)) {
            let ranges: Vec<Range> = raw.iter().map(|&(s, len)| span(s, s + len)).collect();
            let merged = merge_ranges(ranges.clone());

            for id in 0..240 {
                prop_assert_eq!(in_ranges(&ranges, id), in_ranges(&merged, id));
            }
            for pair in merged.windows(2) {
                prop_assert!(pair[0].end + 1 < pair[1].start);
            }
        }
    }
}
