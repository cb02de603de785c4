//! Bounded per-torrent piece cache.
//!
//! Holds one [`Piece`] per index and keeps the bytes held under a capacity by
//! evicting the least recently used pieces that no active reader needs. The same
//! pass turns reader positions into fetch priorities for the swarm engine.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::piece::{BackingKind, Piece, PieceStorage, UnknownPiece};
use super::range::{self, Range};
use super::reader::{Reader, ReaderId};
use super::state::{CacheState, ItemState, ReaderState};
use crate::config::UndertowConfig;
use crate::swarm::{FileEntry, FileStream, InfoHash, PiecePriority, SwarmTorrent, TorrentInfo};

/// Shared `hash -> cache` map owned by [`super::Storage`].
pub(crate) type CacheRegistry = Mutex<HashMap<InfoHash, Arc<Cache>>>;

/// Reader position captured at the start of a pass.
struct ActiveReader {
    range: Range,
    reader_piece: usize,
    readahead_piece: usize,
}

/// Piece cache for one torrent.
pub struct Cache {
    hash: InfoHash,
    piece_length: u64,
    piece_count: usize,
    config: Arc<UndertowConfig>,
    capacity: AtomicU64,
    filled: AtomicU64,
    piece_dir: Option<PathBuf>,
    pieces: RwLock<Vec<Arc<Piece>>>,
    readers: Mutex<HashMap<ReaderId, Arc<Reader>>>,
    torrent: RwLock<Option<Arc<dyn SwarmTorrent>>>,
    /// A background pass is queued or running; further triggers are dropped.
    cleaning: AtomicBool,
    /// Serializes passes, background or explicit.
    pass_lock: Mutex<()>,
    closed: AtomicBool,
    registry: Weak<CacheRegistry>,
    runtime: Option<tokio::runtime::Handle>,
    this: Weak<Cache>,
}

impl Cache {
    /// Creates a cache that is not part of any registry.
    pub fn new(info: &TorrentInfo, hash: InfoHash, config: Arc<UndertowConfig>) -> Arc<Self> {
        Self::with_registry(info, hash, config, Weak::new())
    }

    pub(crate) fn with_registry(
        info: &TorrentInfo,
        hash: InfoHash,
        config: Arc<UndertowConfig>,
        registry: Weak<CacheRegistry>,
    ) -> Arc<Self> {
        let piece_length = info.piece_length.max(1);
        let capacity = match config.cache.cache_size {
            0 => piece_length * 4,
            size => size,
        };

        let piece_dir = config
            .cache
            .use_disk
            .then(|| config.cache.save_path.join(hash.to_hex()));
        let kind = match &piece_dir {
            Some(dir) => {
                if let Err(e) = fs::create_dir_all(dir) {
                    warn!("Error create piece dir {}: {e}", dir.display());
                }
                BackingKind::Disk(dir.clone())
            }
            None => BackingKind::Memory,
        };

        let cache = Arc::new_cyclic(|this: &Weak<Cache>| {
            let pieces = (0..info.piece_count)
                .map(|id| Arc::new(Piece::new(id, piece_length, &kind, this.clone())))
                .collect();
            Self {
                hash,
                piece_length,
                piece_count: info.piece_count,
                config,
                capacity: AtomicU64::new(capacity),
                filled: AtomicU64::new(0),
                piece_dir,
                pieces: RwLock::new(pieces),
                readers: Mutex::new(HashMap::new()),
                torrent: RwLock::new(None),
                cleaning: AtomicBool::new(false),
                pass_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
                registry,
                runtime: tokio::runtime::Handle::try_current().ok(),
                this: this.clone(),
            }
        });

        let recovered: u64 = cache.pieces.read().iter().map(|p| p.size()).sum();
        cache.filled.store(recovered, Ordering::Relaxed);
        info!(
            "Cache {hash} opened: {} pieces of {piece_length} bytes, capacity {capacity}",
            info.piece_count
        );
        cache
    }

    pub fn hash(&self) -> InfoHash {
        self.hash
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Bytes held as of the last pass or snapshot.
    pub fn filled(&self) -> u64 {
        self.filled.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn readahead_percent(&self) -> u64 {
        self.config.cache.reader_readahead_percent
    }

    /// Storage for piece `index`, or a stub failing every call.
    pub fn piece(&self, index: usize) -> Arc<dyn PieceStorage> {
        match self.pieces.read().get(index) {
            Some(piece) => Arc::clone(piece) as Arc<dyn PieceStorage>,
            None => Arc::new(UnknownPiece),
        }
    }

    /// Attaches the engine handle receiving priority directives.
    pub fn set_torrent(&self, torrent: Arc<dyn SwarmTorrent>) {
        *self.torrent.write() = Some(torrent);
    }

    pub fn torrent(&self) -> Option<Arc<dyn SwarmTorrent>> {
        self.torrent.read().clone()
    }

    /// Registers a reader over `file` backed by the engine's `stream`.
    pub fn new_reader(&self, file: FileEntry, stream: Box<dyn FileStream>) -> Arc<Reader> {
        let reader = Arc::new(Reader::new(file, stream, self.this.clone()));
        self.readers.lock().insert(reader.id(), Arc::clone(&reader));
        debug!("Cache {}: reader {} opened", self.hash, reader.id());
        reader
    }

    /// Deregisters and closes `reader`, then schedules a pass.
    pub async fn close_reader(&self, reader: &Reader) {
        self.readers.lock().remove(&reader.id());
        reader.shutdown().await;
        debug!("Cache {}: reader {} closed", self.hash, reader.id());
        self.schedule_clean();
    }

    /// Registered readers, idle ones included.
    pub fn readers(&self) -> Vec<Arc<Reader>> {
        self.readers.lock().values().cloned().collect()
    }

    pub fn readers_count(&self) -> usize {
        self.readers.lock().len()
    }

    pub fn active_readers(&self) -> usize {
        self.readers.lock().values().filter(|r| r.is_active()).count()
    }

    /// Pushes `readahead` to every reader; resizes an auto-sized cache to 3x it.
    pub fn adjust_ra(&self, readahead: u64) {
        if self.config.cache.cache_size == 0 {
            self.capacity.store(readahead * 3, Ordering::Relaxed);
        }
        for reader in self.readers() {
            reader.set_readahead(readahead);
        }
    }

    /// Queues a background pass unless one is already pending.
    pub fn schedule_clean(&self) {
        if self.is_closed() {
            return;
        }
        if self
            .cleaning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(cache) = self.this.upgrade() else {
            self.cleaning.store(false, Ordering::Release);
            return;
        };

        let task = move || {
            cache.run_pass();
            cache.cleaning.store(false, Ordering::Release);
        };
        match &self.runtime {
            Some(handle) => {
                handle.spawn_blocking(task);
            }
            None => {
                std::thread::spawn(task);
            }
        }
    }

    /// Runs an eviction and priority pass now, returning evicted piece indices.
    pub fn clean_pieces(&self) -> Vec<usize> {
        self.run_pass()
    }

    fn run_pass(&self) -> Vec<usize> {
        let _pass = self.pass_lock.lock();
        if self.is_closed() {
            return Vec::new();
        }

        let capacity = self.capacity();
        let pieces: Vec<Arc<Piece>> = self.pieces.read().clone();
        let readers = self.collect_readers(capacity);

        let mut files: Vec<&FileEntry> = Vec::new();
        for reader in &readers {
            if !files.iter().any(|f| f.index == reader.range.file.index) {
                files.push(&reader.range.file);
            }
        }
        let ranges = range::merge_ranges(readers.iter().map(|r| r.range.clone()).collect());

        let mut filled = 0u64;
        let mut candidates = Vec::new();
        for piece in &pieces {
            let snapshot = piece.snapshot();
            if snapshot.size == 0 {
                continue;
            }
            filled += snapshot.size;
            if !range::in_ranges(&ranges, snapshot.id)
                && !range::in_file_boundary(files.iter().copied(), self.piece_length, snapshot.id)
            {
                candidates.push((snapshot.accessed, Arc::clone(piece)));
            }
        }
        candidates.sort_by_key(|(accessed, _)| *accessed);

        let mut evicted = Vec::new();
        if filled > capacity {
            let to_free = (filled - capacity).div_ceil(self.piece_length) as usize;
            for (_, piece) in candidates.into_iter().take(to_free) {
                filled = filled.saturating_sub(piece.release());
                evicted.push(piece.id());
            }
            debug!(
                "Cache {}: evicted {:?}, filled {filled}/{capacity}",
                self.hash, evicted
            );
        }
        self.filled.store(filled, Ordering::Relaxed);

        if let Some(torrent) = self.torrent() {
            self.clear_priority(torrent.as_ref(), &ranges);
            self.set_load_priority(torrent.as_ref(), &readers, &pieces);
        }
        evicted
    }

    /// Demotes idle readers and captures the position of the active ones.
    fn collect_readers(&self, capacity: u64) -> Vec<ActiveReader> {
        let readers = self.readers();
        let idle_timeout = self.config.swarm.reader_idle_timeout;
        for reader in &readers {
            reader.check_idle(readers.len(), idle_timeout);
        }

        let active: Vec<_> = readers.into_iter().filter(|r| r.is_active()).collect();
        let count = active.len();
        active
            .iter()
            .map(|reader| ActiveReader {
                range: reader.range_with(
                    capacity,
                    count,
                    self.readahead_percent(),
                    self.piece_length,
                ),
                reader_piece: reader.reader_piece(self.piece_length),
                readahead_piece: reader.readahead_piece(self.piece_length),
            })
            .collect()
    }

    fn clear_priority(&self, torrent: &dyn SwarmTorrent, ranges: &[Range]) {
        for id in 0..self.piece_count {
            if !range::in_ranges(ranges, id) && torrent.piece_priority(id) != PiecePriority::None {
                torrent.set_piece_priority(id, PiecePriority::None);
            }
        }
    }

    fn set_load_priority(
        &self,
        torrent: &dyn SwarmTorrent,
        readers: &[ActiveReader],
        pieces: &[Arc<Piece>],
    ) {
        if readers.is_empty() {
            return;
        }
        let budget = (self.config.swarm.connections_limit / readers.len()).max(1);

        for reader in readers {
            let last = reader.range.end.min(self.piece_count.saturating_sub(1));
            let mut queued = 0;
            for id in reader.reader_piece..=last {
                if queued >= budget {
                    break;
                }
                if pieces.get(id).is_some_and(|p| p.is_complete()) {
                    continue;
                }
                let tier = range::priority_tier(id, reader.reader_piece, reader.readahead_piece);
                if let Some(priority) = range::next_priority(torrent.piece_priority(id), tier) {
                    torrent.set_piece_priority(id, priority);
                }
                queued += 1;
            }
        }
    }

    /// Snapshot of capacity, held pieces and active reader windows.
    pub fn state(&self) -> CacheState {
        let torrent = self.torrent();
        let pieces: Vec<Arc<Piece>> = self.pieces.read().clone();

        let mut filled = 0;
        let mut items = BTreeMap::new();
        for piece in &pieces {
            let snapshot = piece.snapshot();
            if snapshot.size == 0 {
                continue;
            }
            filled += snapshot.size;
            let priority = torrent
                .as_ref()
                .map(|t| t.piece_priority(snapshot.id))
                .unwrap_or_default();
            items.insert(
                snapshot.id,
                ItemState {
                    id: snapshot.id,
                    size: snapshot.size,
                    length: self.piece_length,
                    completed: snapshot.complete,
                    priority,
                },
            );
        }
        self.filled.store(filled, Ordering::Relaxed);

        let capacity = self.capacity();
        let active: Vec<_> = self.readers().into_iter().filter(|r| r.is_active()).collect();
        let readers = active
            .iter()
            .map(|reader| {
                let range = reader.range_with(
                    capacity,
                    active.len(),
                    self.readahead_percent(),
                    self.piece_length,
                );
                ReaderState {
                    start: range.start,
                    end: range.end,
                    reader: reader.reader_piece(self.piece_length),
                }
            })
            .collect();

        CacheState {
            hash: self.hash.to_hex(),
            capacity,
            filled,
            piece_length: self.piece_length,
            pieces_count: self.piece_count,
            pieces: items,
            readers,
            torrent: None,
        }
    }

    /// Releases every piece and reader and leaves the registry.
    ///
    /// Disk pieces stay on disk for the next session unless
    /// `remove_cache_on_drop` is set.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(registry) = self.registry.upgrade() {
            let mut caches = registry.lock();
            if caches
                .get(&self.hash)
                .is_some_and(|cache| std::ptr::eq(Arc::as_ptr(cache), self))
            {
                caches.remove(&self.hash);
            }
        }

        if self.config.cache.remove_cache_on_drop {
            if let Some(dir) = &self.piece_dir {
                let _ = fs::remove_dir_all(dir);
            }
        }

        let readers: Vec<_> = self.readers.lock().drain().map(|(_, r)| r).collect();
        for reader in readers {
            reader.detach();
        }
        self.pieces.write().clear();
        self.torrent.write().take();
        self.filled.store(0, Ordering::Relaxed);
        info!("Cache {} closed", self.hash);
    }

    #[cfg(test)]
    pub(crate) fn hold_background_passes(&self) {
        self.cleaning.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn piece_entry(&self, index: usize) -> Option<Arc<Piece>> {
        self.pieces.read().get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::io::SeekFrom;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::storage::piece::PieceError;
    use crate::swarm::test_mocks::{MockFileStream, MockSwarmTorrent, StreamProbe};

    const KIB: u64 = 1 << 10;
    const MIB: u64 = 1 << 20;

    /// Cache with background passes disabled so each test drives passes itself.
    struct CacheFixture {
        cache: Arc<Cache>,
        torrent: Arc<MockSwarmTorrent>,
        info: TorrentInfo,
    }

    impl CacheFixture {
        fn new(piece_length: u64, piece_count: usize, cache_size: u64) -> Self {
            let mut config = UndertowConfig::for_testing();
            config.cache.cache_size = cache_size;
            Self::with_config(piece_length, piece_count, config)
        }

        fn with_config(piece_length: u64, piece_count: usize, config: UndertowConfig) -> Self {
            let info = TorrentInfo {
                name: "movie".to_string(),
                piece_length,
                piece_count,
                files: vec![FileEntry {
                    index: 0,
                    path: "movie.mkv".to_string(),
                    offset: 0,
                    length: piece_length * piece_count as u64,
                }],
            };
            let hash = InfoHash::new([7u8; 20]);
            let cache = Cache::new(&info, hash, Arc::new(config));
            cache.hold_background_passes();
            let torrent = Arc::new(MockSwarmTorrent::with_info(hash, info.clone()));
            cache.set_torrent(torrent.clone());
            Self {
                cache,
                torrent,
                info,
            }
        }

        fn fill(&self, ids: &[usize]) {
            let data = vec![0xabu8; self.info.piece_length as usize];
            for &id in ids {
                let piece = self.cache.piece(id);
                piece.write_at(&data, 0).unwrap();
                piece.mark_complete().unwrap();
            }
        }

        fn set_accessed(&self, id: usize, unix: i64) {
            self.cache.piece_entry(id).unwrap().set_accessed(unix);
        }

        fn reader(&self) -> (Arc<Reader>, Arc<StreamProbe>) {
            let file = self.info.files[0].clone();
            let (stream, probe) = MockFileStream::new(vec![0u8; file.length as usize]);
            (self.cache.new_reader(file, Box::new(stream)), probe)
        }

        fn held(&self) -> Vec<usize> {
            self.cache.state().pieces.keys().copied().collect()
        }
    }

    #[test]
    fn test_new_cache_defaults_capacity_to_four_pieces() {
        let fixture = CacheFixture::new(KIB, 8, 0);
        assert_eq!(fixture.cache.capacity(), 4 * KIB);
        assert_eq!(fixture.cache.filled(), 0);
        assert_eq!(fixture.cache.piece_count(), 8);
    }

    #[test]
    fn test_unknown_index_returns_stub() {
        let fixture = CacheFixture::new(KIB, 4, 4 * KIB);
        let mut buf = [0u8; 4];
        assert!(matches!(
            fixture.cache.piece(4).read_at(&mut buf, 0),
            Err(PieceError::UnknownPiece)
        ));
    }

    #[test]
    fn test_eviction_removes_oldest_first() {
        let fixture = CacheFixture::new(KIB, 10, 4 * KIB);
        fixture.fill(&[0, 1, 2, 3, 4, 5, 6]);
        for (id, accessed) in [(0, 50), (1, 40), (2, 10), (3, 60), (4, 20), (5, 70), (6, 30)] {
            fixture.set_accessed(id, accessed);
        }

        let evicted = fixture.cache.clean_pieces();

        assert_eq!(evicted, vec![2, 4, 6]);
        assert_eq!(fixture.cache.filled(), 4 * KIB);
        assert_eq!(fixture.held(), vec![0, 1, 3, 5]);
    }

    #[test]
    fn test_eviction_frees_partial_overflow_with_whole_pieces() {
        let fixture = CacheFixture::new(KIB, 10, 4 * KIB);
        fixture.fill(&[0, 1, 2, 3]);
        fixture.cache.piece(4).write_at(&[1u8; 10], 0).unwrap();
        fixture.set_accessed(4, 1);

        assert_eq!(fixture.cache.clean_pieces().len(), 1);
        assert!(fixture.cache.filled() <= fixture.cache.capacity());
    }

    #[test]
    fn test_released_pieces_are_reset_in_engine() {
        let fixture = CacheFixture::new(KIB, 6, 2 * KIB);
        fixture.fill(&[0, 1, 2]);
        fixture.torrent.set_piece_priority(0, PiecePriority::Normal);
        fixture.set_accessed(0, 1);

        assert_eq!(fixture.cache.clean_pieces(), vec![0]);
        assert_eq!(fixture.torrent.completion_checks(), vec![0]);
        assert_eq!(fixture.torrent.piece_priority(0), PiecePriority::None);
        assert!(!fixture.cache.piece(0).completion().unwrap());
    }

    #[test]
    fn test_second_pass_is_steady() {
        let fixture = CacheFixture::new(KIB, 10, 4 * KIB);
        fixture.fill(&[0, 1, 2, 3, 4, 5, 6, 7]);

        assert_eq!(fixture.cache.clean_pieces().len(), 4);
        assert!(fixture.cache.clean_pieces().is_empty());
    }

    #[tokio::test]
    async fn test_pass_protects_reader_window_and_file_boundaries() {
        let fixture = CacheFixture::new(MIB, 32, 4 * MIB);
        let (reader, _) = fixture.reader();
        reader.seek(SeekFrom::Start(16 * MIB)).await.unwrap();

        // window covers 15..=19, boundaries cover 0..=7 and 24..=31
        fixture.fill(&[0, 8, 10, 12, 15, 16, 17, 25, 31]);
        for (id, accessed) in [(8, 30), (10, 20), (12, 10)] {
            fixture.set_accessed(id, accessed);
        }
        for id in [0, 15, 16, 17, 25, 31] {
            fixture.set_accessed(id, 1);
        }

        let evicted = fixture.cache.clean_pieces();

        assert_eq!(evicted, vec![12, 10, 8]);
        assert_eq!(fixture.held(), vec![0, 15, 16, 17, 25, 31]);
        assert!(fixture.cache.filled() > fixture.cache.capacity());
        assert!(fixture.cache.clean_pieces().is_empty());
    }

    /// Four pieces of room and a reader at the start of the file. The head
    /// boundary block (pieces 0..=7) is larger than the capacity, so pieces
    /// written near the start are never evicted and the cache stays over
    /// capacity until the reader moves past the block.
    #[tokio::test]
    async fn test_head_boundary_block_outweighs_small_capacity() {
        let fixture = CacheFixture::new(MIB, 24, 4 * MIB);
        let (reader, _) = fixture.reader();
        reader.seek(SeekFrom::Start(0)).await.unwrap();
        let written: Vec<usize> = (0..=6).collect();
        fixture.fill(&written);
        for &id in &written {
            fixture.set_accessed(id, 10 + id as i64);
        }

        let evicted = fixture.cache.clean_pieces();

        assert!(evicted.is_empty());
        assert_eq!(fixture.cache.filled(), 7 * MIB);
        assert_eq!(fixture.held(), written);
    }

    #[tokio::test]
    async fn test_sequential_reader_evicts_oldest_pieces_behind_it() {
        let fixture = CacheFixture::new(MIB, 24, 4 * MIB);
        let (reader, _) = fixture.reader();
        reader.seek(SeekFrom::Start(14 * MIB)).await.unwrap();

        // window covers 13..=17, tail block covers 16..=23
        fixture.fill(&[8, 9, 10, 11, 12, 13, 14, 23]);
        for id in 8..=14 {
            fixture.set_accessed(id, id as i64);
        }
        fixture.set_accessed(23, 1);

        let evicted = fixture.cache.clean_pieces();

        assert_eq!(evicted, vec![8, 9, 10, 11]);
        assert_eq!(fixture.held(), vec![12, 13, 14, 23]);
        assert_eq!(fixture.cache.filled(), 4 * MIB);
    }

    #[tokio::test]
    async fn test_priority_tiers_follow_reader() {
        let fixture = CacheFixture::new(MIB, 40, 40 * MIB);
        let (reader, _) = fixture.reader();
        reader.seek(SeekFrom::Start(10 * MIB)).await.unwrap();
        reader.set_readahead(4 * MIB);

        fixture.cache.clean_pieces();
        let priorities = fixture.torrent.priorities();

        assert_eq!(priorities.get(&10), Some(&PiecePriority::Now));
        assert_eq!(priorities.get(&11), Some(&PiecePriority::Next));
        for id in 12..=14 {
            assert_eq!(priorities.get(&id), Some(&PiecePriority::Readahead));
        }
        for id in 15..=19 {
            assert_eq!(priorities.get(&id), Some(&PiecePriority::High));
        }
        for id in 20..=34 {
            assert_eq!(priorities.get(&id), Some(&PiecePriority::Normal));
        }
        // 25 connections for one reader
        assert_eq!(priorities.get(&35), None);
    }

    #[tokio::test]
    async fn test_priority_skips_complete_pieces() {
        let fixture = CacheFixture::new(MIB, 40, 40 * MIB);
        let (reader, _) = fixture.reader();
        reader.seek(SeekFrom::Start(10 * MIB)).await.unwrap();
        fixture.fill(&[11]);

        fixture.cache.clean_pieces();

        assert_eq!(fixture.torrent.priorities().get(&11), None);
        assert_eq!(
            fixture.torrent.piece_priority(10),
            PiecePriority::Now
        );
    }

    #[test]
    fn test_pieces_outside_ranges_are_demoted() {
        let fixture = CacheFixture::new(KIB, 8, 4 * KIB);
        fixture.torrent.set_piece_priority(5, PiecePriority::Now);

        fixture.cache.clean_pieces();

        assert_eq!(fixture.torrent.piece_priority(5), PiecePriority::None);
    }

    #[tokio::test]
    async fn test_idle_reader_round_trip() {
        let fixture = CacheFixture::new(MIB, 40, 8 * MIB);
        let (a, probe_a) = fixture.reader();
        let (b, _) = fixture.reader();
        a.seek(SeekFrom::Start(20 * MIB)).await.unwrap();
        a.set_readahead(2 * MIB);
        b.seek(SeekFrom::Start(2 * MIB)).await.unwrap();

        a.backdate(61);
        fixture.cache.clean_pieces();

        assert!(!a.is_active());
        assert_eq!(a.readahead(), 0);
        assert_eq!(probe_a.readahead.load(Ordering::SeqCst), 0);
        assert_eq!(probe_a.position.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.cache.active_readers(), 1);
        let windows = fixture.cache.state().readers;
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].reader, 2);

        let mut buf = vec![0u8; 1024];
        a.read(&mut buf).await.unwrap();

        assert!(a.is_active());
        assert_eq!(a.readahead(), 2 * MIB);
        assert_eq!(probe_a.readahead.load(Ordering::SeqCst), 2 * MIB);
        assert_eq!(a.offset(), 20 * MIB + 1024);
        assert_eq!(probe_a.position.load(Ordering::SeqCst), 20 * MIB + 1024);
        assert_eq!(fixture.cache.state().readers.len(), 2);
    }

    #[tokio::test]
    async fn test_lone_reader_stays_active() {
        let fixture = CacheFixture::new(MIB, 16, 8 * MIB);
        let (reader, _) = fixture.reader();
        reader.backdate(3600);

        fixture.cache.clean_pieces();

        assert!(reader.is_active());
    }

    #[tokio::test]
    async fn test_reader_window_shares_capacity() {
        let fixture = CacheFixture::new(MIB, 100, 20 * MIB);
        let (a, _) = fixture.reader();
        let (b, _) = fixture.reader();
        a.seek(SeekFrom::Start(50 * MIB)).await.unwrap();
        b.seek(SeekFrom::Start(10 * MIB)).await.unwrap();

        let range = a.pieces_range().unwrap();
        // 10 MiB share, 95% ahead
        assert_eq!(range.start, 49);
        assert_eq!(range.end, 59);
    }

    #[tokio::test]
    async fn test_close_reader_deregisters() {
        let fixture = CacheFixture::new(KIB, 8, 4 * KIB);
        let (reader, probe) = fixture.reader();
        assert_eq!(fixture.cache.readers_count(), 1);

        reader.close().await;

        assert_eq!(fixture.cache.readers_count(), 0);
        assert!(probe.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_adjust_ra_resizes_auto_capacity() {
        let fixture = CacheFixture::new(MIB, 16, 0);
        let (reader, probe) = fixture.reader();

        fixture.cache.adjust_ra(2 * MIB);

        assert_eq!(fixture.cache.capacity(), 6 * MIB);
        assert_eq!(reader.readahead(), 2 * MIB);
        assert_eq!(probe.readahead.load(Ordering::SeqCst), 2 * MIB);
    }

    #[test]
    fn test_adjust_ra_keeps_configured_capacity() {
        let fixture = CacheFixture::new(MIB, 16, 8 * MIB);
        fixture.cache.adjust_ra(16 * MIB);
        assert_eq!(fixture.cache.capacity(), 8 * MIB);
    }

    #[test]
    fn test_state_reports_held_pieces() {
        let fixture = CacheFixture::new(KIB, 8, 8 * KIB);
        fixture.fill(&[1, 3]);
        fixture.torrent.set_piece_priority(3, PiecePriority::High);

        let state = fixture.cache.state();

        assert_eq!(state.hash, InfoHash::new([7u8; 20]).to_hex());
        assert_eq!(state.filled, 2 * KIB);
        assert_eq!(state.pieces_count, 8);
        assert_eq!(state.pieces.len(), 2);
        let item = &state.pieces[&3];
        assert!(item.completed);
        assert_eq!(item.length, KIB);
        assert_eq!(item.priority, PiecePriority::High);
    }

    #[test]
    fn test_close_releases_everything() {
        let fixture = CacheFixture::new(KIB, 8, 8 * KIB);
        fixture.fill(&[0, 1]);
        let (reader, probe) = fixture.reader();

        fixture.cache.close();

        assert!(fixture.cache.is_closed());
        assert!(reader.is_closed());
        assert!(probe.closed.load(Ordering::SeqCst));
        assert_eq!(fixture.cache.readers_count(), 0);
        assert!(fixture.cache.torrent().is_none());
        assert!(fixture.cache.clean_pieces().is_empty());
        let mut buf = [0u8; 1];
        assert!(matches!(
            fixture.cache.piece(0).read_at(&mut buf, 0),
            Err(PieceError::UnknownPiece)
        ));
        // closing does not touch engine priorities
        assert!(fixture.torrent.completion_checks().is_empty());
    }

    #[test]
    fn test_disk_cache_resumes_and_removes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = UndertowConfig::for_testing();
        config.cache.use_disk = true;
        config.cache.save_path = dir.path().to_path_buf();
        config.cache.cache_size = 16 * KIB;

        let first = CacheFixture::with_config(KIB, 8, config.clone());
        first.fill(&[2]);
        first.cache.piece(3).write_at(&[1u8; 100], 0).unwrap();
        first.cache.close();

        let piece_dir = dir.path().join(InfoHash::new([7u8; 20]).to_hex());
        assert!(piece_dir.join("2").exists());

        config.cache.remove_cache_on_drop = true;
        let second = CacheFixture::with_config(KIB, 8, config);
        assert_eq!(second.cache.filled(), KIB + 100);
        assert!(second.cache.piece(2).completion().unwrap());
        assert!(!second.cache.piece(3).completion().unwrap());

        second.cache.close();
        assert!(!piece_dir.exists());
    }

    #[test]
    fn test_background_pass_evicts_after_writes() {
        let info = TorrentInfo {
            name: "movie".to_string(),
            piece_length: KIB,
            piece_count: 8,
            files: Vec::new(),
        };
        let mut config = UndertowConfig::for_testing();
        config.cache.cache_size = 2 * KIB;
        let cache = Cache::new(&info, InfoHash::new([1u8; 20]), Arc::new(config));

        let data = vec![1u8; KIB as usize];
        for id in 0..6 {
            cache.piece(id).write_at(&data, 0).unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while cache.state().filled > 2 * KIB && std::time::Instant::now() < deadline {
            cache.schedule_clean();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(cache.state().filled <= 2 * KIB);
    }
}
