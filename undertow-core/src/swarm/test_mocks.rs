//! Mock swarm implementations for testing the cache and torrent lifecycle.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{
    FileStream, InfoHash, PiecePriority, SwarmEngine, SwarmError, SwarmTorrent, TorrentInfo,
    TorrentSpec, TransferStats,
};

/// Observable state of a [`MockFileStream`], shared with the test.
#[derive(Debug, Default)]
pub struct StreamProbe {
    pub readahead: AtomicU64,
    pub position: AtomicU64,
    pub closed: AtomicBool,
}

/// File stream over a fixed in-memory buffer. Never waits.
pub struct MockFileStream {
    data: Arc<Vec<u8>>,
    position: u64,
    fail_at: Option<u64>,
    probe: Arc<StreamProbe>,
}

impl MockFileStream {
    /// Creates a stream over `data` and returns the probe watching it.
    pub fn new(data: Vec<u8>) -> (Self, Arc<StreamProbe>) {
        let probe = Arc::new(StreamProbe::default());
        let stream = Self {
            data: Arc::new(data),
            position: 0,
            fail_at: None,
            probe: Arc::clone(&probe),
        };
        (stream, probe)
    }

    /// Makes every read starting at or past `offset` fail.
    pub fn failing_at(mut self, offset: u64) -> Self {
        self.fail_at = Some(offset);
        self
    }
}

#[async_trait]
impl FileStream for MockFileStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.fail_at.is_some_and(|limit| self.position >= limit) {
            return Err(io::Error::other("piece storage failure"));
        }
        let start = (self.position as usize).min(self.data.len());
        let end = (start + buf.len()).min(self.data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&self.data[start..end]);
        self.position += n as u64;
        self.probe.position.store(self.position, Ordering::SeqCst);
        Ok(n)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let next = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.position as i64 + delta,
            SeekFrom::End(delta) => self.data.len() as i64 + delta,
        };
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.position = next as u64;
        self.probe.position.store(self.position, Ordering::SeqCst);
        Ok(self.position)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_readahead(&mut self, bytes: u64) {
        self.probe.readahead.store(bytes, Ordering::SeqCst);
    }

    fn close(&mut self) {
        self.probe.closed.store(true, Ordering::SeqCst);
    }
}

/// Engine-side torrent handle whose behaviour is driven by the test.
pub struct MockSwarmTorrent {
    info_hash: InfoHash,
    info: Mutex<Option<TorrentInfo>>,
    content: Mutex<Vec<u8>>,
    fail_reads_at: Mutex<Option<u64>>,
    info_ready: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    priorities: Mutex<HashMap<usize, PiecePriority>>,
    completion_checks: Mutex<Vec<usize>>,
    probes: Mutex<Vec<Arc<StreamProbe>>>,
    stats: Mutex<TransferStats>,
    bytes_completed: AtomicU64,
}

impl MockSwarmTorrent {
    /// Creates a handle without metadata.
    pub fn new(info_hash: InfoHash) -> Self {
        let (info_ready, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);
        Self {
            info_hash,
            info: Mutex::new(None),
            content: Mutex::new(Vec::new()),
            fail_reads_at: Mutex::new(None),
            info_ready,
            closed,
            priorities: Mutex::new(HashMap::new()),
            completion_checks: Mutex::new(Vec::new()),
            probes: Mutex::new(Vec::new()),
            stats: Mutex::new(TransferStats::default()),
            bytes_completed: AtomicU64::new(0),
        }
    }

    /// Creates a handle that already has metadata.
    pub fn with_info(info_hash: InfoHash, info: TorrentInfo) -> Self {
        let torrent = Self::new(info_hash);
        torrent.publish_info(info);
        torrent
    }

    /// Makes metadata available and wakes `wait_info` callers.
    pub fn publish_info(&self, info: TorrentInfo) {
        *self.info.lock() = Some(info);
        self.info_ready.send_replace(true);
    }

    /// Content served by file streams, laid out in torrent byte space.
    pub fn set_content(&self, content: Vec<u8>) {
        *self.content.lock() = content;
    }

    /// Streams opened from now on fail reads at or past `offset`.
    pub fn fail_reads_at(&self, offset: u64) {
        *self.fail_reads_at.lock() = Some(offset);
    }

    pub fn set_stats(&self, stats: TransferStats) {
        *self.stats.lock() = stats;
    }

    /// Priority directives received so far.
    pub fn priorities(&self) -> HashMap<usize, PiecePriority> {
        self.priorities.lock().clone()
    }

    /// Piece indices the engine was asked to recheck, in order.
    pub fn completion_checks(&self) -> Vec<usize> {
        self.completion_checks.lock().clone()
    }

    /// Probes of every stream opened so far.
    pub fn stream_probes(&self) -> Vec<Arc<StreamProbe>> {
        self.probes.lock().clone()
    }
}

#[async_trait]
impl SwarmTorrent for MockSwarmTorrent {
    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn info(&self) -> Option<TorrentInfo> {
        self.info.lock().clone()
    }

    async fn wait_info(&self) {
        let mut rx = self.info_ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn piece_priority(&self, index: usize) -> PiecePriority {
        self.priorities
            .lock()
            .get(&index)
            .copied()
            .unwrap_or_default()
    }

    fn set_piece_priority(&self, index: usize, priority: PiecePriority) {
        self.priorities.lock().insert(index, priority);
    }

    fn update_piece_completion(&self, index: usize) {
        self.completion_checks.lock().push(index);
    }

    fn stats(&self) -> TransferStats {
        *self.stats.lock()
    }

    fn bytes_completed(&self) -> u64 {
        self.bytes_completed.load(Ordering::SeqCst)
    }

    fn open_file(&self, file_index: usize) -> Result<Box<dyn FileStream>, SwarmError> {
        let info = self.info().ok_or(SwarmError::NoMetadata)?;
        let file = info
            .file(file_index)
            .ok_or(SwarmError::FileNotFound { index: file_index })?;

        let content = self.content.lock();
        let start = (file.offset as usize).min(content.len());
        let end = (file.end() as usize).min(content.len());
        let (mut stream, probe) = MockFileStream::new(content[start..end].to_vec());
        if let Some(offset) = *self.fail_reads_at.lock() {
            stream = stream.failing_at(offset);
        }
        self.probes.lock().push(probe);
        Ok(Box::new(stream))
    }

    fn drop_torrent(&self) {
        self.closed.send_replace(true);
    }
}

/// Engine that hands out pre-registered [`MockSwarmTorrent`]s.
#[derive(Default)]
pub struct MockSwarmEngine {
    torrents: Mutex<HashMap<InfoHash, Arc<MockSwarmTorrent>>>,
    closed: AtomicBool,
}

impl MockSwarmEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handle returned for `torrent.info_hash()`.
    pub fn register(&self, torrent: Arc<MockSwarmTorrent>) {
        self.torrents.lock().insert(torrent.info_hash(), torrent);
    }

    pub fn torrent(&self, info_hash: InfoHash) -> Option<Arc<MockSwarmTorrent>> {
        self.torrents.lock().get(&info_hash).cloned()
    }
}

#[async_trait]
impl SwarmEngine for MockSwarmEngine {
    async fn add_torrent(&self, spec: &TorrentSpec) -> Result<Arc<dyn SwarmTorrent>, SwarmError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SwarmError::NotConnected);
        }
        let torrent: Arc<MockSwarmTorrent> = self
            .torrents
            .lock()
            .entry(spec.info_hash)
            .or_insert_with(|| Arc::new(MockSwarmTorrent::new(spec.info_hash)))
            .clone();
        Ok(torrent as Arc<dyn SwarmTorrent>)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
