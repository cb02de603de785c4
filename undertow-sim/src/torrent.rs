//! Simulated engine-side torrent.
//!
//! After a metadata delay the torrent opens its cache through [`Storage`] and
//! starts downloading: always the highest-priority piece that is not complete,
//! block by block at the configured rate. Pieces nobody asked for are never
//! fetched, so what ends up in the cache is exactly what the priority pass and
//! the open streams requested.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};
use undertow_core::storage::{Cache, PieceError, Storage};
use undertow_core::swarm::{
    FileStream, InfoHash, PiecePriority, SwarmError, SwarmTorrent, TorrentInfo, TransferStats,
};

use crate::config::SimulationConfig;
use crate::content::SimulatedContent;
use crate::stream::SimulatedFileStream;

/// Torrent handle served by [`crate::SimulatedSwarm`].
pub struct SimulatedTorrent {
    info_hash: InfoHash,
    content: Option<Arc<SimulatedContent>>,
    storage: Arc<Storage>,
    config: SimulationConfig,
    info: RwLock<Option<TorrentInfo>>,
    cache: RwLock<Option<Arc<Cache>>>,
    info_ready: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    /// Bumped every time a piece completes.
    progress: watch::Sender<u64>,
    wanted: Notify,
    priorities: Mutex<HashMap<usize, PiecePriority>>,
    have: Mutex<Vec<bool>>,
    bytes_read: AtomicU64,
    bytes_completed: AtomicU64,
    this: Weak<Self>,
}

impl SimulatedTorrent {
    /// Creates the handle. Without content the torrent never gets metadata.
    pub(crate) fn new(
        info_hash: InfoHash,
        content: Option<Arc<SimulatedContent>>,
        storage: Arc<Storage>,
        config: SimulationConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            info_hash,
            content,
            storage,
            config,
            info: RwLock::new(None),
            cache: RwLock::new(None),
            info_ready: watch::channel(false).0,
            closed: watch::channel(false).0,
            progress: watch::channel(0).0,
            wanted: Notify::new(),
            priorities: Mutex::new(HashMap::new()),
            have: Mutex::new(Vec::new()),
            bytes_read: AtomicU64::new(0),
            bytes_completed: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    /// Starts the metadata and download task on the current runtime.
    pub(crate) fn start(self: &Arc<Self>) {
        let torrent = Arc::clone(self);
        tokio::spawn(async move {
            let mut closed = torrent.closed.subscribe();
            tokio::select! {
                _ = torrent.run() => {}
                _ = closed.wait_for(|c| *c) => {}
            }
            debug!("Simulated torrent {} stopped", torrent.info_hash);
        });
    }

    async fn run(&self) {
        tokio::time::sleep(self.config.metadata_delay).await;
        let Some(content) = self.content.clone() else {
            debug!("No peers have metadata for {}", self.info_hash);
            return std::future::pending().await;
        };

        let info = content.info().clone();
        let cache = self.storage.open_torrent(&info, self.info_hash);
        let have: Vec<bool> = (0..info.piece_count)
            .map(|index| matches!(cache.piece(index).completion(), Ok(true)))
            .collect();
        let recovered: u64 = have
            .iter()
            .enumerate()
            .filter(|(_, complete)| **complete)
            .map(|(index, _)| content.piece(index).len() as u64)
            .sum();
        self.bytes_completed.store(recovered, Ordering::Relaxed);
        *self.have.lock() = have;
        *self.cache.write() = Some(Arc::clone(&cache));
        *self.info.write() = Some(info);
        self.info_ready.send_replace(true);
        info!(
            "Simulated torrent {}: metadata ready, {} pieces",
            self.info_hash,
            content.info().piece_count
        );

        loop {
            match self.next_wanted(&cache) {
                Some(index) => {
                    if let Err(e) = self.download_piece(&cache, &content, index).await {
                        warn!("Simulated torrent {}: piece {index} failed: {e}", self.info_hash);
                        self.set_piece_priority(index, PiecePriority::None);
                    }
                }
                None => self.wanted.notified().await,
            }
        }
    }

    /// Highest-priority piece the cache does not hold yet.
    fn next_wanted(&self, cache: &Cache) -> Option<usize> {
        let priorities = self.priorities.lock().clone();
        priorities
            .into_iter()
            .filter(|(_, priority)| *priority > PiecePriority::None)
            .filter(|(index, _)| !matches!(cache.piece(*index).completion(), Ok(true)))
            .max_by_key(|(index, priority)| (*priority, std::cmp::Reverse(*index)))
            .map(|(index, _)| index)
    }

    async fn download_piece(
        &self,
        cache: &Cache,
        content: &SimulatedContent,
        index: usize,
    ) -> Result<(), PieceError> {
        let data = content.piece(index);
        let piece = cache.piece(index);
        let block_size = self.config.block_size.max(1);
        for (block, chunk) in data.chunks(block_size).enumerate() {
            let delay = self.config.block_delay(chunk.len());
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            piece.write_at(chunk, (block * block_size) as u64)?;
            self.bytes_read
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        piece.mark_complete()?;
        self.update_piece_completion(index);
        self.progress.send_modify(|count| *count += 1);
        debug!("Simulated torrent {}: piece {index} complete", self.info_hash);
        Ok(())
    }

    /// Cache the torrent writes into, once metadata is known.
    pub fn cache(&self) -> Option<Arc<Cache>> {
        self.cache.read().clone()
    }

    /// Asks for `index` with at least `priority`.
    pub(crate) fn request(&self, index: usize, priority: PiecePriority) {
        let raised = {
            let mut priorities = self.priorities.lock();
            let current = priorities.entry(index).or_default();
            let raised = *current < priority;
            if raised {
                *current = priority;
            }
            raised
        };
        if raised {
            self.wanted.notify_one();
        }
    }

    pub(crate) fn subscribe_progress(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    pub(crate) fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

#[async_trait]
impl SwarmTorrent for SimulatedTorrent {
    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn info(&self) -> Option<TorrentInfo> {
        self.info.read().clone()
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
        let previous = self.priorities.lock().insert(index, priority);
        if priority > previous.unwrap_or_default() {
            self.wanted.notify_one();
        }
    }

    fn update_piece_completion(&self, index: usize) {
        let Some(cache) = self.cache() else {
            return;
        };
        let complete = matches!(cache.piece(index).completion(), Ok(true));
        let length = self
            .content
            .as_ref()
            .map_or(0, |content| content.piece(index).len() as u64);

        let mut have = self.have.lock();
        let Some(slot) = have.get_mut(index) else {
            return;
        };
        if *slot != complete {
            *slot = complete;
            if complete {
                self.bytes_completed.fetch_add(length, Ordering::Relaxed);
            } else {
                self.bytes_completed.fetch_sub(length, Ordering::Relaxed);
            }
        }
    }

    fn stats(&self) -> TransferStats {
        let peers = if self.is_closed() { 0 } else { self.config.peers };
        TransferStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: 0,
            total_peers: peers,
            active_peers: peers,
            connected_seeders: peers,
        }
    }

    fn bytes_completed(&self) -> u64 {
        self.bytes_completed.load(Ordering::Relaxed)
    }

    fn open_file(&self, file_index: usize) -> Result<Box<dyn FileStream>, SwarmError> {
        if self.is_closed() {
            return Err(SwarmError::NotConnected);
        }
        let info = self.info().ok_or(SwarmError::NoMetadata)?;
        let file = info
            .file(file_index)
            .cloned()
            .ok_or(SwarmError::FileNotFound { index: file_index })?;
        let torrent = self.this.upgrade().ok_or(SwarmError::NotConnected)?;
        Ok(Box::new(SimulatedFileStream::new(
            torrent,
            file,
            info.piece_length,
        )))
    }

    fn drop_torrent(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.wanted.notify_one();
        info!("Simulated torrent {} dropped", self.info_hash);
    }
}

/// Error surfaced to streams reading a dropped torrent.
pub(crate) fn closed_error(info_hash: InfoHash) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        format!("torrent {info_hash} closed"),
    )
}
