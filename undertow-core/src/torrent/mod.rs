//! Torrent lifecycle on top of the swarm engine.
//!
//! A [`Torrent`] wraps one engine handle: it waits for metadata, attaches the
//! piece cache, samples transfer speeds on a ticker, hands out readers and
//! expires once nobody has been reading for a while.

pub mod catalog;
pub mod preload;
pub mod server;

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

pub use catalog::{CatalogEntry, MemoryCatalog, TorrentCatalog};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
pub use server::TorrentServer;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::UndertowConfig;
use crate::storage::{Cache, CacheState, Reader, Storage, StorageError};
use crate::swarm::{
    FileEntry, InfoHash, SwarmError, SwarmTorrent, TorrentInfo, TorrentSpec, TransferStats,
};

/// Expiry extension granted on creation and on every lookup.
const LOOKUP_GRACE: Duration = Duration::from_secs(60);
/// Expiry extension granted when metadata arrives.
const INFO_GRACE: Duration = Duration::from_secs(5 * 60);

/// Lifecycle state of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TorrentStat {
    Added,
    GettingInfo,
    Preload,
    Working,
    Closed,
    /// Known only from the catalog, not attached to the engine.
    InDb,
}

impl fmt::Display for TorrentStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TorrentStat::Added => "Torrent added",
            TorrentStat::GettingInfo => "Torrent getting info",
            TorrentStat::Preload => "Torrent preload",
            TorrentStat::Working => "Torrent working",
            TorrentStat::Closed => "Torrent closed",
            TorrentStat::InDb => "Torrent in db",
        };
        f.write_str(label)
    }
}

/// Errors raised by the torrent lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Metadata for torrent {info_hash} did not arrive in time")]
    MetadataTimeout { info_hash: InfoHash },

    #[error("Torrent {info_hash} is closed")]
    Closed { info_hash: InfoHash },

    #[error("Torrent {info_hash} has no metadata yet")]
    NotReady { info_hash: InfoHash },

    #[error("File {index} not found in torrent")]
    FileNotFound { index: usize },

    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("Swarm error: {0}")]
    Swarm(#[from] SwarmError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Serializable status of a torrent, live or catalog-only.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentStatus {
    pub title: String,
    pub poster: String,
    pub data: String,
    pub timestamp: i64,
    pub name: String,
    pub hash: String,
    pub stat: TorrentStat,
    pub stat_string: String,
    pub loaded_size: u64,
    pub torrent_size: u64,
    pub preloaded_bytes: u64,
    pub preload_size: u64,
    pub download_speed: f64,
    pub upload_speed: f64,
    pub total_peers: usize,
    pub active_peers: usize,
    pub connected_seeders: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bit_rate: String,
    pub duration_seconds: f64,
    pub file_stats: Vec<FileEntry>,
}

struct TorrentState {
    title: String,
    poster: String,
    data: String,
    timestamp: i64,
    size: u64,
    download_speed: f64,
    upload_speed: f64,
    preload_size: u64,
    preloaded_bytes: u64,
    bit_rate: String,
    duration_seconds: f64,
    expired_at: Instant,
    last_stats: TransferStats,
    last_sample: Instant,
}

/// One torrent attached to the swarm engine.
pub struct Torrent {
    spec: TorrentSpec,
    handle: Arc<dyn SwarmTorrent>,
    storage: Arc<Storage>,
    server: Weak<TorrentServer>,
    stat: watch::Sender<TorrentStat>,
    state: Mutex<TorrentState>,
    cache: RwLock<Option<Arc<Cache>>>,
}

impl Torrent {
    /// Wraps an engine handle. The torrent starts in [`TorrentStat::Added`].
    pub fn new(
        spec: TorrentSpec,
        handle: Arc<dyn SwarmTorrent>,
        storage: Arc<Storage>,
        server: Weak<TorrentServer>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let (stat, _) = watch::channel(TorrentStat::Added);
        let title = spec.display_name.clone().unwrap_or_default();

        Arc::new(Self {
            spec,
            handle,
            storage,
            server,
            stat,
            state: Mutex::new(TorrentState {
                title,
                poster: String::new(),
                data: String::new(),
                timestamp: chrono::Utc::now().timestamp(),
                size: 0,
                download_speed: 0.0,
                upload_speed: 0.0,
                preload_size: 0,
                preloaded_bytes: 0,
                bit_rate: String::new(),
                duration_seconds: 0.0,
                expired_at: now + LOOKUP_GRACE,
                last_stats: TransferStats::default(),
                last_sample: now,
            }),
            cache: RwLock::new(None),
        })
    }

    pub fn hash(&self) -> InfoHash {
        self.spec.info_hash
    }

    pub fn spec(&self) -> &TorrentSpec {
        &self.spec
    }

    pub fn stat(&self) -> TorrentStat {
        *self.stat.borrow()
    }

    /// Watches lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<TorrentStat> {
        self.stat.subscribe()
    }

    pub fn info(&self) -> Option<TorrentInfo> {
        self.handle.info()
    }

    pub fn cache(&self) -> Option<Arc<Cache>> {
        self.cache.read().clone()
    }

    fn config(&self) -> &UndertowConfig {
        self.storage.config()
    }

    pub fn set_catalog_fields(&self, title: &str, poster: &str, data: &str) {
        let mut state = self.state.lock();
        if !title.is_empty() {
            state.title = title.to_string();
        }
        state.poster = poster.to_string();
        state.data = data.to_string();
    }

    /// Display fields filled in by media probing and cleared after preload.
    pub fn set_media_info(&self, bit_rate: &str, duration_seconds: f64) {
        let mut state = self.state.lock();
        state.bit_rate = bit_rate.to_string();
        state.duration_seconds = duration_seconds;
    }

    /// Pushes the expiry deadline to `duration` from now.
    pub fn add_expired_time(&self, duration: Duration) {
        self.state.lock().expired_at = Instant::now() + duration;
    }

    pub(crate) fn touch(&self) {
        self.add_expired_time(LOOKUP_GRACE);
    }

    /// Starts the progress ticker.
    ///
    /// Once the engine drops the torrent the ticker stops and the torrent is
    /// torn down, open readers included.
    pub fn spawn_watch(self: &Arc<Self>) {
        let torrent = Arc::clone(self);
        let period = self.config().swarm.progress_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => torrent.progress_event(),
                    _ = torrent.handle.wait_closed() => {
                        torrent.shutdown();
                        break;
                    }
                }
            }
            debug!("Torrent {} watch stopped", torrent.hash());
        });
    }

    /// One ticker step: expiry check, speed sampling and readahead refresh.
    pub fn progress_event(&self) {
        if self.expired() {
            info!("Torrent {} expired", self.hash());
            match self.server.upgrade() {
                Some(server) => {
                    server.remove_torrent(self.hash());
                }
                None => {
                    self.close();
                }
            }
            return;
        }

        let cache = self.cache();
        let stats = self.handle.stats();
        let filled = cache.as_ref().map(|c| c.state().filled);
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_sample).as_secs_f64();
            if elapsed > 0.0 {
                state.download_speed =
                    stats.bytes_read.saturating_sub(state.last_stats.bytes_read) as f64 / elapsed;
                state.upload_speed = stats
                    .bytes_written
                    .saturating_sub(state.last_stats.bytes_written)
                    as f64
                    / elapsed;
            }
            state.last_stats = stats;
            state.last_sample = now;
            if let Some(filled) = filled {
                state.preloaded_bytes = filled;
            }
        }

        if let Some(cache) = cache {
            cache.adjust_ra(self.config().swarm.fixed_readahead);
        }
    }

    /// No readers, past the deadline and either working or closed.
    pub fn expired(&self) -> bool {
        let readers = self.cache().map_or(0, |c| c.readers_count());
        readers == 0
            && Instant::now() > self.state.lock().expired_at
            && matches!(self.stat(), TorrentStat::Working | TorrentStat::Closed)
    }

    /// Waits for metadata and attaches the cache.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MetadataTimeout` - Watchdog fired first
    /// - `TorrentError::Closed` - Engine dropped the torrent while waiting
    pub async fn wait_info(&self) -> Result<(), TorrentError> {
        let info_hash = self.hash();
        if self.cache().is_some() {
            return Ok(());
        }

        tokio::select! {
            _ = self.handle.wait_info() => {}
            _ = self.handle.wait_closed() => return Err(TorrentError::Closed { info_hash }),
            _ = tokio::time::sleep(self.config().swarm.metadata_timeout) => {
                return Err(TorrentError::MetadataTimeout { info_hash });
            }
        }

        let info = self.handle.info().ok_or(TorrentError::NotReady { info_hash })?;
        let cache = self
            .storage
            .get_cache(info_hash)
            .unwrap_or_else(|| self.storage.open_torrent(&info, info_hash));
        cache.set_torrent(Arc::clone(&self.handle));
        *self.cache.write() = Some(cache);

        let mut state = self.state.lock();
        state.size = info.length();
        if state.title.is_empty() {
            state.title = info.name.clone();
        }
        Ok(())
    }

    /// Drives `Added -> GettingInfo -> Working`, closing the torrent on failure.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Closed` - Torrent already closed
    /// - `TorrentError::MetadataTimeout` - Metadata never arrived
    pub async fn got_info(&self) -> Result<(), TorrentError> {
        let info_hash = self.hash();
        let started = self.stat.send_if_modified(|stat| match stat {
            TorrentStat::Closed => false,
            TorrentStat::Added | TorrentStat::InDb => {
                *stat = TorrentStat::GettingInfo;
                true
            }
            _ => false,
        });
        if !started && self.stat() == TorrentStat::Closed {
            return Err(TorrentError::Closed { info_hash });
        }

        match self.wait_info().await {
            Ok(()) => {
                self.stat.send_if_modified(|stat| {
                    if *stat == TorrentStat::GettingInfo {
                        *stat = TorrentStat::Working;
                        true
                    } else {
                        false
                    }
                });
                self.add_expired_time(INFO_GRACE);
                info!("Torrent {info_hash} working");
                Ok(())
            }
            Err(e) => {
                info!("Torrent {info_hash} failed to get info: {e}");
                self.shutdown();
                Err(e)
            }
        }
    }

    /// Opens a reader over file `index`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Closed` - Torrent closed
    /// - `TorrentError::NotReady` - Metadata not attached yet
    /// - `TorrentError::FileNotFound` - No such file
    /// - `TorrentError::Swarm` - Engine refused to open the stream
    pub fn new_reader(&self, index: usize) -> Result<Arc<Reader>, TorrentError> {
        let info_hash = self.hash();
        if self.stat() == TorrentStat::Closed {
            return Err(TorrentError::Closed { info_hash });
        }
        let cache = self.cache().ok_or(TorrentError::NotReady { info_hash })?;
        let file = self
            .handle
            .info()
            .and_then(|info| info.file(index).cloned())
            .ok_or(TorrentError::FileNotFound { index })?;

        let stream = self.handle.open_file(index)?;
        let reader = cache.new_reader(file, stream);
        reader.set_readahead(self.config().swarm.fixed_readahead);
        Ok(reader)
    }

    /// Closes `reader` and keeps the torrent alive for the disconnect timeout.
    pub async fn close_reader(&self, reader: &Reader) {
        reader.close().await;
        self.add_expired_time(self.config().swarm.disconnect_timeout);
    }

    /// Drops the torrent from the engine. Refused while readers are open.
    pub fn close(&self) -> bool {
        if self.cache().is_some_and(|c| c.readers_count() > 0) {
            return false;
        }
        self.shutdown();
        true
    }

    /// Closes regardless of open readers.
    pub(crate) fn shutdown(&self) {
        let previous = self.stat.send_replace(TorrentStat::Closed);
        let info_hash = self.hash();

        if let Some(server) = self.server.upgrade() {
            server.forget(info_hash, self);
        }
        if !self.handle.is_closed() {
            self.handle.drop_torrent();
        }
        let cache = self.cache.write().take();
        match cache {
            Some(cache) => cache.close(),
            None => self.storage.close_hash(info_hash),
        }

        if previous != TorrentStat::Closed {
            info!("Torrent {info_hash} closed");
        }
    }

    pub fn status(&self) -> TorrentStatus {
        let stat = self.stat();
        let stats = self.handle.stats();
        let loaded_size = self.handle.bytes_completed();
        let info = self.handle.info();
        let name = info
            .as_ref()
            .map(|i| i.name.clone())
            .or_else(|| self.spec.display_name.clone())
            .unwrap_or_else(|| self.hash().to_hex());
        let file_stats = info.map(|i| i.files).unwrap_or_default();

        let state = self.state.lock();
        TorrentStatus {
            title: state.title.clone(),
            poster: state.poster.clone(),
            data: state.data.clone(),
            timestamp: state.timestamp,
            name,
            hash: self.hash().to_hex(),
            stat,
            stat_string: stat.to_string(),
            loaded_size,
            torrent_size: state.size,
            preloaded_bytes: state.preloaded_bytes,
            preload_size: state.preload_size,
            download_speed: state.download_speed,
            upload_speed: state.upload_speed,
            total_peers: stats.total_peers,
            active_peers: stats.active_peers,
            connected_seeders: stats.connected_seeders,
            bytes_read: stats.bytes_read,
            bytes_written: stats.bytes_written,
            bit_rate: state.bit_rate.clone(),
            duration_seconds: state.duration_seconds,
            file_stats,
        }
    }

    /// Cache snapshot with this torrent's status embedded.
    pub fn cache_state(&self) -> Option<CacheState> {
        let mut state = self.cache()?.state();
        state.torrent = Some(self.status());
        Some(state)
    }
}
