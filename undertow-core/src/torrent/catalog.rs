//! Persisted torrent records.
//!
//! Torrents saved by the user outlive engine sessions. Until one is attached to
//! the engine again it is reported with [`TorrentStat::InDb`].

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{TorrentStat, TorrentStatus};
use crate::swarm::InfoHash;

/// Saved metadata of one torrent.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub info_hash: InfoHash,
    pub title: String,
    pub poster: String,
    pub data: String,
    pub size: u64,
    pub timestamp: i64,
}

impl CatalogEntry {
    pub fn new(info_hash: InfoHash, title: impl Into<String>) -> Self {
        Self {
            info_hash,
            title: title.into(),
            poster: String::new(),
            data: String::new(),
            size: 0,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Status of the record while it is not attached to the engine.
    pub fn status(&self) -> TorrentStatus {
        TorrentStatus {
            title: self.title.clone(),
            poster: self.poster.clone(),
            data: self.data.clone(),
            timestamp: self.timestamp,
            name: self.title.clone(),
            hash: self.info_hash.to_hex(),
            stat: TorrentStat::InDb,
            stat_string: TorrentStat::InDb.to_string(),
            loaded_size: 0,
            torrent_size: self.size,
            preloaded_bytes: 0,
            preload_size: 0,
            download_speed: 0.0,
            upload_speed: 0.0,
            total_peers: 0,
            active_peers: 0,
            connected_seeders: 0,
            bytes_read: 0,
            bytes_written: 0,
            bit_rate: String::new(),
            duration_seconds: 0.0,
            file_stats: Vec::new(),
        }
    }
}

/// Storage of saved torrent records.
pub trait TorrentCatalog: Send + Sync {
    fn get(&self, info_hash: InfoHash) -> Option<CatalogEntry>;

    /// All records, oldest first.
    fn list(&self) -> Vec<CatalogEntry>;

    /// Inserts or replaces the record for `entry.info_hash`.
    fn save(&self, entry: CatalogEntry);

    fn remove(&self, info_hash: InfoHash);
}

/// Catalog kept in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: Mutex<HashMap<InfoHash, CatalogEntry>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TorrentCatalog for MemoryCatalog {
    fn get(&self, info_hash: InfoHash) -> Option<CatalogEntry> {
        self.entries.lock().get(&info_hash).cloned()
    }

    fn list(&self) -> Vec<CatalogEntry> {
        let mut entries: Vec<_> = self.entries.lock().values().cloned().collect();
        entries.sort_by_key(|e| (e.timestamp, e.info_hash));
        entries
    }

    fn save(&self, entry: CatalogEntry) {
        self.entries.lock().insert(entry.info_hash, entry);
    }

    fn remove(&self, info_hash: InfoHash) {
        self.entries.lock().remove(&info_hash);
    }
}
