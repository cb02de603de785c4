//! Storage layer for torrent data.
//!
//! The swarm engine asks [`Storage`] for a [`Cache`] once a torrent's metadata
//! is known and writes downloaded pieces through it. Each cache is bounded and
//! evicts pieces no active reader needs.

pub mod cache;
pub mod piece;
pub mod range;
pub mod reader;
pub mod state;

use std::collections::HashMap;
use std::sync::Arc;

pub use cache::Cache;
use cache::CacheRegistry;
use parking_lot::Mutex;
pub use piece::{PieceError, PieceStorage};
pub use range::Range;
pub use reader::{Reader, ReaderId};
pub use state::{CacheState, ItemState, ReaderState};
use tracing::info;

use crate::config::UndertowConfig;
use crate::swarm::{InfoHash, TorrentInfo};

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Reading torrent data through a cache reader failed
    #[error("Read at offset {offset} failed: {source}")]
    Read {
        /// Byte offset within the file where the read or seek was attempted
        offset: u64,
        #[source]
        source: std::io::Error,
    },
}

/// Registry of open caches, one per torrent.
pub struct Storage {
    config: Arc<UndertowConfig>,
    caches: Arc<CacheRegistry>,
}

impl Storage {
    pub fn new(config: UndertowConfig) -> Self {
        Self {
            config: Arc::new(config),
            caches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &UndertowConfig {
        &self.config
    }

    /// Creates and registers the cache for a torrent whose metadata just arrived.
    ///
    /// A cache already registered under `hash` is closed first.
    pub fn open_torrent(&self, info: &TorrentInfo, hash: InfoHash) -> Arc<Cache> {
        let previous = self.caches.lock().remove(&hash);
        if let Some(previous) = previous {
            previous.close();
        }
        let cache = Cache::with_registry(
            info,
            hash,
            Arc::clone(&self.config),
            Arc::downgrade(&self.caches),
        );
        self.caches.lock().insert(hash, Arc::clone(&cache));
        cache
    }

    /// Closes and deregisters one cache.
    pub fn close_hash(&self, hash: InfoHash) {
        let cache = self.caches.lock().remove(&hash);
        if let Some(cache) = cache {
            cache.close();
        }
    }

    /// Closes every registered cache.
    pub fn close(&self) {
        let caches: Vec<_> = self.caches.lock().drain().map(|(_, cache)| cache).collect();
        info!("Closing {} caches", caches.len());
        for cache in caches {
            cache.close();
        }
    }

    pub fn get_cache(&self, hash: InfoHash) -> Option<Arc<Cache>> {
        self.caches.lock().get(&hash).cloned()
    }

    pub fn caches(&self) -> Vec<Arc<Cache>> {
        self.caches.lock().values().cloned().collect()
    }
}
