//! Owner of the engine handle, the storage registry and every live torrent.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::info;

use super::catalog::{CatalogEntry, TorrentCatalog};
use super::{Torrent, TorrentError, TorrentStatus};
use crate::storage::Storage;
use crate::swarm::{InfoHash, SwarmEngine, TorrentSpec};

/// Registry of live torrents on top of one swarm engine.
pub struct TorrentServer {
    engine: Arc<dyn SwarmEngine>,
    storage: Arc<Storage>,
    catalog: Arc<dyn TorrentCatalog>,
    torrents: Mutex<HashMap<InfoHash, Arc<Torrent>>>,
    this: Weak<TorrentServer>,
}

impl TorrentServer {
    pub fn new(
        engine: Arc<dyn SwarmEngine>,
        storage: Arc<Storage>,
        catalog: Arc<dyn TorrentCatalog>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            engine,
            storage,
            catalog,
            torrents: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn catalog(&self) -> &Arc<dyn TorrentCatalog> {
        &self.catalog
    }

    /// Adds a torrent to the engine, or returns the live one for the same hash.
    ///
    /// Does not wait for metadata; see [`TorrentServer::open_torrent`].
    ///
    /// # Errors
    ///
    /// - `TorrentError::Swarm` - Engine rejected the torrent
    pub async fn add_torrent(&self, spec: TorrentSpec) -> Result<Arc<Torrent>, TorrentError> {
        let info_hash = spec.info_hash;
        if let Some(existing) = self.get_torrent(info_hash) {
            return Ok(existing);
        }

        let handle = self.engine.add_torrent(&spec).await?;
        let torrent = Torrent::new(spec, handle, Arc::clone(&self.storage), self.this.clone());
        if let Some(entry) = self.catalog.get(info_hash) {
            torrent.set_catalog_fields(&entry.title, &entry.poster, &entry.data);
        }

        {
            let mut torrents = self.torrents.lock();
            if let Some(existing) = torrents.get(&info_hash) {
                return Ok(Arc::clone(existing));
            }
            torrents.insert(info_hash, Arc::clone(&torrent));
        }
        torrent.spawn_watch();
        info!("Torrent {info_hash} added");
        Ok(torrent)
    }

    /// Adds a torrent and waits until it is working.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Swarm` - Engine rejected the torrent
    /// - `TorrentError::MetadataTimeout` - Metadata never arrived
    /// - `TorrentError::Closed` - Torrent closed while waiting
    pub async fn open_torrent(&self, spec: TorrentSpec) -> Result<Arc<Torrent>, TorrentError> {
        let torrent = self.add_torrent(spec).await?;
        torrent.got_info().await?;
        Ok(torrent)
    }

    /// Re-attaches a torrent known only from the catalog.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - No catalog record for `info_hash`
    /// - Any error of [`TorrentServer::open_torrent`]
    pub async fn attach(&self, info_hash: InfoHash) -> Result<Arc<Torrent>, TorrentError> {
        let entry = self
            .catalog
            .get(info_hash)
            .ok_or(TorrentError::TorrentNotFound { info_hash })?;
        let mut spec = TorrentSpec::new(info_hash);
        spec.display_name = Some(entry.title);
        self.open_torrent(spec).await
    }

    /// Live torrent for `info_hash`. A lookup postpones its expiry.
    pub fn get_torrent(&self, info_hash: InfoHash) -> Option<Arc<Torrent>> {
        let torrent = self.torrents.lock().get(&info_hash).cloned()?;
        torrent.touch();
        Some(torrent)
    }

    /// Live torrents merged with catalog records not currently attached,
    /// newest first. Equal timestamps order by title, descending.
    pub fn list_torrents(&self) -> Vec<TorrentStatus> {
        let live: Vec<Arc<Torrent>> = self.torrents.lock().values().cloned().collect();
        let mut statuses: Vec<TorrentStatus> = live.iter().map(|t| t.status()).collect();
        for entry in self.catalog.list() {
            if !live.iter().any(|t| t.hash() == entry.info_hash) {
                statuses.push(entry.status());
            }
        }

        statuses.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.title.cmp(&a.title))
        });
        statuses
    }

    /// Records a live torrent in the catalog.
    pub fn save_torrent(&self, torrent: &Torrent) {
        let status = torrent.status();
        let mut entry = CatalogEntry::new(torrent.hash(), status.title);
        entry.poster = status.poster;
        entry.data = status.data;
        entry.size = status.torrent_size;
        entry.timestamp = status.timestamp;
        self.catalog.save(entry);
    }

    /// Closes a live torrent. Refused while it has open readers.
    pub fn remove_torrent(&self, info_hash: InfoHash) -> bool {
        let torrent = self.torrents.lock().get(&info_hash).cloned();
        match torrent {
            Some(torrent) => torrent.close(),
            None => false,
        }
    }

    /// Forgets a torrent entirely: catalog record and live session.
    pub fn drop_torrent(&self, info_hash: InfoHash) -> bool {
        self.catalog.remove(info_hash);
        self.remove_torrent(info_hash)
    }

    /// Preloads file `index` with the configured share of the cache.
    ///
    /// # Errors
    ///
    /// - Any error of [`Torrent::preload`]
    pub async fn preload(&self, torrent: &Torrent, index: usize) -> Result<(), TorrentError> {
        let cache = &self.storage.config().cache;
        let size = (cache.cache_size * cache.preload_percent / 100).min(cache.cache_size);
        if size == 0 {
            return Ok(());
        }
        torrent.preload(index, size).await
    }

    pub(crate) fn forget(&self, info_hash: InfoHash, torrent: &Torrent) {
        let mut torrents = self.torrents.lock();
        if torrents
            .get(&info_hash)
            .is_some_and(|t| std::ptr::eq(Arc::as_ptr(t), torrent))
        {
            torrents.remove(&info_hash);
        }
    }

    /// Closes every torrent, the storage and the engine.
    pub fn shutdown(&self) {
        let torrents: Vec<_> = self.torrents.lock().drain().map(|(_, t)| t).collect();
        info!("Shutting down {} torrents", torrents.len());
        for torrent in torrents {
            torrent.shutdown();
        }
        self.storage.close();
        self.engine.close();
    }
}
