//! In-process swarm engine backed by registered [`SimulatedContent`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;
use undertow_core::storage::Storage;
use undertow_core::swarm::{InfoHash, SwarmEngine, SwarmError, SwarmTorrent, TorrentSpec};

use crate::config::SimulationConfig;
use crate::content::SimulatedContent;
use crate::torrent::SimulatedTorrent;

/// Swarm engine whose peers seed whatever content was registered.
///
/// Torrents with unregistered hashes are accepted but never receive metadata.
pub struct SimulatedSwarm {
    storage: Arc<Storage>,
    config: SimulationConfig,
    content: Mutex<HashMap<InfoHash, Arc<SimulatedContent>>>,
    torrents: Mutex<HashMap<InfoHash, Arc<SimulatedTorrent>>>,
    closed: AtomicBool,
}

impl SimulatedSwarm {
    pub fn new(storage: Arc<Storage>, config: SimulationConfig) -> Self {
        Self {
            storage,
            config,
            content: Mutex::new(HashMap::new()),
            torrents: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Makes `content` available from simulated peers.
    pub fn register(&self, content: SimulatedContent) -> Arc<SimulatedContent> {
        let content = Arc::new(content);
        self.content
            .lock()
            .insert(content.info_hash(), Arc::clone(&content));
        content
    }

    /// Live handle for `info_hash`, if added and not dropped.
    pub fn torrent(&self, info_hash: InfoHash) -> Option<Arc<SimulatedTorrent>> {
        self.torrents
            .lock()
            .get(&info_hash)
            .filter(|t| !t.is_closed())
            .cloned()
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }
}

#[async_trait]
impl SwarmEngine for SimulatedSwarm {
    async fn add_torrent(&self, spec: &TorrentSpec) -> Result<Arc<dyn SwarmTorrent>, SwarmError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SwarmError::NotConnected);
        }
        if let Some(existing) = self.torrent(spec.info_hash) {
            return Ok(existing as Arc<dyn SwarmTorrent>);
        }

        let content = self.content.lock().get(&spec.info_hash).cloned();
        let torrent = SimulatedTorrent::new(
            spec.info_hash,
            content,
            Arc::clone(&self.storage),
            self.config.clone(),
        );
        torrent.start();
        self.torrents
            .lock()
            .insert(spec.info_hash, Arc::clone(&torrent));
        info!("Simulated swarm: added {}", spec.info_hash);
        Ok(torrent as Arc<dyn SwarmTorrent>)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let torrents: Vec<_> = self.torrents.lock().drain().map(|(_, t)| t).collect();
        for torrent in torrents {
            torrent.drop_torrent();
        }
        info!("Simulated swarm closed");
    }
}
