//! Undertow Simulation - in-process swarm for exercising the piece cache.
//!
//! Replaces the BitTorrent engine with simulated peers seeding deterministic
//! content. Downloads follow the piece priorities the cache emits and land in
//! the same [`undertow_core::Storage`] a real engine would write to, so
//! streaming, eviction and preload can be driven end to end without a network.
//!
//! # Example
//!
//! ```rust,no_run
//! use undertow_core::{TorrentSpec, UndertowConfig};
//! use undertow_sim::{SimulatedContent, SimulatedSession, SimulationConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = SimulatedSession::new(UndertowConfig::default(), SimulationConfig::default());
//! let content = session
//!     .swarm()
//!     .register(SimulatedContent::single_file("movie.mp4", 64 << 20, 1 << 20, 7));
//!
//! let torrent = session
//!     .server()
//!     .open_torrent(TorrentSpec::new(content.info_hash()))
//!     .await?;
//! let reader = torrent.new_reader(0)?;
//! let mut buf = vec![0u8; 64 * 1024];
//! let n = reader.read(&mut buf).await?;
//! println!("read {n} bytes");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod content;
pub mod stream;
pub mod swarm;
pub mod torrent;

use std::sync::Arc;

pub use config::SimulationConfig;
pub use content::{ContentBuilder, SimulatedContent};
pub use stream::SimulatedFileStream;
pub use swarm::SimulatedSwarm;
pub use torrent::SimulatedTorrent;
use undertow_core::torrent::MemoryCatalog;
use undertow_core::{Storage, TorrentServer, UndertowConfig};

/// Torrent server wired to a simulated swarm and an in-memory catalog.
pub struct SimulatedSession {
    server: Arc<TorrentServer>,
    swarm: Arc<SimulatedSwarm>,
}

impl SimulatedSession {
    pub fn new(config: UndertowConfig, simulation: SimulationConfig) -> Self {
        let storage = Arc::new(Storage::new(config));
        let swarm = Arc::new(SimulatedSwarm::new(Arc::clone(&storage), simulation));
        let server = TorrentServer::new(
            Arc::clone(&swarm) as Arc<dyn undertow_core::SwarmEngine>,
            storage,
            Arc::new(MemoryCatalog::new()),
        );
        Self { server, swarm }
    }

    pub fn server(&self) -> &Arc<TorrentServer> {
        &self.server
    }

    pub fn swarm(&self) -> &Arc<SimulatedSwarm> {
        &self.swarm
    }

    /// Closes every torrent, the storage and the swarm.
    pub fn shutdown(&self) {
        self.server.shutdown();
    }
}
