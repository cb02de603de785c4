//! Undertow Core - bounded piece cache for streaming out of a BitTorrent swarm
//!
//! Serves byte-range reads of files while their pieces are still arriving,
//! holding no more than a configured amount of torrent data at once. Reader
//! positions drive both eviction and the piece priorities fed back to the
//! swarm engine.

pub mod config;
pub mod storage;
pub mod swarm;
pub mod torrent;
pub mod tracing_setup;

pub use config::UndertowConfig;
pub use storage::{Cache, CacheState, PieceError, Reader, Storage, StorageError};
pub use swarm::{InfoHash, SwarmEngine, SwarmError, SwarmTorrent, TorrentSpec};
pub use torrent::{Torrent, TorrentError, TorrentServer, TorrentStat, TorrentStatus};

/// Core errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Piece error: {0}")]
    Piece(#[from] PieceError),

    #[error("Swarm error: {0}")]
    Swarm(#[from] SwarmError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Torrent(e) => match e {
                TorrentError::MetadataTimeout { info_hash } => {
                    format!("Could not get metadata for torrent {info_hash}")
                }
                TorrentError::TorrentNotFound { info_hash } => {
                    format!("Torrent {info_hash} not found")
                }
                TorrentError::FileNotFound { index } => format!("File {index} not found"),
                TorrentError::Closed { info_hash } => format!("Torrent {info_hash} was closed"),
                _ => "Torrent error occurred".to_string(),
            },
            UndertowError::Swarm(SwarmError::InvalidLink { reason }) => {
                format!("Invalid torrent link: {reason}")
            }
            UndertowError::Swarm(_) => "Swarm engine error occurred".to_string(),
            UndertowError::Storage(_) | UndertowError::Piece(_) => {
                "Storage error occurred".to_string()
            }
            UndertowError::Configuration { .. } => "Configuration error occurred".to_string(),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::Configuration { .. }
                | UndertowError::Swarm(SwarmError::InvalidLink { .. })
                | UndertowError::Torrent(TorrentError::FileNotFound { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;
