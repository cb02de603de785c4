//! Contract with the swarm engine that actually speaks BitTorrent.
//!
//! The engine (peer wire, DHT, trackers) lives outside this crate. It hands us
//! metadata, asks [`crate::storage::Storage`] for a cache once metadata is known,
//! consumes the piece priorities we emit and serves byte streams over files.

#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;

use std::fmt;
use std::io::{self, SeekFrom};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex form, used for cache directory names and snapshots.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 40 character hex string.
    ///
    /// # Errors
    ///
    /// - `SwarmError::InvalidLink` - Wrong length or non-hex characters
    pub fn from_hex(value: &str) -> Result<Self, SwarmError> {
        let bytes = hex::decode(value).map_err(|e| SwarmError::InvalidLink {
            reason: format!("invalid hex hash {value}: {e}"),
        })?;
        let hash: [u8; 20] = bytes.try_into().map_err(|_| SwarmError::InvalidLink {
            reason: format!("invalid hash length: {} (expected 40)", value.len()),
        })?;
        Ok(Self(hash))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Everything needed to ask the engine for a torrent before metadata exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentSpec {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl TorrentSpec {
    /// Creates a bare spec from an info hash.
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            display_name: None,
            trackers: Vec::new(),
        }
    }

    /// Parses a magnet URI or a bare hex info hash.
    ///
    /// # Errors
    ///
    /// - `SwarmError::InvalidLink` - Malformed magnet URI or hash
    pub fn from_link(link: &str) -> Result<Self, SwarmError> {
        let link = link.trim();
        if !link.starts_with("magnet:") {
            return Ok(Self::new(InfoHash::from_hex(link)?));
        }

        let magnet = magnet_url::Magnet::new(link).map_err(|e| SwarmError::InvalidLink {
            reason: format!("invalid magnet link: {e}"),
        })?;

        let query = link.split_once('?').map(|(_, q)| q).unwrap_or_default();
        let hash = query
            .split('&')
            .find_map(|param| param.strip_prefix("xt=urn:btih:"))
            .ok_or_else(|| SwarmError::InvalidLink {
                reason: format!("missing info hash in magnet link: {link}"),
            })?;

        Ok(Self {
            info_hash: InfoHash::from_hex(&hash.to_lowercase())?,
            display_name: magnet.display_name().map(|s| s.to_string()),
            trackers: magnet.trackers().to_vec(),
        })
    }
}

/// One file inside a torrent, positioned in the torrent's byte space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub index: usize,
    pub path: String,
    /// Byte offset of the file's first byte within the whole torrent.
    pub offset: u64,
    pub length: u64,
}

impl FileEntry {
    /// Exclusive end of the file in torrent byte space.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Metadata of a torrent once the info dictionary is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u64,
    pub piece_count: usize,
    pub files: Vec<FileEntry>,
}

impl TorrentInfo {
    /// Total content length across all files.
    pub fn length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Looks up a file by index.
    pub fn file(&self, index: usize) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.index == index)
    }
}

/// Fetch urgency communicated to the engine for a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub enum PiecePriority {
    #[default]
    None = 0,
    Normal = 1,
    High = 2,
    Readahead = 3,
    Next = 4,
    Now = 5,
}

/// Aggregate transfer counters reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    /// Useful payload bytes received from peers.
    pub bytes_read: u64,
    /// Payload bytes sent to peers.
    pub bytes_written: u64,
    pub total_peers: usize,
    pub active_peers: usize,
    pub connected_seeders: usize,
}

/// Errors surfaced by the swarm engine contract.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("BT client not connected")]
    NotConnected,

    #[error("Invalid torrent link: {reason}")]
    InvalidLink { reason: String },

    #[error("File {index} not found in torrent")]
    FileNotFound { index: usize },

    #[error("Torrent metadata not available yet")]
    NoMetadata,

    #[error("Engine error: {reason}")]
    Engine { reason: String },
}

/// Sequential, seekable byte stream over one file, served by the engine.
///
/// Reads wait for data the engine has not fetched yet. Readahead tells the
/// engine how far past the current position it should keep requesting.
#[async_trait]
pub trait FileStream: Send {
    /// Reads into `buf`, returning 0 at end of file.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Moves the stream position.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    /// Current stream position within the file.
    fn position(&self) -> u64;

    /// Bytes past the position the engine should prefetch.
    fn set_readahead(&mut self, bytes: u64);

    /// Releases engine-side resources. Called once when the owning reader closes.
    fn close(&mut self) {}
}

/// Handle to one torrent inside the engine.
#[async_trait]
pub trait SwarmTorrent: Send + Sync {
    fn info_hash(&self) -> InfoHash;

    /// Metadata, once the engine has it.
    fn info(&self) -> Option<TorrentInfo>;

    /// Resolves once metadata is known.
    async fn wait_info(&self);

    /// Resolves once the engine has dropped the torrent.
    async fn wait_closed(&self);

    fn is_closed(&self) -> bool;

    fn piece_priority(&self, index: usize) -> PiecePriority;

    fn set_piece_priority(&self, index: usize, priority: PiecePriority);

    /// Asks the engine to re-read completion state for a piece from storage.
    fn update_piece_completion(&self, index: usize);

    fn stats(&self) -> TransferStats;

    /// Bytes of verified pieces the engine currently holds.
    fn bytes_completed(&self) -> u64;

    /// Opens a stream over one file.
    ///
    /// # Errors
    ///
    /// - `SwarmError::NoMetadata` - Metadata not yet available
    /// - `SwarmError::FileNotFound` - Index outside the file list
    fn open_file(&self, file_index: usize) -> Result<Box<dyn FileStream>, SwarmError>;

    /// Removes the torrent from the engine and fires the closed signal.
    fn drop_torrent(&self);
}

/// The engine itself: the only entry point is adding torrents.
#[async_trait]
pub trait SwarmEngine: Send + Sync {
    /// Adds (or returns the existing handle for) a torrent.
    ///
    /// # Errors
    ///
    /// - `SwarmError::NotConnected` - Engine shut down
    async fn add_torrent(&self, spec: &TorrentSpec) -> Result<Arc<dyn SwarmTorrent>, SwarmError>;

    /// Stops the engine. Further `add_torrent` calls fail.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_info_hash_hex_round_trip() {
        let hash = InfoHash::from_hex(HASH).unwrap();
        assert_eq!(hash.to_hex(), HASH);
        assert_eq!(hash.to_string(), HASH);
    }

    #[test]
    fn test_info_hash_rejects_bad_input() {
        assert!(InfoHash::from_hex("abcd").is_err());
        assert!(InfoHash::from_hex(&"zz".repeat(20)).is_err());
    }

    #[test]
    fn test_spec_from_bare_hash() {
        let spec = TorrentSpec::from_link(HASH).unwrap();
        assert_eq!(spec.info_hash.to_hex(), HASH);
        assert!(spec.display_name.is_none());
        assert!(spec.trackers.is_empty());
    }

    #[test]
    fn test_spec_from_magnet() {
        let link = format!("magnet:?xt=urn:btih:{HASH}&dn=Test%20Movie");
        let spec = TorrentSpec::from_link(&link).unwrap();
        assert_eq!(spec.info_hash.to_hex(), HASH);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(PiecePriority::None < PiecePriority::Normal);
        assert!(PiecePriority::Normal < PiecePriority::High);
        assert!(PiecePriority::High < PiecePriority::Readahead);
        assert!(PiecePriority::Readahead < PiecePriority::Next);
        assert!(PiecePriority::Next < PiecePriority::Now);
    }

    #[test]
    fn test_torrent_info_file_lookup() {
        let info = TorrentInfo {
            name: "show".to_string(),
            piece_length: 16,
            piece_count: 4,
            files: vec![
                FileEntry {
                    index: 0,
                    path: "a.nfo".to_string(),
                    offset: 0,
                    length: 10,
                },
                FileEntry {
                    index: 1,
                    path: "b.mkv".to_string(),
                    offset: 10,
                    length: 50,
                },
            ],
        };
        assert_eq!(info.length(), 60);
        assert_eq!(info.file(1).map(FileEntry::end), Some(60));
        assert!(info.file(2).is_none());
    }
}
