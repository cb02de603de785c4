//! Serializable cache snapshots for status endpoints and the CLI.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::swarm::PiecePriority;
use crate::torrent::TorrentStatus;

/// Point-in-time view of one [`super::Cache`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheState {
    pub hash: String,
    pub capacity: u64,
    pub filled: u64,
    pub piece_length: u64,
    pub pieces_count: usize,
    /// Pieces currently holding data, keyed by index.
    pub pieces: BTreeMap<usize, ItemState>,
    /// Active readers only.
    pub readers: Vec<ReaderState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub torrent: Option<TorrentStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemState {
    pub id: usize,
    pub size: u64,
    pub length: u64,
    pub completed: bool,
    pub priority: PiecePriority,
}

/// Protected window and current piece of an active reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReaderState {
    pub start: usize,
    pub end: usize,
    pub reader: usize,
}
