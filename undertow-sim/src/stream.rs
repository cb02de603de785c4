//! File stream served by a [`SimulatedTorrent`].
//!
//! Reads go through the cache the torrent writes into. A read of a piece that
//! is not complete asks the torrent for it at [`PiecePriority::Now`] and waits
//! for the next completion.

use std::io::{self, SeekFrom};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;
use undertow_core::storage::PieceError;
use undertow_core::swarm::{FileEntry, FileStream, PiecePriority, SwarmTorrent};

use crate::torrent::{SimulatedTorrent, closed_error};

pub struct SimulatedFileStream {
    torrent: Arc<SimulatedTorrent>,
    file: FileEntry,
    piece_length: u64,
    position: u64,
    readahead: u64,
    closed: bool,
}

impl SimulatedFileStream {
    pub(crate) fn new(torrent: Arc<SimulatedTorrent>, file: FileEntry, piece_length: u64) -> Self {
        Self {
            torrent,
            file,
            piece_length,
            position: 0,
            readahead: 0,
            closed: false,
        }
    }

    pub fn readahead(&self) -> u64 {
        self.readahead
    }
}

#[async_trait]
impl FileStream for SimulatedFileStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed || self.position >= self.file.length || buf.is_empty() {
            return Ok(0);
        }

        let absolute = self.file.offset + self.position;
        let index = (absolute / self.piece_length) as usize;
        let offset = absolute % self.piece_length;
        let want = (buf.len() as u64)
            .min(self.piece_length - offset)
            .min(self.file.length - self.position) as usize;

        let mut progress = self.torrent.subscribe_progress();
        let mut closed = self.torrent.subscribe_closed();
        loop {
            if *closed.borrow_and_update() {
                return Err(closed_error(self.torrent.info_hash()));
            }
            if let Some(cache) = self.torrent.cache() {
                let piece = cache.piece(index);
                if matches!(piece.completion(), Ok(true)) {
                    match piece.read_at(&mut buf[..want], offset) {
                        Ok(n) => {
                            self.position += n as u64;
                            return Ok(n);
                        }
                        Err(PieceError::NoData) => {}
                        Err(e) => return Err(io::Error::other(e)),
                    }
                }
            }

            trace!("Stream {}: waiting for piece {index}", self.file.path);
            self.torrent.request(index, PiecePriority::Now);
            tokio::select! {
                _ = progress.changed() => {}
                _ = closed.changed() => {}
            }
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let next = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.position as i64 + delta,
            SeekFrom::End(delta) => self.file.length as i64 + delta,
        };
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.position = next as u64;
        Ok(self.position)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_readahead(&mut self, bytes: u64) {
        self.readahead = bytes;
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
