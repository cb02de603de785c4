//! Storage for a single piece, backed by memory or by one file on disk.
//!
//! The engine writes downloaded blocks here and reads them back to serve
//! streams. Size, completion and the backing buffer share one per-piece lock:
//! concurrent reads of a piece proceed together, writes are serialized.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::cache::Cache;
use crate::swarm::PiecePriority;

/// Errors surfaced by piece I/O.
#[derive(Debug, thiserror::Error)]
pub enum PieceError {
    /// The requested bytes have not been downloaded yet. Retry later.
    #[error("No data available at this offset yet")]
    NoData,

    /// Lookup of an index the cache does not hold.
    #[error("Unknown piece")]
    UnknownPiece,

    #[error("Piece I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Piece-level storage contract consumed by the swarm engine.
pub trait PieceStorage: Send + Sync {
    /// Writes `buf` at `offset` within the piece.
    ///
    /// # Errors
    ///
    /// - `PieceError::Io` - Disk write failed
    /// - `PieceError::UnknownPiece` - Index not held by the cache
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, PieceError>;

    /// Reads into `buf` from `offset` within the piece.
    ///
    /// # Errors
    ///
    /// - `PieceError::NoData` - Nothing written at `offset` yet
    /// - `PieceError::Io` - Disk read failed
    /// - `PieceError::UnknownPiece` - Index not held by the cache
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, PieceError>;

    /// # Errors
    ///
    /// - `PieceError::UnknownPiece` - Index not held by the cache
    fn mark_complete(&self) -> Result<(), PieceError>;

    /// # Errors
    ///
    /// - `PieceError::UnknownPiece` - Index not held by the cache
    fn mark_not_complete(&self) -> Result<(), PieceError>;

    /// # Errors
    ///
    /// - `PieceError::UnknownPiece` - Index not held by the cache
    fn completion(&self) -> Result<bool, PieceError>;
}

/// Where piece bytes live. Chosen once per cache from configuration.
#[derive(Debug, Clone)]
pub enum BackingKind {
    Memory,
    /// Directory holding one file per piece, named by piece index.
    Disk(PathBuf),
}

/// Result of a backing write.
struct WriteOutcome {
    written: usize,
    /// A buffer was allocated by this write.
    allocated: bool,
}

/// Storage strategy behind a [`Piece`].
trait PieceBacking: Send + Sync {
    fn write_at(
        &mut self,
        buf: &[u8],
        offset: u64,
        piece_length: u64,
    ) -> Result<WriteOutcome, PieceError>;

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, PieceError>;

    fn release(&mut self);
}

/// Lazily allocated in-memory buffer of one piece length.
#[derive(Default)]
struct MemoryBacking {
    buffer: Option<Vec<u8>>,
}

impl PieceBacking for MemoryBacking {
    fn write_at(
        &mut self,
        buf: &[u8],
        offset: u64,
        piece_length: u64,
    ) -> Result<WriteOutcome, PieceError> {
        let allocated = self.buffer.is_none();
        let buffer = self
            .buffer
            .get_or_insert_with(|| vec![0u8; piece_length as usize]);

        let start = (offset as usize).min(buffer.len());
        let written = buf.len().min(buffer.len() - start);
        buffer[start..start + written].copy_from_slice(&buf[..written]);

        Ok(WriteOutcome { written, allocated })
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, PieceError> {
        let buffer = self.buffer.as_ref().ok_or(PieceError::NoData)?;
        let start = offset as usize;
        if start >= buffer.len() {
            return Err(PieceError::NoData);
        }
        let n = buf.len().min(buffer.len() - start);
        buf[..n].copy_from_slice(&buffer[start..start + n]);
        Ok(n)
    }

    fn release(&mut self) {
        self.buffer = None;
    }
}

/// One file per piece at `<save_path>/<hex hash>/<index>`.
struct DiskBacking {
    path: PathBuf,
}

impl PieceBacking for DiskBacking {
    fn write_at(
        &mut self,
        buf: &[u8],
        offset: u64,
        _piece_length: u64,
    ) -> Result<WriteOutcome, PieceError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .inspect_err(|e| warn!("Error open piece file {}: {e}", self.path.display()))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;

        Ok(WriteOutcome {
            written: buf.len(),
            allocated: false,
        })
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, PieceError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(PieceError::NoData),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;

        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if total == 0 {
            return Err(PieceError::NoData);
        }
        Ok(total)
    }

    fn release(&mut self) {
        // On-disk state is not authoritative; a leftover file is harmless.
        let _ = fs::remove_file(&self.path);
    }
}

struct PieceInner {
    size: u64,
    complete: bool,
    backing: Box<dyn PieceBacking>,
}

/// Point-in-time view of a piece used by the eviction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceSnapshot {
    pub id: usize,
    pub size: u64,
    pub complete: bool,
    pub accessed: i64,
}

/// One piece of a torrent held by a [`Cache`].
pub struct Piece {
    id: usize,
    piece_length: u64,
    cache: Weak<Cache>,
    inner: RwLock<PieceInner>,
    accessed: AtomicI64,
}

impl Piece {
    /// Creates an empty piece. Disk pieces pick up state left by an earlier run.
    pub(crate) fn new(id: usize, piece_length: u64, kind: &BackingKind, cache: Weak<Cache>) -> Self {
        let mut size = 0;
        let mut complete = false;
        let mut accessed = 0;

        let backing: Box<dyn PieceBacking> = match kind {
            BackingKind::Memory => Box::new(MemoryBacking::default()),
            BackingKind::Disk(dir) => {
                let path = disk_piece_path(dir, id);
                if let Ok(meta) = fs::metadata(&path) {
                    size = meta.len().min(piece_length);
                    complete = meta.len() == piece_length;
                    accessed = meta
                        .modified()
                        .map(|time| chrono::DateTime::<chrono::Utc>::from(time).timestamp())
                        .unwrap_or_default();
                    debug!("Recovered piece {id} from disk: {size} bytes, complete={complete}");
                }
                Box::new(DiskBacking { path })
            }
        };

        Self {
            id,
            piece_length,
            cache,
            inner: RwLock::new(PieceInner {
                size,
                complete,
                backing,
            }),
            accessed: AtomicI64::new(accessed),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.inner.read().size
    }

    pub fn is_complete(&self) -> bool {
        self.inner.read().complete
    }

    /// Unix seconds of the last read or write.
    pub fn accessed(&self) -> i64 {
        self.accessed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PieceSnapshot {
        let inner = self.inner.read();
        PieceSnapshot {
            id: self.id,
            size: inner.size,
            complete: inner.complete,
            accessed: self.accessed(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_accessed(&self, unix: i64) {
        self.accessed.store(unix, Ordering::Relaxed);
    }

    fn touch(&self) {
        self.accessed
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    fn schedule_clean(&self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.schedule_clean();
        }
    }

    /// Drops the piece's data and returns how many bytes were freed.
    ///
    /// Unless the cache is closing, the engine is told to forget the piece's
    /// priority and recheck its completion.
    pub(crate) fn release(&self) -> u64 {
        let freed = {
            let mut inner = self.inner.write();
            let freed = inner.size;
            inner.backing.release();
            inner.size = 0;
            inner.complete = false;
            freed
        };

        if let Some(cache) = self.cache.upgrade() {
            if !cache.is_closed() {
                if let Some(torrent) = cache.torrent() {
                    torrent.set_piece_priority(self.id, PiecePriority::None);
                    torrent.update_piece_completion(self.id);
                }
            }
        }

        debug!("Released piece {} ({freed} bytes)", self.id);
        freed
    }
}

impl PieceStorage for Piece {
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, PieceError> {
        let outcome = {
            let mut inner = self.inner.write();
            let outcome = inner.backing.write_at(buf, offset, self.piece_length)?;
            inner.size = (inner.size + outcome.written as u64).min(self.piece_length);
            self.touch();
            outcome
        };

        if outcome.allocated {
            self.schedule_clean();
        }
        Ok(outcome.written)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, PieceError> {
        let (n, reached_fill) = {
            let inner = self.inner.read();
            // Bytes past the written size are zero fill, not piece data.
            if offset >= inner.size {
                return Err(PieceError::NoData);
            }
            let limit = buf.len().min((inner.size - offset) as usize);
            let n = inner.backing.read_at(&mut buf[..limit], offset)?;
            self.touch();
            (n, offset + limit as u64 >= inner.size)
        };

        if reached_fill {
            self.schedule_clean();
        }
        Ok(n)
    }

    fn mark_complete(&self) -> Result<(), PieceError> {
        self.inner.write().complete = true;
        Ok(())
    }

    fn mark_not_complete(&self) -> Result<(), PieceError> {
        self.inner.write().complete = false;
        Ok(())
    }

    fn completion(&self) -> Result<bool, PieceError> {
        Ok(self.is_complete())
    }
}

/// Stand-in returned for indices the cache does not hold.
pub struct UnknownPiece;

impl PieceStorage for UnknownPiece {
    fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize, PieceError> {
        Err(PieceError::UnknownPiece)
    }

    fn read_at(&self, _buf: &mut [u8], _offset: u64) -> Result<usize, PieceError> {
        Err(PieceError::UnknownPiece)
    }

    fn mark_complete(&self) -> Result<(), PieceError> {
        Err(PieceError::UnknownPiece)
    }

    fn mark_not_complete(&self) -> Result<(), PieceError> {
        Err(PieceError::UnknownPiece)
    }

    fn completion(&self) -> Result<bool, PieceError> {
        Err(PieceError::UnknownPiece)
    }
}

/// Path of the file backing piece `id` inside a torrent's piece directory.
pub fn disk_piece_path(dir: &Path, id: usize) -> PathBuf {
    dir.join(id.to_string())
}
