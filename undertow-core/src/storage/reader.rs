//! Cursor over one file of a cached torrent.
//!
//! A reader wraps the engine's file stream, tracks its logical offset and
//! readahead, and feeds its position to the cache's range scheduler. Readers go
//! idle when unused while other readers share the cache and wake up on the next
//! access.

use std::io::{self, SeekFrom};
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::cache::Cache;
use super::range::{self, Range};
use crate::swarm::{FileEntry, FileStream};

/// Unique identifier of a reader within its cache.
pub type ReaderId = Uuid;

/// First read length needed before the FourCC patch applies.
const LEGACY_HEADER_LEN: usize = 192;
/// Byte offsets of the AVI codec tags inspected on the first read.
const FOURCC_OFFSETS: [usize; 2] = [112, 188];

struct Cursor {
    offset: u64,
    readahead: u64,
    /// Readahead last pushed to the stream.
    stream_readahead: u64,
    is_use: bool,
    last_access: i64,
    closed: bool,
}

/// Stream reader registered with a [`Cache`].
pub struct Reader {
    id: ReaderId,
    file: FileEntry,
    cache: Weak<Cache>,
    stream: tokio::sync::Mutex<Box<dyn FileStream>>,
    cursor: Mutex<Cursor>,
}

impl Reader {
    pub(crate) fn new(file: FileEntry, stream: Box<dyn FileStream>, cache: Weak<Cache>) -> Self {
        Self {
            id: Uuid::new_v4(),
            file,
            cache,
            stream: tokio::sync::Mutex::new(stream),
            cursor: Mutex::new(Cursor {
                offset: 0,
                readahead: 0,
                stream_readahead: 0,
                is_use: true,
                last_access: now(),
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> ReaderId {
        self.id
    }

    pub fn file(&self) -> &FileEntry {
        &self.file
    }

    /// Logical position within the file.
    pub fn offset(&self) -> u64 {
        self.cursor.lock().offset
    }

    /// Effective readahead: zero while idle.
    pub fn readahead(&self) -> u64 {
        let cursor = self.cursor.lock();
        if cursor.is_use { cursor.readahead } else { 0 }
    }

    pub fn is_active(&self) -> bool {
        let cursor = self.cursor.lock();
        cursor.is_use && !cursor.closed
    }

    pub fn is_closed(&self) -> bool {
        self.cursor.lock().closed
    }

    /// Sets the readahead, pushed to the stream now or on the next access.
    pub fn set_readahead(&self, bytes: u64) {
        let mut cursor = self.cursor.lock();
        cursor.readahead = bytes;
        if !cursor.is_use || cursor.stream_readahead == bytes {
            return;
        }
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.set_readahead(bytes);
            cursor.stream_readahead = bytes;
        }
    }

    /// Reads from the current offset, waiting for the engine when data is missing.
    ///
    /// Returns 0 at end of file and after close.
    ///
    /// # Errors
    ///
    /// - Any I/O error reported by the engine stream
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Ok(0);
        }
        let mut stream = self.stream.lock().await;
        self.reader_on(stream.as_mut())?;

        let first_read = self.cursor.lock().offset == 0;
        let n = stream.read(buf).await?;
        if first_read && n >= LEGACY_HEADER_LEN {
            patch_legacy_fourcc(&mut buf[..n]);
        }

        let mut cursor = self.cursor.lock();
        cursor.offset += n as u64;
        cursor.last_access = now();
        Ok(n)
    }

    /// Moves the logical offset.
    ///
    /// # Errors
    ///
    /// - Reader already closed
    /// - Seek rejected by the engine stream
    pub async fn seek(&self, pos: SeekFrom) -> io::Result<u64> {
        if self.is_closed() {
            return Err(io::Error::other("reader closed"));
        }
        let mut stream = self.stream.lock().await;
        self.reader_on(stream.as_mut())?;
        let offset = stream.seek(pos)?;

        let mut cursor = self.cursor.lock();
        cursor.offset = offset;
        cursor.last_access = now();
        Ok(offset)
    }

    /// Deregisters from the cache, closes the stream and schedules a pass.
    pub async fn close(&self) {
        match self.cache.upgrade() {
            Some(cache) => cache.close_reader(self).await,
            None => self.shutdown().await,
        }
    }

    /// Piece holding the current offset.
    pub fn reader_piece(&self, piece_length: u64) -> usize {
        let offset = self.offset().min(self.file.length.saturating_sub(1));
        range::piece_index(&self.file, offset, piece_length)
    }

    /// Piece holding the last byte of the readahead window.
    pub fn readahead_piece(&self, piece_length: u64) -> usize {
        let end = self
            .offset()
            .saturating_add(self.readahead())
            .min(self.file.length.saturating_sub(1));
        range::piece_index(&self.file, end, piece_length)
    }

    /// Protected piece range given the cache's current capacity and readers.
    pub fn pieces_range(&self) -> Option<Range> {
        let cache = self.cache.upgrade()?;
        Some(self.range_with(
            cache.capacity(),
            cache.active_readers(),
            cache.readahead_percent(),
            cache.piece_length(),
        ))
    }

    pub(crate) fn range_with(
        &self,
        capacity: u64,
        active_readers: usize,
        percent: u64,
        piece_length: u64,
    ) -> Range {
        let (begin, end) = range::reader_window(
            self.offset(),
            self.file.length,
            capacity,
            active_readers,
            percent,
        );
        range::window_to_range(&self.file, begin, end, piece_length)
    }

    /// Demotes the reader to idle after `idle_timeout` without access.
    ///
    /// Only applies while another reader shares the cache. A reader whose stream
    /// is busy is in use and stays active.
    pub(crate) fn check_idle(&self, registered: usize, idle_timeout: Duration) {
        let mut cursor = self.cursor.lock();
        if !cursor.is_use || cursor.closed || registered <= 1 {
            return;
        }
        if now() - cursor.last_access <= idle_timeout.as_secs() as i64 {
            return;
        }
        let Ok(mut stream) = self.stream.try_lock() else {
            return;
        };

        stream.set_readahead(0);
        if let Err(e) = stream.seek(SeekFrom::Start(0)) {
            warn!("Failed to rewind idle reader {}: {e}", self.id);
        }
        cursor.stream_readahead = 0;
        cursor.is_use = false;
        debug!("Reader {} idle at offset {}", self.id, cursor.offset);
    }

    /// Reactivates an idle reader before stream access.
    fn reader_on(&self, stream: &mut dyn FileStream) -> io::Result<()> {
        let mut cursor = self.cursor.lock();
        cursor.last_access = now();
        if !cursor.is_use {
            if stream.position() == 0 {
                stream.seek(SeekFrom::Start(cursor.offset))?;
            }
            cursor.is_use = true;
            debug!("Reader {} active at offset {}", self.id, cursor.offset);
        }
        if cursor.stream_readahead != cursor.readahead {
            stream.set_readahead(cursor.readahead);
            cursor.stream_readahead = cursor.readahead;
        }
        Ok(())
    }

    /// Marks the reader closed and releases the engine stream.
    pub(crate) async fn shutdown(&self) {
        {
            let mut cursor = self.cursor.lock();
            if cursor.closed {
                return;
            }
            cursor.closed = true;
            cursor.is_use = false;
        }
        self.stream.lock().await.close();
    }

    /// Marks the reader closed when its cache goes away under it.
    ///
    /// The stream is closed now if nobody holds it, otherwise when the reader
    /// is dropped.
    pub(crate) fn detach(&self) {
        {
            let mut cursor = self.cursor.lock();
            if cursor.closed {
                return;
            }
            cursor.closed = true;
            cursor.is_use = false;
        }
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, secs: i64) {
        self.cursor.lock().last_access -= secs;
    }
}

/// Rewrites XviD/DivX codec tags to MP4V in an AVI header.
fn patch_legacy_fourcc(buf: &mut [u8]) {
    for offset in FOURCC_OFFSETS {
        let Some(tag) = buf.get_mut(offset..offset + 4) else {
            continue;
        };
        if tag.eq_ignore_ascii_case(b"xvid") || tag.eq_ignore_ascii_case(b"divx") {
            tag.copy_from_slice(b"MP4V");
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::swarm::test_mocks::MockFileStream;

    fn file(length: u64) -> FileEntry {
        FileEntry {
            index: 0,
            path: "clip.avi".to_string(),
            offset: 0,
            length,
        }
    }

    fn detached_reader(data: Vec<u8>) -> (Reader, Arc<crate::swarm::test_mocks::StreamProbe>) {
        let length = data.len() as u64;
        let (stream, probe) = MockFileStream::new(data);
        (Reader::new(file(length), Box::new(stream), Weak::new()), probe)
    }

    fn avi_header(tag_112: &[u8; 4], tag_188: &[u8; 4]) -> Vec<u8> {
        let mut data = vec![0u8; 512];
        data[112..116].copy_from_slice(tag_112);
        data[188..192].copy_from_slice(tag_188);
        data
    }

    #[tokio::test]
    async fn test_first_read_rewrites_xvid_tags() {
        let (reader, _) = detached_reader(avi_header(b"XVID", b"divx"));
        let mut buf = vec![0u8; 256];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 256);
        assert_eq!(&buf[112..116], b"MP4V");
        assert_eq!(&buf[188..192], b"MP4V");
        assert_eq!(reader.offset(), 256);
    }

    #[tokio::test]
    async fn test_fourcc_patch_checks_each_tag() {
        let (reader, _) = detached_reader(avi_header(b"H264", b"DivX"));
        let mut buf = vec![0u8; 192];
        reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[112..116], b"H264");
        assert_eq!(&buf[188..192], b"MP4V");
    }

    #[tokio::test]
    async fn test_short_first_read_is_untouched() {
        let (reader, _) = detached_reader(avi_header(b"xvid", b"xvid"));
        let mut buf = vec![0u8; 191];
        reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[112..116], b"xvid");
    }

    #[tokio::test]
    async fn test_later_reads_are_untouched() {
        let mut data = vec![0u8; 1024];
        data[512 + 112..512 + 116].copy_from_slice(b"xvid");
        let (reader, _) = detached_reader(data);
        reader.seek(SeekFrom::Start(512)).await.unwrap();
        let mut buf = vec![0u8; 256];
        reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[112..116], b"xvid");
    }

    #[tokio::test]
    async fn test_seek_tracks_offset() {
        let (reader, probe) = detached_reader(vec![1u8; 100]);
        assert_eq!(reader.seek(SeekFrom::Start(40)).await.unwrap(), 40);
        assert_eq!(reader.seek(SeekFrom::Current(10)).await.unwrap(), 50);
        assert_eq!(reader.seek(SeekFrom::End(-20)).await.unwrap(), 80);
        assert_eq!(reader.offset(), 80);
        assert_eq!(probe.position.load(Ordering::SeqCst), 80);
    }

    #[tokio::test]
    async fn test_readahead_reaches_stream() {
        let (reader, probe) = detached_reader(vec![0u8; 16]);
        reader.set_readahead(4096);
        assert_eq!(reader.readahead(), 4096);
        assert_eq!(probe.readahead.load(Ordering::SeqCst), 4096);
    }

    #[tokio::test]
    async fn test_single_reader_never_goes_idle() {
        let (reader, _) = detached_reader(vec![0u8; 16]);
        reader.backdate(3600);
        reader.check_idle(1, Duration::from_secs(60));
        assert!(reader.is_active());
    }

    #[tokio::test]
    async fn test_closed_reader_reads_eof() {
        let (reader, probe) = detached_reader(vec![7u8; 16]);
        reader.close().await;
        assert!(probe.closed.load(Ordering::SeqCst));
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert!(reader.seek(SeekFrom::Start(0)).await.is_err());
    }

    #[test]
    fn test_reader_pieces_account_for_file_offset() {
        let (stream, _) = MockFileStream::new(vec![0u8; 8]);
        let entry = FileEntry {
            index: 1,
            path: "b.mkv".to_string(),
            offset: 300,
            length: 1000,
        };
        let reader = Reader::new(entry, Box::new(stream), Weak::new());
        reader.set_readahead(250);
        assert_eq!(reader.reader_piece(100), 3);
        assert_eq!(reader.readahead_piece(100), 5);
    }
}
