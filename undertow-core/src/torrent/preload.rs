//! Warm-up of a file's head and tail before playback starts.
//!
//! Two throwaway readers sweep the head and the last block of the file so the
//! player finds its header and index without waiting on peers. Together they
//! read at most `size` bytes.

use std::io::SeekFrom;

use tracing::{info, warn};

use super::{Torrent, TorrentError, TorrentStat};
use crate::storage::range::FILE_BOUNDARY_BYTES;
use crate::storage::{Reader, StorageError};

/// Bytes requested per read while sweeping.
const PRELOAD_CHUNK: usize = 32 * 1024;

/// Byte windows swept by a preload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadPlan {
    /// The head window is `[0, head_len)`.
    pub head_len: u64,
    /// Tail window `[start, end)`, absent when the budget cannot cover it or
    /// it would overlap the head.
    pub tail: Option<(u64, u64)>,
    /// Initial readahead of the head reader.
    pub head_readahead: u64,
}

impl PreloadPlan {
    /// Splits `size` bytes between the head and the tail block.
    ///
    /// The tail block is taken out of the budget first. When nothing is left
    /// for the head, or the head would reach into the tail, the whole budget
    /// goes to the head instead.
    pub fn new(file_length: u64, size: u64, piece_length: u64) -> Self {
        let tail_span = piece_length.max(FILE_BOUNDARY_BYTES);
        let tail_start = file_length.saturating_sub(tail_span);
        let reserved_head = size.saturating_sub(tail_span).min(file_length);
        let tail = (reserved_head > 0 && tail_start > reserved_head)
            .then_some((tail_start, file_length));
        let head_len = match tail {
            Some(_) => reserved_head,
            None => size.min(file_length),
        };

        let mut head_readahead = piece_length * 4;
        if head_len < head_readahead {
            head_readahead = 0;
        }

        Self {
            head_len,
            tail,
            head_readahead,
        }
    }
}

impl Torrent {
    /// Preloads `size` bytes of file `index` plus its tail block.
    ///
    /// Runs only from [`TorrentStat::Working`] (waiting out a metadata fetch in
    /// progress) and returns to it afterwards. Falls back to the first file when
    /// `index` is unknown.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Closed` - Torrent closed mid-sweep
    /// - `TorrentError::FileNotFound` - Torrent has no files
    /// - `TorrentError::Swarm` - Engine refused to open a stream
    /// - `TorrentError::Storage` - A sweep failed to seek or read
    pub async fn preload(&self, index: usize, size: u64) -> Result<(), TorrentError> {
        if size == 0 {
            return Ok(());
        }
        self.state.lock().preload_size = size;

        if self.stat() == TorrentStat::GettingInfo {
            let mut stat = self.subscribe();
            let timeout = self.config().swarm.metadata_timeout;
            let _ = tokio::time::timeout(
                timeout,
                stat.wait_for(|s| *s != TorrentStat::GettingInfo),
            )
            .await;
        }

        let started = self.stat.send_if_modified(|stat| {
            if *stat == TorrentStat::Working {
                *stat = TorrentStat::Preload;
                true
            } else {
                false
            }
        });
        if !started {
            return Ok(());
        }

        let result = self.sweep(index, size).await;

        let finished = self.stat.send_if_modified(|stat| {
            if *stat == TorrentStat::Preload {
                *stat = TorrentStat::Working;
                true
            } else {
                false
            }
        });
        if finished {
            let mut state = self.state.lock();
            state.bit_rate.clear();
            state.duration_seconds = 0.0;
        }
        result
    }

    async fn sweep(&self, index: usize, size: u64) -> Result<(), TorrentError> {
        let info_hash = self.hash();
        let info = self.info().ok_or(TorrentError::NotReady { info_hash })?;
        let file = info
            .file(index)
            .or_else(|| info.files.first())
            .cloned()
            .ok_or(TorrentError::FileNotFound { index })?;
        let plan = PreloadPlan::new(file.length, size, info.piece_length);
        info!(
            "Preload {info_hash}: {} head {} bytes, tail {:?}",
            file.path, plan.head_len, plan.tail
        );

        let head = self.new_reader(file.index)?;
        let tail = match plan.tail {
            Some(_) => match self.new_reader(file.index) {
                Ok(reader) => Some(reader),
                Err(e) => {
                    self.close_reader(&head).await;
                    return Err(e);
                }
            },
            None => None,
        };

        let (head_result, tail_result) = futures::join!(
            self.sweep_head(&head, plan.head_len, plan.head_readahead),
            async {
                match (&tail, plan.tail) {
                    (Some(reader), Some((start, end))) => self.sweep_tail(reader, start, end).await,
                    _ => Ok(()),
                }
            }
        );

        self.close_reader(&head).await;
        if let Some(tail) = &tail {
            self.close_reader(tail).await;
        }
        if let Some(cache) = self.cache() {
            self.state.lock().preloaded_bytes = cache.state().filled;
        }

        let stats = self.handle.stats();
        info!(
            "End preload {info_hash}: peers [{}] {}/{}",
            stats.connected_seeders, stats.active_peers, stats.total_peers
        );
        head_result.and(tail_result)
    }

    async fn sweep_head(
        &self,
        reader: &Reader,
        end: u64,
        readahead: u64,
    ) -> Result<(), TorrentError> {
        let mut readahead = readahead;
        self.sweep_range(reader, 0, end, |remaining| {
            if readahead > 0 && remaining < readahead {
                readahead = 0;
            }
            readahead
        })
        .await
    }

    async fn sweep_tail(&self, reader: &Reader, start: u64, end: u64) -> Result<(), TorrentError> {
        if let Err(source) = reader.seek(SeekFrom::Start(start)).await {
            warn!("Preload {}: tail seek failed: {source}", self.hash());
            return Err(StorageError::Read {
                offset: start,
                source,
            }
            .into());
        }
        self.sweep_range(reader, start, end, |_| 0).await
    }

    /// Reads `[start, end)` through `reader`, asking `readahead` for the
    /// readahead to apply given the bytes still to read.
    async fn sweep_range(
        &self,
        reader: &Reader,
        start: u64,
        end: u64,
        mut readahead: impl FnMut(u64) -> u64,
    ) -> Result<(), TorrentError> {
        let mut buf = vec![0u8; PRELOAD_CHUNK];
        let mut offset = start;
        while offset < end {
            if self.stat() == TorrentStat::Closed {
                return Err(TorrentError::Closed {
                    info_hash: self.hash(),
                });
            }
            reader.set_readahead(readahead(end - offset));

            let want = (end - offset).min(buf.len() as u64) as usize;
            match reader.read(&mut buf[..want]).await {
                Ok(0) => break,
                Ok(n) => offset += n as u64,
                Err(source) => {
                    if self.stat() == TorrentStat::Closed {
                        return Err(TorrentError::Closed {
                            info_hash: self.hash(),
                        });
                    }
                    warn!("Preload {}: read failed at {offset}: {source}", self.hash());
                    return Err(StorageError::Read { offset, source }.into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Weak};

    use super::*;
    use crate::config::UndertowConfig;
    use crate::storage::Storage;
    use crate::swarm::test_mocks::MockSwarmTorrent;
    use crate::swarm::{FileEntry, InfoHash, SwarmTorrent, TorrentInfo, TorrentSpec};

    const KIB: u64 = 1 << 10;
    const MIB: u64 = 1 << 20;

    fn swept(plan: &PreloadPlan) -> u64 {
        plan.head_len + plan.tail.map_or(0, |(start, end)| end - start)
    }

    #[test]
    fn test_plan_head_and_tail() {
        let plan = PreloadPlan::new(100 * MIB, 32 * MIB, MIB);
        assert_eq!(plan.head_len, 24 * MIB);
        assert_eq!(plan.tail, Some((92 * MIB, 100 * MIB)));
        assert_eq!(plan.head_readahead, 4 * MIB);
        assert_eq!(swept(&plan), 32 * MIB);
    }

    #[test]
    fn test_plan_large_pieces_widen_tail() {
        let plan = PreloadPlan::new(200 * MIB, 20 * MIB, 16 * MIB);
        assert_eq!(plan.tail, Some((184 * MIB, 200 * MIB)));
        assert_eq!(plan.head_len, 4 * MIB);
        assert_eq!(plan.head_readahead, 0);
        assert!(swept(&plan) <= 20 * MIB);
    }

    #[test]
    fn test_plan_budget_capped_to_file() {
        let plan = PreloadPlan::new(3 * MIB, 20 * MIB, MIB);
        assert_eq!(plan.head_len, 3 * MIB);
        assert_eq!(plan.tail, None);
    }

    #[test]
    fn test_plan_budget_smaller_than_tail_goes_to_head() {
        let plan = PreloadPlan::new(100 * MIB, 4 * MIB, MIB);
        assert_eq!(plan.head_len, 4 * MIB);
        assert_eq!(plan.tail, None);
    }

    /// When the tail block starts inside the head window the tail sweep is
    /// skipped entirely and the head takes the whole budget.
    #[test]
    fn test_plan_overlapping_tail_is_skipped_entirely() {
        let plan = PreloadPlan::new(10 * MIB, 10 * MIB, MIB);
        assert_eq!(plan.head_len, 10 * MIB);
        assert_eq!(plan.tail, None);

        // Tail starting exactly at the head's end is also skipped.
        let plan = PreloadPlan::new(12 * MIB, 12 * MIB, MIB);
        assert_eq!(plan.head_len, 12 * MIB);
        assert_eq!(plan.tail, None);

        let plan = PreloadPlan::new(10 * MIB + 1, 10 * MIB, MIB);
        assert_eq!(plan.head_len, 2 * MIB);
        assert_eq!(plan.tail, Some((2 * MIB + 1, 10 * MIB + 1)));
        assert_eq!(swept(&plan), 10 * MIB);
    }

    fn preload_torrent(file_length: u64, piece_length: u64) -> (Arc<Torrent>, Arc<MockSwarmTorrent>) {
        let hash = InfoHash::new([5u8; 20]);
        let info = TorrentInfo {
            name: "movie".to_string(),
            piece_length,
            piece_count: file_length.div_ceil(piece_length) as usize,
            files: vec![FileEntry {
                index: 0,
                path: "movie.mkv".to_string(),
                offset: 0,
                length: file_length,
            }],
        };
        let handle = Arc::new(MockSwarmTorrent::with_info(hash, info));
        handle.set_content(vec![3u8; file_length as usize]);
        let storage = Arc::new(Storage::new(UndertowConfig::for_testing()));
        let torrent = Torrent::new(TorrentSpec::new(hash), handle.clone(), storage, Weak::new());
        (torrent, handle)
    }

    #[tokio::test]
    async fn test_preload_sweeps_head_and_tail() {
        let (torrent, handle) = preload_torrent(12 * MIB, 256 * KIB);
        torrent.got_info().await.unwrap();
        torrent.set_media_info("4.2 Mbps", 5400.0);

        torrent.preload(0, 10 * MIB).await.unwrap();

        assert_eq!(torrent.stat(), TorrentStat::Working);
        let streams = handle.stream_probes();
        assert_eq!(streams.len(), 2);
        // 8 MiB tail block out of the 10 MiB budget leaves 2 MiB of head.
        let head = streams[0].position.load(Ordering::SeqCst);
        let tail_end = streams[1].position.load(Ordering::SeqCst);
        assert_eq!(head, 2 * MIB);
        assert_eq!(tail_end, 12 * MIB);
        assert!(head + (tail_end - 4 * MIB) <= 10 * MIB);
        assert!(streams.iter().all(|p| p.closed.load(Ordering::SeqCst)));
        assert_eq!(torrent.cache().unwrap().readers_count(), 0);

        let status = torrent.status();
        assert!(status.bit_rate.is_empty());
        assert_eq!(status.duration_seconds, 0.0);
        assert_eq!(status.preload_size, 10 * MIB);
    }

    #[tokio::test]
    async fn test_preload_skips_overlapping_tail() {
        let (torrent, handle) = preload_torrent(10 * MIB, 256 * KIB);
        torrent.got_info().await.unwrap();

        torrent.preload(0, 10 * MIB).await.unwrap();

        let streams = handle.stream_probes();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].position.load(Ordering::SeqCst), 10 * MIB);
    }

    #[tokio::test]
    async fn test_preload_reports_failed_sweep() {
        let (torrent, handle) = preload_torrent(12 * MIB, 256 * KIB);
        torrent.got_info().await.unwrap();
        handle.fail_reads_at(MIB);

        let result = torrent.preload(0, 10 * MIB).await;

        match result {
            Err(TorrentError::Storage(StorageError::Read { offset, .. })) => {
                assert_eq!(offset, MIB)
            }
            other => panic!("expected a read failure, got {other:?}"),
        }
        assert_eq!(torrent.stat(), TorrentStat::Working);
        assert_eq!(torrent.cache().unwrap().readers_count(), 0);
        assert!(
            handle
                .stream_probes()
                .iter()
                .all(|p| p.closed.load(Ordering::SeqCst))
        );
    }

    #[tokio::test]
    async fn test_preload_unknown_index_uses_first_file() {
        let (torrent, handle) = preload_torrent(64 * KIB, KIB);
        torrent.got_info().await.unwrap();

        torrent.preload(7, 8 * KIB).await.unwrap();

        assert_eq!(handle.stream_probes().len(), 1);
    }

    #[tokio::test]
    async fn test_preload_requires_working_torrent() {
        let (torrent, handle) = preload_torrent(64 * KIB, KIB);

        torrent.preload(0, 8 * KIB).await.unwrap();

        assert_eq!(torrent.stat(), TorrentStat::Added);
        assert!(handle.stream_probes().is_empty());
    }

    #[tokio::test]
    async fn test_preload_zero_size_is_noop() {
        let (torrent, handle) = preload_torrent(64 * KIB, KIB);
        torrent.got_info().await.unwrap();

        torrent.preload(0, 0).await.unwrap();

        assert_eq!(torrent.stat(), TorrentStat::Working);
        assert!(handle.stream_probes().is_empty());
        assert!(!handle.is_closed());
    }
}
