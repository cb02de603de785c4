//! End-to-end streaming workflow
//!
//! Torrents are added to a server backed by the simulated swarm and streamed
//! through the piece cache. Content read back must match the generated bytes
//! while the cache stays within its capacity outside protected pieces.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use undertow_core::storage::Reader;
use undertow_core::storage::range::boundary_pieces;
use undertow_core::torrent::TorrentError;
use undertow_core::{InfoHash, TorrentSpec, TorrentStat, UndertowConfig};
use undertow_sim::{ContentBuilder, SimulatedContent, SimulatedSession, SimulationConfig};

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const PIECE: u64 = 256 * KIB;

fn test_config() -> UndertowConfig {
    let mut config = UndertowConfig::for_testing();
    config.swarm.disconnect_timeout = Duration::from_secs(30);
    config
}

/// A short leading file (pieces 0-2) followed by a 24 MiB movie.
fn layered_content() -> SimulatedContent {
    ContentBuilder::new("Big Buck Bunny", PIECE)
        .seed(11)
        .file("bunny.nfo", 3 * PIECE)
        .file("bunny.mkv", 24 * MIB)
        .build()
}

async fn read_to_end(reader: &Reader, chunk: usize) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = vec![0u8; chunk];
    loop {
        let n = reader.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    data
}

async fn read_exact(reader: &Reader, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = reader.read(&mut data[filled..]).await.unwrap();
        assert!(n > 0, "unexpected end of file after {filled} bytes");
        filled += n;
    }
    data
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_whole_file_through_bounded_cache() {
    let session = SimulatedSession::new(test_config(), SimulationConfig::instant());
    let content = session.swarm().register(layered_content());
    let torrent = session
        .server()
        .open_torrent(TorrentSpec::new(content.info_hash()))
        .await
        .unwrap();
    assert_eq!(torrent.stat(), TorrentStat::Working);
    let cache = torrent.cache().unwrap();
    assert_eq!(cache.capacity(), 4 * MIB);

    let nfo = torrent.new_reader(0).unwrap();
    let nfo_data = read_to_end(&nfo, 64 * 1024).await;
    assert!(nfo_data[..] == content.file_data(0)[..], "nfo content mismatch");
    torrent.close_reader(&nfo).await;

    let movie = torrent.new_reader(1).unwrap();
    let movie_data = tokio::time::timeout(Duration::from_secs(60), read_to_end(&movie, 64 * 1024))
        .await
        .unwrap();
    assert_eq!(movie_data.len() as u64, 24 * MIB);
    assert!(movie_data[..] == content.file_data(1)[..], "movie content mismatch");

    // Let in-flight downloads settle before checking the steady state.
    cache.clean_pieces();
    tokio::time::sleep(Duration::from_millis(100)).await;
    cache.clean_pieces();

    let file = content.info().file(1).unwrap().clone();
    let [head, tail] = boundary_pieces(&file, PIECE);
    let state = cache.state();
    for id in state.pieces.keys() {
        let protected = (head.0..=head.1).contains(id) || (tail.0..=tail.1).contains(id);
        assert!(protected, "piece {id} outside the movie's boundary blocks is still held");
    }
    assert!(cache.clean_pieces().is_empty());

    torrent.close_reader(&movie).await;
    cache.clean_pieces();
    assert!(cache.filled() <= cache.capacity());

    let json = serde_json::to_value(torrent.cache_state().unwrap()).unwrap();
    assert_eq!(json["capacity"], 4 * MIB);
    assert_eq!(json["torrent"]["stat"], "Working");
    assert_eq!(json["torrent"]["file_stats"].as_array().unwrap().len(), 2);

    session.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_readers_at_different_offsets() {
    let session = SimulatedSession::new(test_config(), SimulationConfig::instant());
    let content = session.swarm().register(layered_content());
    let torrent = session
        .server()
        .open_torrent(TorrentSpec::new(content.info_hash()))
        .await
        .unwrap();

    let front = torrent.new_reader(1).unwrap();
    let middle = torrent.new_reader(1).unwrap();
    middle.seek(SeekFrom::Start(12 * MIB)).await.unwrap();

    let (front_data, middle_data) = futures::join!(
        read_exact(&front, 2 * MIB as usize),
        read_exact(&middle, 2 * MIB as usize)
    );

    let movie = content.file_data(1);
    assert!(front_data[..] == movie[..2 * MIB as usize]);
    assert!(middle_data[..] == movie[12 * MIB as usize..14 * MIB as usize]);
    assert_eq!(torrent.cache().unwrap().readers_count(), 2);

    // Both readers are in use, so neither may be closed away.
    assert!(!session.server().remove_torrent(torrent.hash()));

    torrent.close_reader(&front).await;
    torrent.close_reader(&middle).await;
    assert!(session.server().remove_torrent(torrent.hash()));
    assert_eq!(torrent.stat(), TorrentStat::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_preload_warms_head_and_tail() {
    let mut config = test_config();
    config.cache.cache_size = 24 * MIB;
    let session = SimulatedSession::new(config, SimulationConfig::instant());
    let content = session.swarm().register(SimulatedContent::single_file(
        "sintel.mp4",
        24 * MIB,
        PIECE,
        3,
    ));
    let torrent = session
        .server()
        .open_torrent(TorrentSpec::new(content.info_hash()))
        .await
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(60),
        session.server().preload(&torrent, 0),
    )
    .await
    .unwrap()
    .unwrap();

    let status = torrent.status();
    assert_eq!(status.stat, TorrentStat::Working);
    assert_eq!(status.preload_size, 12 * MIB);
    // 4 MiB of head, the rest of the budget on the 8 MiB tail block.
    assert!(status.bytes_read >= 12 * MIB);
    assert!(status.preloaded_bytes > 0);
    assert_eq!(torrent.cache().unwrap().readers_count(), 0);

    session.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_preload_stops_when_torrent_closes() {
    let simulation = SimulationConfig {
        download_rate_bps: 512 * KIB,
        ..SimulationConfig::instant()
    };
    let session = SimulatedSession::new(test_config(), simulation);
    let content = session.swarm().register(SimulatedContent::single_file(
        "sintel.mp4",
        24 * MIB,
        PIECE,
        3,
    ));
    let torrent = session
        .server()
        .open_torrent(TorrentSpec::new(content.info_hash()))
        .await
        .unwrap();

    let server = Arc::clone(session.server());
    let preloading = Arc::clone(&torrent);
    let task = tokio::spawn(async move { server.preload(&preloading, 0).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(torrent.stat(), TorrentStat::Preload);

    session.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("preload did not stop after close")
        .unwrap();
    assert!(matches!(result, Ok(()) | Err(TorrentError::Closed { .. })));
    assert_eq!(torrent.stat(), TorrentStat::Closed);
    assert!(torrent.cache().is_none());
}

#[tokio::test]
async fn test_unknown_torrent_times_out() {
    let session = SimulatedSession::new(test_config(), SimulationConfig::instant());
    let spec = TorrentSpec::new(InfoHash::new([0x5a; 20]));

    let result = session.server().open_torrent(spec).await;

    assert!(matches!(result, Err(TorrentError::MetadataTimeout { .. })));
    assert!(session.server().list_torrents().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disk_cache_survives_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.cache.use_disk = true;
    config.cache.save_path = dir.path().to_path_buf();
    config.cache.cache_size = 64 * MIB;
    let content = SimulatedContent::single_file("tears.mkv", 8 * MIB, PIECE, 5);
    let spec = TorrentSpec::new(content.info_hash());

    {
        let session = SimulatedSession::new(config.clone(), SimulationConfig::instant());
        session.swarm().register(content.clone());
        let torrent = session.server().open_torrent(spec.clone()).await.unwrap();
        let reader = torrent.new_reader(0).unwrap();
        read_exact(&reader, MIB as usize).await;
        session.shutdown();
    }

    let session = SimulatedSession::new(config, SimulationConfig::instant());
    session.swarm().register(content.clone());
    let torrent = session.server().open_torrent(spec).await.unwrap();

    let state = torrent.cache().unwrap().state();
    for id in 0..4 {
        let piece = state.pieces.get(&id).expect("piece recovered from disk");
        assert!(piece.completed);
        assert_eq!(piece.size, PIECE);
    }

    let reader = torrent.new_reader(0).unwrap();
    let data = read_exact(&reader, MIB as usize).await;
    assert!(data[..] == content.data()[..MIB as usize]);
    torrent.close_reader(&reader).await;
    session.shutdown();
}
