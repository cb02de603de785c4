//! Torrent server lifecycle across the engine, storage and catalog.

use std::sync::Arc;

use undertow_core::UndertowConfig;
use undertow_core::storage::Storage;
use undertow_core::swarm::test_mocks::{MockSwarmEngine, MockSwarmTorrent};
use undertow_core::swarm::{FileEntry, InfoHash, SwarmEngine, TorrentInfo, TorrentSpec};
use undertow_core::torrent::{MemoryCatalog, TorrentServer, TorrentStat};

const KIB: u64 = 1 << 10;

fn info() -> TorrentInfo {
    TorrentInfo {
        name: "Cosmos Laundromat".to_string(),
        piece_length: 16 * KIB,
        piece_count: 8,
        files: vec![FileEntry {
            index: 0,
            path: "cosmos.mp4".to_string(),
            offset: 0,
            length: 128 * KIB,
        }],
    }
}

fn seeded_torrent(hash: InfoHash) -> Arc<MockSwarmTorrent> {
    let torrent = Arc::new(MockSwarmTorrent::with_info(hash, info()));
    torrent.set_content((0..128 * KIB).map(|i| (i % 251) as u8).collect());
    torrent
}

#[tokio::test]
async fn test_save_remove_attach_round_trip() {
    let hash = InfoHash::new([0x21; 20]);
    let engine = Arc::new(MockSwarmEngine::new());
    engine.register(seeded_torrent(hash));
    let storage = Arc::new(Storage::new(UndertowConfig::for_testing()));
    let server = TorrentServer::new(
        Arc::clone(&engine) as Arc<dyn SwarmEngine>,
        Arc::clone(&storage),
        Arc::new(MemoryCatalog::new()),
    );

    let torrent = server.open_torrent(TorrentSpec::new(hash)).await.unwrap();
    assert_eq!(torrent.stat(), TorrentStat::Working);
    assert!(storage.get_cache(hash).is_some());

    let reader = torrent.new_reader(0).unwrap();
    let mut buf = vec![0u8; 4 * KIB as usize];
    assert_eq!(reader.read(&mut buf).await.unwrap(), buf.len());
    torrent.close_reader(&reader).await;

    server.save_torrent(&torrent);
    assert!(server.remove_torrent(hash));
    assert!(storage.get_cache(hash).is_none());

    let listed = server.list_torrents();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].stat, TorrentStat::InDb);
    assert_eq!(listed[0].title, "Cosmos Laundromat");

    // A fresh engine session for the same torrent.
    engine.register(seeded_torrent(hash));
    let attached = server.attach(hash).await.unwrap();
    assert_eq!(attached.stat(), TorrentStat::Working);
    assert_eq!(attached.status().title, "Cosmos Laundromat");
    assert_eq!(server.list_torrents().len(), 1);

    assert!(server.drop_torrent(hash));
    assert!(server.list_torrents().is_empty());
}
