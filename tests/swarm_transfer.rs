//! Two swarm managers on localhost: one seeding, one downloading.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use swarm_torrent::bencode::{encode, Value};
use swarm_torrent::{
    ClientConfig, DiskProvider, PeerInfo, PeerSource, PieceStore, SwarmManager, TorrentInfo, TorrentParser,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const PIECE_LENGTH: usize = 32 * 1024;

fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + seed as usize) % 251) as u8).collect()
}

fn piece_hashes(data: &[u8]) -> Vec<u8> {
    data.chunks(PIECE_LENGTH).flat_map(|chunk| Sha1::digest(chunk).to_vec()).collect()
}

fn metainfo(info: Value) -> TorrentInfo {
    let root = Value::dict([("announce", Value::from("http://127.0.0.1:1/announce")), ("info", info)]);
    TorrentParser::parse_bytes(&encode(&root)).unwrap()
}

fn single_file_torrent(data: &[u8]) -> TorrentInfo {
    metainfo(Value::dict([
        ("length", Value::from(data.len() as i64)),
        ("name", Value::from("payload.bin")),
        ("piece length", Value::from(PIECE_LENGTH as i64)),
        ("pieces", Value::from(piece_hashes(data))),
    ]))
}

fn multi_file_torrent(files: &[(&[&str], &[u8])]) -> TorrentInfo {
    let joined: Vec<u8> = files.iter().flat_map(|(_, data)| data.to_vec()).collect();
    let entries: Vec<Value> = files
        .iter()
        .map(|(path, data)| {
            Value::dict([
                ("length", Value::from(data.len() as i64)),
                ("path", Value::list(path.iter().copied())),
            ])
        })
        .collect();

    metainfo(Value::dict([
        ("files", Value::from(entries)),
        ("name", Value::from("bundle")),
        ("piece length", Value::from(PIECE_LENGTH as i64)),
        ("pieces", Value::from(piece_hashes(&joined))),
    ]))
}

struct Running {
    store: Arc<PieceStore>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

fn spawn(mut manager: SwarmManager) -> Running {
    let store = manager.store().clone();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        manager
            .run(async {
                let _ = stopped.await;
            })
            .await
    });
    Running { store, stop, task }
}

async fn open_store(torrent: &TorrentInfo, dir: &Path) -> Arc<PieceStore> {
    let store = PieceStore::from_torrent(torrent, dir, &DiskProvider).unwrap();
    store.verify_all().unwrap();
    Arc::new(store)
}

/// Seed from `seed_dir`, download into `leech_dir`, wait for completion
async fn transfer(torrent: TorrentInfo, seed_dir: &Path, leech_dir: &Path) {
    let torrent = Arc::new(torrent);

    let seed_store = open_store(&torrent, seed_dir).await;
    assert!(seed_store.is_complete());
    let seed_config = ClientConfig { listen_port: 0, ..Default::default() };
    let mut seeder = SwarmManager::new(torrent.clone(), seed_store, Arc::new(seed_config), Vec::new());
    let bound = seeder.listen().await.unwrap();
    let seed_addr = SocketAddr::from(([127, 0, 0, 1], bound.port()));

    let leech_store = open_store(&torrent, leech_dir).await;
    assert_eq!(leech_store.missing_count(), torrent.piece_count());
    let leech_config = ClientConfig { accept_inbound: false, ..Default::default() };
    let mut leecher = SwarmManager::new(torrent.clone(), leech_store, Arc::new(leech_config), Vec::new());
    assert_eq!(leecher.add_peers([PeerInfo::new(seed_addr, PeerSource::Manual)]), 1);

    let seeder = spawn(seeder);
    let leecher = spawn(leecher);

    let done = tokio::time::timeout(Duration::from_secs(30), async {
        while !leecher.store.is_complete() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(done.is_ok(), "download did not finish: {}", leecher.store);

    for block in 0..torrent.piece_count() {
        assert!(leecher.store.verify_block(block, true).unwrap());
    }

    for node in [leecher, seeder] {
        node.stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(15), node.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_single_file_transfer() {
    let data = content(3 * PIECE_LENGTH + 1000, 7);
    let torrent = single_file_torrent(&data);

    let seed_dir = tempfile::tempdir().unwrap();
    std::fs::write(seed_dir.path().join("payload.bin"), &data).unwrap();
    let leech_dir = tempfile::tempdir().unwrap();

    transfer(torrent, seed_dir.path(), leech_dir.path()).await;

    let downloaded = std::fs::read(leech_dir.path().join("payload.bin")).unwrap();
    assert_eq!(downloaded, data);
}

#[tokio::test]
async fn test_multi_file_transfer() {
    let first = content(50_000, 1);
    let second = content(30_000, 2);
    let torrent = multi_file_torrent(&[(&["a.bin"], &first), (&["sub", "b.bin"], &second)]);
    assert_eq!(torrent.piece_count(), 3);

    let seed_dir = tempfile::tempdir().unwrap();
    let root = seed_dir.path().join("bundle");
    std::fs::create_dir_all(root.join("sub")).unwrap();
    std::fs::write(root.join("a.bin"), &first).unwrap();
    std::fs::write(root.join("sub").join("b.bin"), &second).unwrap();
    let leech_dir = tempfile::tempdir().unwrap();

    transfer(torrent, seed_dir.path(), leech_dir.path()).await;

    let bundle = leech_dir.path().join("bundle");
    assert_eq!(std::fs::read(bundle.join("a.bin")).unwrap(), first);
    assert_eq!(std::fs::read(bundle.join("sub").join("b.bin")).unwrap(), second);
}
