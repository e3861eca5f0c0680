//! Integration tests for the session engine.
//!
//! Every scenario runs real peer connections over loopback TCP: the session
//! under test talks to `SimulatedSeed` peers or to a second session.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nitro_torrent_core::config::EngineConfig;
use nitro_torrent_core::discovery::StaticDiscovery;
use nitro_torrent_core::storage::ResumeStore;
use nitro_torrent_core::storage::test_fixtures::create_temp_storage_dirs;
use nitro_torrent_core::testing::{SimulatedSeed, TorrentFixture};
use nitro_torrent_core::torrent::{Bitfield, PieceIndex};
use nitro_torrent_core::{
    PeerId, SessionHandle, TorrentError, TorrentSnapshot, TorrentStatus, spawn_session,
};

const PIECE_SIZE: u32 = 32 * 1024;
const WAIT: Duration = Duration::from_secs(20);

/// Three pieces spread over two files.
fn three_piece_fixture() -> TorrentFixture {
    TorrentFixture::multi_file("album", &[("one.bin", 40_000), ("two.bin", 50_000)], PIECE_SIZE)
        .unwrap()
}

async fn start_session(state_dir: &Path, peers: Vec<SocketAddr>) -> SessionHandle {
    start_session_with(EngineConfig::for_testing().with_state_dir(state_dir), peers).await
}

async fn start_session_with(config: EngineConfig, peers: Vec<SocketAddr>) -> SessionHandle {
    spawn_session(
        config,
        PeerId::generate("-NT0001-"),
        Arc::new(StaticDiscovery::new(peers)),
    )
    .await
    .unwrap()
}

/// Polls `get_torrent` until `done` holds, panicking after `WAIT`.
async fn wait_for(
    handle: &SessionHandle,
    id: &str,
    what: &str,
    done: impl Fn(&TorrentSnapshot) -> bool,
) -> TorrentSnapshot {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let snapshot = handle.get_torrent(id).await.unwrap();
        if done(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}: {snapshot:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for_status(
    handle: &SessionHandle,
    id: &str,
    status: TorrentStatus,
) -> TorrentSnapshot {
    wait_for(handle, id, status.as_str(), |snapshot| snapshot.status == status).await
}

#[tokio::test]
async fn test_complementary_seeds_complete_download() {
    let fixture = three_piece_fixture();
    let first = SimulatedSeed::builder()
        .pieces([0, 1])
        .spawn(&fixture)
        .await
        .unwrap();
    let second = SimulatedSeed::builder()
        .pieces([2])
        .spawn(&fixture)
        .await
        .unwrap();

    let (_dir, downloads, state) = create_temp_storage_dirs();
    let handle = start_session(&state, vec![first.addr(), second.addr()]).await;
    let id = handle
        .add_torrent_bytes(fixture.torrent_bytes(), downloads.clone())
        .await
        .unwrap();
    assert_eq!(id, fixture.id());

    wait_for_status(&handle, &id, TorrentStatus::Downloading).await;
    let done = wait_for_status(&handle, &id, TorrentStatus::Seeding).await;

    assert_eq!(done.progress, 1.0);
    assert_eq!(done.downloaded_bytes, 90_000);
    assert_eq!(done.total_bytes, 90_000);
    assert!(done.total_downloaded >= 90_000);
    assert!(fixture.matches_on_disk(&downloads).await);
    assert!(first.blocks_served() > 0);
    assert!(second.blocks_served() > 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_magnet_link_resolves_and_downloads() {
    let fixture = three_piece_fixture();
    let seed = SimulatedSeed::full(&fixture).await.unwrap();

    let (_dir, downloads, state) = create_temp_storage_dirs();
    let handle = start_session(&state, Vec::new()).await;
    let id = handle
        .add_magnet_link(&fixture.magnet_link(&[seed.addr()]), downloads.clone())
        .await
        .unwrap();

    let done = wait_for_status(&handle, &id, TorrentStatus::Seeding).await;
    assert_eq!(done.name, "album");
    assert_eq!(done.progress, 1.0);
    assert!(fixture.matches_on_disk(&downloads).await);
}

#[tokio::test]
async fn test_magnet_without_metadata_peers_errors() {
    let fixture = three_piece_fixture();
    let seed = SimulatedSeed::builder()
        .serve_metadata(false)
        .spawn(&fixture)
        .await
        .unwrap();

    let (_dir, downloads, state) = create_temp_storage_dirs();
    let handle = start_session(&state, Vec::new()).await;
    let id = handle
        .add_magnet_link(&fixture.magnet_link(&[seed.addr()]), downloads)
        .await
        .unwrap();

    let failed = wait_for_status(&handle, &id, TorrentStatus::Error).await;
    assert!(failed.error.is_some());
    assert_eq!(failed.progress, 0.0);
}

/// Verified bitmap and payload total as persisted for `id`.
async fn saved_progress(handle: &SessionHandle, state: &Path, id: &str) -> (Vec<u8>, u64) {
    handle.save_resume_data().await.unwrap();
    let suffix = EngineConfig::for_testing().storage.temp_file_suffix;
    let record = ResumeStore::new(state, suffix)
        .load_all()
        .await
        .into_iter()
        .find(|record| record.info_hash == id)
        .unwrap();
    (record.verified.into_vec(), record.downloaded)
}

#[tokio::test]
async fn test_pause_and_resume_keep_verified_pieces() {
    let fixture = three_piece_fixture();
    let seed = SimulatedSeed::builder()
        .pieces([0])
        .spawn(&fixture)
        .await
        .unwrap();

    let (_dir, downloads, state) = create_temp_storage_dirs();
    let handle = start_session(&state, vec![seed.addr()]).await;
    let id = handle
        .add_torrent_bytes(fixture.torrent_bytes(), downloads)
        .await
        .unwrap();

    let piece = u64::from(PIECE_SIZE);
    let partial = wait_for(&handle, &id, "first piece", |snapshot| {
        snapshot.downloaded_bytes == piece && snapshot.total_downloaded == piece
    })
    .await;
    assert_eq!(partial.status, TorrentStatus::Downloading);

    let mut only_first = Bitfield::new(3);
    only_first.set(PieceIndex::new(0));
    let before = saved_progress(&handle, &state, &id).await;
    assert_eq!(before, (only_first.to_bytes().to_vec(), piece));

    handle.pause_torrent(&id).await.unwrap();
    let paused = handle.get_torrent(&id).await.unwrap();
    assert_eq!(paused.status, TorrentStatus::Paused);
    assert!(paused.paused);
    assert_eq!(paused.downloaded_bytes, partial.downloaded_bytes);
    assert_eq!(paused.total_downloaded, partial.total_downloaded);
    assert_eq!(paused.progress, partial.progress);
    assert_eq!(paused.peer_count, 0);
    assert!(handle.get_torrent_peers(&id).await.unwrap().is_empty());
    assert_eq!(saved_progress(&handle, &state, &id).await, before);

    handle.resume_torrent(&id).await.unwrap();
    let resumed = handle.get_torrent(&id).await.unwrap();
    assert_eq!(resumed.status, TorrentStatus::Downloading);
    assert_eq!(resumed.downloaded_bytes, partial.downloaded_bytes);
    assert_eq!(resumed.total_downloaded, partial.total_downloaded);

    let peers = wait_for(&handle, &id, "reconnect", |snapshot| snapshot.peer_count > 0).await;
    assert_eq!(peers.downloaded_bytes, partial.downloaded_bytes);
    assert_eq!(peers.total_downloaded, partial.total_downloaded);
    assert_eq!(saved_progress(&handle, &state, &id).await, before);
    let listed = handle.get_torrent_peers(&id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].endpoint, seed.addr().to_string());
}

#[tokio::test]
async fn test_disk_failure_during_download_errors() {
    let fixture = three_piece_fixture();
    let seed = SimulatedSeed::full(&fixture).await.unwrap();

    let (_dir, downloads, state) = create_temp_storage_dirs();
    let mut config = EngineConfig::for_testing().with_state_dir(&state);
    config.network.listen_port = Some(0);
    let handle = start_session_with(config, Vec::new()).await;
    let id = handle
        .add_torrent_bytes(fixture.torrent_bytes(), downloads.clone())
        .await
        .unwrap();
    wait_for_status(&handle, &id, TorrentStatus::Downloading).await;

    // Allocated, but the first file can no longer be written
    let blocked = downloads.join(&fixture.info().files[0].path);
    std::fs::remove_file(&blocked).unwrap();
    std::fs::create_dir(&blocked).unwrap();

    let port = handle.listen_addr().unwrap().port();
    seed.connect_to(([127, 0, 0, 1], port).into()).await.unwrap();

    let failed = wait_for_status(&handle, &id, TorrentStatus::Error).await;
    assert!(failed.error.is_some());
    assert_eq!(failed.peer_count, 0);
    assert!(seed.connections() >= 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_removes_files_and_entry() {
    let fixture = three_piece_fixture();
    let seed = SimulatedSeed::full(&fixture).await.unwrap();

    let (_dir, downloads, state) = create_temp_storage_dirs();
    let handle = start_session(&state, vec![seed.addr()]).await;
    let id = handle
        .add_torrent_bytes(fixture.torrent_bytes(), downloads.clone())
        .await
        .unwrap();
    wait_for_status(&handle, &id, TorrentStatus::Seeding).await;
    assert!(downloads.join("album").join("one.bin").exists());

    handle.delete_torrent(&id).await.unwrap();

    assert!(!downloads.join("album").join("one.bin").exists());
    assert!(!downloads.join("album").join("two.bin").exists());
    assert!(matches!(
        handle.get_torrent(&id).await,
        Err(TorrentError::NotFound { .. })
    ));
    assert!(handle.get_torrents().await.is_empty());
    assert!(matches!(
        handle.delete_torrent(&id).await,
        Err(TorrentError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_cancel_keeps_entry_and_files() {
    let fixture = three_piece_fixture();
    let seed = SimulatedSeed::builder()
        .pieces([1])
        .spawn(&fixture)
        .await
        .unwrap();

    let (_dir, downloads, state) = create_temp_storage_dirs();
    let handle = start_session(&state, vec![seed.addr()]).await;
    let id = handle
        .add_torrent_bytes(fixture.torrent_bytes(), downloads.clone())
        .await
        .unwrap();
    wait_for(&handle, &id, "one piece", |snapshot| snapshot.downloaded_bytes > 0).await;

    handle.cancel_torrent(&id).await.unwrap();
    let canceled = handle.get_torrent(&id).await.unwrap();
    assert_eq!(canceled.status, TorrentStatus::Canceled);
    assert_eq!(canceled.peer_count, 0);
    assert!(downloads.join("album").join("two.bin").exists());

    // Lifecycle controls on a canceled torrent change nothing
    handle.pause_torrent(&id).await.unwrap();
    handle.resume_torrent(&id).await.unwrap();
    assert_eq!(
        handle.get_torrent(&id).await.unwrap().status,
        TorrentStatus::Canceled
    );
}

#[tokio::test]
async fn test_corrupt_peer_does_not_poison_download() {
    // One block per piece, so every failed piece blames a single peer
    let fixture =
        TorrentFixture::multi_file("album", &[("one.bin", 40_000), ("two.bin", 50_000)], 16 * 1024)
            .unwrap();
    let liar = SimulatedSeed::builder()
        .corrupt(true)
        .spawn(&fixture)
        .await
        .unwrap();
    let honest = SimulatedSeed::full(&fixture).await.unwrap();

    let (_dir, downloads, state) = create_temp_storage_dirs();
    let handle = start_session(&state, vec![liar.addr(), honest.addr()]).await;
    let id = handle
        .add_torrent_bytes(fixture.torrent_bytes(), downloads.clone())
        .await
        .unwrap();

    let done = wait_for_status(&handle, &id, TorrentStatus::Seeding).await;
    assert_eq!(done.downloaded_bytes, 90_000);
    assert!(fixture.matches_on_disk(&downloads).await);
    assert!(honest.blocks_served() >= 6);
}

#[tokio::test]
async fn test_two_sessions_transfer_over_listener() {
    let fixture = three_piece_fixture();

    let (_seed_dir, seed_downloads, seed_state) = create_temp_storage_dirs();
    fixture.write_to(&seed_downloads).await.unwrap();
    let mut seeder_config = EngineConfig::for_testing().with_state_dir(&seed_state);
    seeder_config.network.listen_port = Some(0);
    let seeder = start_session_with(seeder_config, Vec::new()).await;
    let seeder_port = seeder.listen_addr().unwrap().port();

    let id = seeder
        .add_torrent_bytes(fixture.torrent_bytes(), seed_downloads)
        .await
        .unwrap();
    let seeding = wait_for_status(&seeder, &id, TorrentStatus::Seeding).await;
    assert_eq!(seeding.progress, 1.0);

    let (_dir, downloads, state) = create_temp_storage_dirs();
    let seeder_addr: SocketAddr = ([127, 0, 0, 1], seeder_port).into();
    let leecher = start_session(&state, vec![seeder_addr]).await;
    leecher
        .add_torrent_bytes(fixture.torrent_bytes(), downloads.clone())
        .await
        .unwrap();

    wait_for_status(&leecher, &id, TorrentStatus::Seeding).await;
    assert!(fixture.matches_on_disk(&downloads).await);

    let uploaded = wait_for(&seeder, &id, "upload total", |snapshot| {
        snapshot.total_uploaded >= 90_000
    })
    .await;
    assert_eq!(uploaded.status, TorrentStatus::Seeding);

    leecher.shutdown().await.unwrap();
    seeder.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_restores_from_resume_data() {
    let fixture = three_piece_fixture();
    let (_dir, downloads, state) = create_temp_storage_dirs();

    let id = {
        let seed = SimulatedSeed::full(&fixture).await.unwrap();
        let handle = start_session(&state, vec![seed.addr()]).await;
        let id = handle
            .add_torrent_bytes(fixture.torrent_bytes(), downloads.clone())
            .await
            .unwrap();
        wait_for_status(&handle, &id, TorrentStatus::Seeding).await;
        handle.shutdown().await.unwrap();
        id
    };
    assert!(state.join("resume").join(format!("{id}.resume")).is_file());

    let restarted = start_session(&state, Vec::new()).await;
    let torrents = restarted.get_torrents().await;
    assert_eq!(torrents.len(), 1);
    assert_eq!(torrents[0].id, id);

    let restored = wait_for_status(&restarted, &id, TorrentStatus::Seeding).await;
    assert_eq!(restored.progress, 1.0);
    assert!(restored.total_downloaded >= 90_000);
}

#[tokio::test]
async fn test_restart_keeps_paused_torrents_paused() {
    let fixture = three_piece_fixture();
    let (_dir, downloads, state) = create_temp_storage_dirs();

    let handle = start_session(&state, Vec::new()).await;
    let id = handle
        .add_torrent_bytes(fixture.torrent_bytes(), downloads)
        .await
        .unwrap();
    wait_for_status(&handle, &id, TorrentStatus::Downloading).await;
    handle.pause_torrent(&id).await.unwrap();
    handle.shutdown().await.unwrap();

    let restarted = start_session(&state, Vec::new()).await;
    let restored = wait_for_status(&restarted, &id, TorrentStatus::Paused).await;
    assert_eq!(restored.name, "album");
    assert_eq!(restored.downloaded_bytes, 0);
}

#[tokio::test]
async fn test_empty_session_has_no_torrents() {
    let (_dir, _downloads, state) = create_temp_storage_dirs();
    let handle = start_session(&state, Vec::new()).await;
    assert!(handle.get_torrents().await.is_empty());
    handle.save_resume_data().await.unwrap();
    handle.shutdown().await.unwrap();
    assert!(handle.get_torrents().await.is_empty());
}
