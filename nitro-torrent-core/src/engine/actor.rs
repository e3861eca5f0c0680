//! Actor implementation for the session engine.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::commands::{InternalEvent, SessionCommand};
use super::core::SessionCore;
use super::handle::SessionHandle;
use super::listener;
use crate::config::EngineConfig;
use crate::discovery::{CompositeDiscovery, DiscoveryProvider, HttpTrackerDiscovery, StaticDiscovery};
use crate::torrent::{PeerId, SwarmNotice, TorrentError};

/// Spawns a session with HTTP tracker discovery plus a fixed peer list.
///
/// # Errors
/// - `TorrentError::Io` - Listen port unavailable
/// - `TorrentError::InvalidArgument` - Tracker client cannot be built
pub async fn spawn_default_session(
    config: EngineConfig,
    static_peers: Vec<SocketAddr>,
) -> Result<SessionHandle, TorrentError> {
    let peer_id = PeerId::generate(config.torrent.client_id);
    let trackers = Arc::new(HttpTrackerDiscovery::new(&config.network, peer_id)?);
    let providers: Vec<Arc<dyn DiscoveryProvider>> = vec![
        trackers.clone(),
        Arc::new(StaticDiscovery::new(static_peers)),
    ];
    let discovery = Arc::new(CompositeDiscovery::new(
        providers,
        config.network.discovery_timeout,
    ));

    let handle = spawn_session(config, peer_id, discovery).await?;
    if let Some(addr) = handle.listen_addr() {
        trackers.set_listen_port(addr.port());
    }
    Ok(handle)
}

/// Spawns the session actor and returns its handle.
///
/// Binds the incoming-connection listener when configured, restores
/// torrents from resume data, then processes commands one at a time.
///
/// # Errors
/// - `TorrentError::Io` - Listen port unavailable
pub async fn spawn_session(
    config: EngineConfig,
    peer_id: PeerId,
    discovery: Arc<dyn DiscoveryProvider>,
) -> Result<SessionHandle, TorrentError> {
    let config = Arc::new(config);
    let (sender, receiver) = mpsc::channel(100);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (notices_tx, notices_rx) = mpsc::unbounded_channel();

    let (listen_addr, listener_task) = match config.network.listen_port {
        Some(port) => {
            let socket = listener::bind(port).await?;
            let addr = socket.local_addr()?;
            tracing::info!(%addr, "Listening for peers");
            let task = tokio::spawn(listener::run_listener(
                socket,
                internal_tx.clone(),
                config.network.handshake_timeout,
            ));
            (Some(addr), Some(task))
        }
        None => (None, None),
    };

    let mut core = SessionCore::new(
        config.clone(),
        peer_id,
        discovery,
        listen_addr.map(|addr| addr.port()),
        internal_tx,
        notices_tx,
    );
    core.restore().await;

    tokio::spawn(run_actor_loop(
        core,
        config,
        receiver,
        internal_rx,
        notices_rx,
        listener_task,
    ));

    Ok(SessionHandle::new(sender, listen_addr))
}

/// Runs the main actor message processing loop.
///
/// Stops on `Shutdown` or when every handle is dropped; both paths flush
/// resume data and close all connections.
async fn run_actor_loop(
    mut core: SessionCore,
    config: Arc<EngineConfig>,
    mut receiver: mpsc::Receiver<SessionCommand>,
    mut internal: mpsc::UnboundedReceiver<InternalEvent>,
    mut notices: mpsc::UnboundedReceiver<SwarmNotice>,
    listener_task: Option<JoinHandle<()>>,
) {
    tracing::debug!("Session actor started");
    let period = config.storage.resume_save_interval;
    let mut save_tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    save_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(command) => {
                    if !handle_command(&mut core, command).await {
                        break;
                    }
                }
                None => break,
            },
            Some(event) = internal.recv() => core.handle_internal(event).await,
            Some(notice) = notices.recv() => core.on_swarm_notice(notice).await,
            _ = save_tick.tick() => {
                if let Err(e) = core.save_resume_data().await {
                    tracing::warn!(error = %e, "Periodic resume save failed");
                }
            }
        }
    }

    if let Some(task) = listener_task {
        task.abort();
    }
    core.shutdown().await;
    tracing::debug!("Session actor stopped");
}

/// Handles a single command. Returns false to stop the actor.
async fn handle_command(core: &mut SessionCore, command: SessionCommand) -> bool {
    match command {
        SessionCommand::AddMagnet {
            magnet_link,
            download_path,
            responder,
        } => {
            let result = core.add_magnet(&magnet_link, download_path).await;
            let _ = responder.send(result);
        }

        SessionCommand::AddTorrentBytes {
            bytes,
            download_path,
            responder,
        } => {
            let result = core.add_torrent_bytes(bytes, download_path).await;
            let _ = responder.send(result);
        }

        SessionCommand::Pause { id, responder } => {
            let _ = responder.send(core.pause(&id).await);
        }

        SessionCommand::Resume { id, responder } => {
            let _ = responder.send(core.resume(&id).await);
        }

        SessionCommand::Cancel { id, responder } => {
            let _ = responder.send(core.cancel(&id).await);
        }

        SessionCommand::Delete { id, responder } => {
            let _ = responder.send(core.delete(&id).await);
        }

        SessionCommand::GetTorrent { id, responder } => {
            let _ = responder.send(core.get_torrent(&id));
        }

        SessionCommand::GetTorrents { responder } => {
            let _ = responder.send(core.get_torrents());
        }

        SessionCommand::GetTorrentPeers { id, responder } => {
            let _ = responder.send(core.get_torrent_peers(&id).await);
        }

        SessionCommand::SaveResumeData { responder } => {
            let _ = responder.send(core.save_resume_data().await);
        }

        SessionCommand::Shutdown { responder } => {
            core.shutdown().await;
            let _ = responder.send(());
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::storage::test_fixtures::create_temp_storage_dirs;
    use crate::torrent::TorrentCreator;

    async fn session(state: &std::path::Path) -> SessionHandle {
        let config = EngineConfig::for_testing().with_state_dir(state);
        spawn_session(
            config,
            PeerId::generate("-NT0001-"),
            Arc::new(StaticDiscovery::default()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_empty_session_lists_nothing() {
        let (_dir, _downloads, state) = create_temp_storage_dirs();
        let handle = session(&state).await;
        assert!(handle.get_torrents().await.is_empty());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let (_dir, _downloads, state) = create_temp_storage_dirs();
        let handle = session(&state).await;
        let id = "00".repeat(20);

        for result in [
            handle.pause_torrent(&id).await,
            handle.resume_torrent(&id).await,
            handle.cancel_torrent(&id).await,
            handle.delete_torrent(&id).await,
        ] {
            assert!(matches!(result, Err(TorrentError::NotFound { .. })));
        }
        assert!(matches!(
            handle.get_torrent(&id).await,
            Err(TorrentError::NotFound { .. })
        ));
        assert!(matches!(
            handle.get_torrent_peers(&id).await,
            Err(TorrentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_validation() {
        let (_dir, downloads, state) = create_temp_storage_dirs();
        let handle = session(&state).await;

        let result = handle
            .add_magnet_link("not a magnet", downloads.clone())
            .await;
        assert!(matches!(result, Err(TorrentError::InvalidArgument { .. })));

        let magnet = format!("magnet:?xt=urn:btih:{}", "ab".repeat(20));
        let result = handle.add_magnet_link(&magnet, PathBuf::new()).await;
        assert!(matches!(result, Err(TorrentError::InvalidArgument { .. })));

        let result = handle
            .add_torrent_bytes(b"not bencode".to_vec(), downloads)
            .await;
        assert!(matches!(result, Err(TorrentError::InvalidMetadata { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_add_is_rejected_until_canceled() {
        let (_dir, downloads, state) = create_temp_storage_dirs();
        let handle = session(&state).await;
        let bytes = TorrentCreator::with_piece_size(16)
            .build_single_file("dup.bin", &[1u8; 40])
            .unwrap();

        let id = handle
            .add_torrent_bytes(bytes.clone(), downloads.clone())
            .await
            .unwrap();
        let again = handle
            .add_torrent_bytes(bytes.clone(), downloads.clone())
            .await;
        assert!(matches!(again, Err(TorrentError::DuplicateTorrent { .. })));

        handle.cancel_torrent(&id).await.unwrap();
        assert_eq!(
            handle.get_torrent(&id).await.unwrap().status.as_str(),
            "canceled"
        );
        let replaced = handle.add_torrent_bytes(bytes, downloads).await.unwrap();
        assert_eq!(replaced, id);
        assert_eq!(handle.get_torrents().await.len(), 1);
    }

    #[tokio::test]
    async fn test_magnet_without_name_uses_id() {
        let (_dir, downloads, state) = create_temp_storage_dirs();
        let handle = session(&state).await;
        let magnet = format!("magnet:?xt=urn:btih:{}", "cd".repeat(20));

        let id = handle.add_magnet_link(&magnet, downloads).await.unwrap();
        assert_eq!(id, "cd".repeat(20));
        let snapshot = handle.get_torrent(&id).await.unwrap();
        assert_eq!(snapshot.name, id);
        assert_eq!(snapshot.status.as_str(), "resolving");
    }

    #[tokio::test]
    async fn test_shutdown_stops_handle() {
        let (_dir, _downloads, state) = create_temp_storage_dirs();
        let handle = session(&state).await;
        handle.shutdown().await.unwrap();

        let result = handle.get_torrent("x").await;
        assert!(matches!(result, Err(TorrentError::EngineShutdown)));
    }
}
