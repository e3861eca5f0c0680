//! Session state owned by the actor: the torrent registry and its lifecycle rules.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_bytes::ByteBuf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::commands::{InternalEvent, Prepared};
use super::snapshot::TorrentSnapshot;
use super::torrent::{ManagedTorrent, TorrentOrigin, TorrentStatus};
use crate::config::EngineConfig;
use crate::discovery::DiscoveryProvider;
use crate::network::BandwidthLimiter;
use crate::storage::piece_store::remove_torrent_files;
use crate::storage::{PieceStore, ResumeData, ResumeStore, StorageError};
use crate::torrent::parsing::{BencodeTorrentParser, MagnetParser};
use crate::torrent::{
    Bitfield, InfoHash, MetadataResolver, MetadataSource, PeerHandshake, PeerId, PeerSnapshot,
    SwarmNotice, SwarmParams, TorrentError, TorrentInfo, TransferCounters, spawn_swarm,
};

const STATE_ACTIVE: &str = "active";
const STATE_PAUSED: &str = "paused";
const STATE_CANCELED: &str = "canceled";

/// What preparation starts from.
enum PrepareInput {
    Magnet(MetadataSource),
    Info {
        info: Arc<TorrentInfo>,
        trackers: Vec<String>,
    },
}

/// Shared parts every swarm of this session is started with.
struct SwarmEnv {
    our_id: PeerId,
    discovery: Arc<dyn DiscoveryProvider>,
    limiter: BandwidthLimiter,
    config: Arc<EngineConfig>,
    listen_port: Option<u16>,
    notices: mpsc::UnboundedSender<SwarmNotice>,
}

impl SwarmEnv {
    fn start(&self, torrent: &mut ManagedTorrent) {
        let Some(store) = torrent.store.clone() else {
            return;
        };
        if torrent.swarm.is_some() {
            return;
        }
        torrent.swarm = Some(spawn_swarm(SwarmParams {
            info_hash: torrent.info_hash,
            our_id: self.our_id,
            store,
            discovery: self.discovery.clone(),
            limiter: self.limiter.clone(),
            config: self.config.clone(),
            listen_port: self.listen_port,
            counters: torrent.counters.clone(),
            initial_peers: torrent.initial_peers(),
            notices: self.notices.clone(),
        }));
    }
}

/// Everything the session actor owns.
pub(crate) struct SessionCore {
    config: Arc<EngineConfig>,
    parser: BencodeTorrentParser,
    resolver: MetadataResolver,
    resume: ResumeStore,
    swarm_env: SwarmEnv,
    internal: mpsc::UnboundedSender<InternalEvent>,
    torrents: HashMap<String, ManagedTorrent>,
    /// Ids in insertion order
    order: Vec<String>,
    next_seq: u64,
    shut_down: bool,
}

impl SessionCore {
    pub(crate) fn new(
        config: Arc<EngineConfig>,
        our_id: PeerId,
        discovery: Arc<dyn DiscoveryProvider>,
        listen_port: Option<u16>,
        internal: mpsc::UnboundedSender<InternalEvent>,
        notices: mpsc::UnboundedSender<SwarmNotice>,
    ) -> Self {
        let resume = ResumeStore::new(&config.storage.state_dir, config.storage.temp_file_suffix);
        Self {
            parser: BencodeTorrentParser::new(),
            resolver: MetadataResolver::new(config.clone(), discovery.clone(), our_id),
            resume,
            swarm_env: SwarmEnv {
                our_id,
                discovery,
                limiter: BandwidthLimiter::from_config(&config.network),
                config: config.clone(),
                listen_port,
                notices,
            },
            config,
            internal,
            torrents: HashMap::new(),
            order: Vec::new(),
            next_seq: 0,
            shut_down: false,
        }
    }

    fn torrent_mut(&mut self, id: &str) -> Result<&mut ManagedTorrent, TorrentError> {
        self.torrents
            .get_mut(id)
            .ok_or_else(|| TorrentError::NotFound { id: id.to_string() })
    }

    fn torrent(&self, id: &str) -> Result<&ManagedTorrent, TorrentError> {
        self.torrents
            .get(id)
            .ok_or_else(|| TorrentError::NotFound { id: id.to_string() })
    }

    /// Adds a torrent from a magnet link and starts resolving it.
    ///
    /// # Errors
    /// - `TorrentError::InvalidArgument` - Malformed magnet or empty download path
    /// - `TorrentError::DuplicateTorrent` - Torrent already present and not canceled or failed
    /// - `TorrentError::Disk` - Download directory cannot be created
    pub(crate) async fn add_magnet(
        &mut self,
        magnet_link: &str,
        download_path: PathBuf,
    ) -> Result<String, TorrentError> {
        check_download_path(&download_path)?;
        let link = MagnetParser::parse_magnet_link(magnet_link)?;
        self.ensure_addable(link.info_hash).await?;
        create_download_dir(&download_path).await?;

        tracing::info!(info_hash = %link.info_hash, name = ?link.display_name, "Adding magnet link");
        let torrent = ManagedTorrent::new(
            link.info_hash,
            link.display_name.clone(),
            download_path,
            TorrentOrigin::Magnet {
                link: link.clone(),
                uri: magnet_link.trim().to_string(),
            },
            link.trackers.clone(),
            self.take_seq(),
        );
        let id = self.insert(torrent);
        self.start_preparation(&id, PrepareInput::Magnet(MetadataSource::Magnet(link)), None);
        Ok(id)
    }

    /// Adds a torrent from `.torrent` bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidArgument` - Empty download path
    /// - `TorrentError::InvalidMetadata` - Malformed metadata
    /// - `TorrentError::DuplicateTorrent` - Torrent already present and not canceled or failed
    /// - `TorrentError::Disk` - Download directory cannot be created
    pub(crate) async fn add_torrent_bytes(
        &mut self,
        bytes: Bytes,
        download_path: PathBuf,
    ) -> Result<String, TorrentError> {
        check_download_path(&download_path)?;
        let metainfo = self.parser.parse_torrent_data(&bytes)?;
        let info = Arc::new(metainfo.info);
        self.ensure_addable(info.info_hash).await?;
        create_download_dir(&download_path).await?;

        tracing::info!(
            info_hash = %info.info_hash,
            name = %info.name,
            pieces = info.piece_count(),
            size = info.total_length,
            "Adding torrent"
        );
        let mut torrent = ManagedTorrent::new(
            info.info_hash,
            Some(info.name.clone()),
            download_path,
            TorrentOrigin::Metadata,
            metainfo.trackers.clone(),
            self.take_seq(),
        );
        torrent.info = Some(info.clone());
        let id = self.insert(torrent);
        self.start_preparation(
            &id,
            PrepareInput::Info {
                info,
                trackers: metainfo.trackers,
            },
            None,
        );
        Ok(id)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Fails for live duplicates; drops a canceled or failed entry so it can be replaced.
    async fn ensure_addable(&mut self, info_hash: InfoHash) -> Result<(), TorrentError> {
        let id = info_hash.to_hex();
        let Some(existing) = self.torrents.get(&id) else {
            return Ok(());
        };
        if !existing.status.is_replaceable() {
            return Err(TorrentError::DuplicateTorrent { info_hash });
        }
        if let Some(mut old) = self.torrents.remove(&id) {
            tracing::debug!(%info_hash, status = %old.status, "Replacing torrent entry");
            old.abort_preparation();
            old.stop_swarm().await;
        }
        self.order.retain(|known| *known != id);
        Ok(())
    }

    fn insert(&mut self, torrent: ManagedTorrent) -> String {
        let id = torrent.id.clone();
        self.order.push(id.clone());
        self.torrents.insert(id.clone(), torrent);
        id
    }

    fn start_preparation(&mut self, id: &str, input: PrepareInput, verified: Option<Vec<u8>>) {
        let resolver = self.resolver.clone();
        let config = self.config.clone();
        let events = self.internal.clone();
        let Some(torrent) = self.torrents.get_mut(id) else {
            return;
        };
        torrent.abort_preparation();
        let generation = torrent.generation;
        let save_path = torrent.save_path.clone();
        let id = id.to_string();

        torrent.prepare_task = Some(tokio::spawn(async move {
            let result = prepare(resolver, config, input, save_path, verified).await;
            let _ = events.send(InternalEvent::Prepared {
                id,
                generation,
                result,
            });
        }));
    }

    pub(crate) async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Prepared {
                id,
                generation,
                result,
            } => self.on_prepared(&id, generation, result).await,
            InternalEvent::Incoming {
                endpoint,
                stream,
                handshake,
            } => self.route_incoming(endpoint, stream, handshake).await,
        }
    }

    async fn on_prepared(
        &mut self,
        id: &str,
        generation: u64,
        result: Result<Prepared, TorrentError>,
    ) {
        let env = &self.swarm_env;
        let Some(torrent) = self.torrents.get_mut(id) else {
            return;
        };
        if torrent.generation != generation || torrent.status != TorrentStatus::Resolving {
            return;
        }
        torrent.prepare_task = None;

        match result {
            Ok(prepared) => {
                let info = prepared.store.info().clone();
                torrent.name = Some(info.name.clone());
                torrent.info = Some(info);
                for tracker in prepared.trackers {
                    if !torrent.trackers.contains(&tracker) {
                        torrent.trackers.push(tracker);
                    }
                }
                env.discovery
                    .register_torrent(torrent.info_hash, &torrent.trackers);
                torrent.store = Some(prepared.store);
                torrent.resume_verified = None;

                if torrent.pause_requested {
                    torrent.pause_requested = false;
                    torrent.transition(TorrentStatus::Paused);
                } else {
                    let next = torrent.running_status();
                    env.start(torrent);
                    torrent.transition(next);
                }
            }
            Err(error) => {
                tracing::warn!(info_hash = %torrent.info_hash, error = %error, "Torrent preparation failed");
                torrent.error = Some(error.user_message());
                torrent.transition(TorrentStatus::Error);
            }
        }
        self.persist_logged(id).await;
    }

    pub(crate) async fn on_swarm_notice(&mut self, notice: SwarmNotice) {
        match notice {
            SwarmNotice::Completed { info_hash } => {
                let id = info_hash.to_hex();
                let Some(torrent) = self.torrents.get_mut(&id) else {
                    return;
                };
                if torrent.status == TorrentStatus::Downloading {
                    torrent.transition(TorrentStatus::Seeding);
                    tracing::info!(%info_hash, "Download complete, seeding");
                }
                self.persist_logged(&id).await;
            }
            SwarmNotice::Failed { info_hash, error } => {
                let id = info_hash.to_hex();
                let Some(torrent) = self.torrents.get_mut(&id) else {
                    return;
                };
                if !torrent.status.is_active() {
                    return;
                }
                tracing::warn!(%info_hash, error = %error, "Torrent failed");
                torrent.error = Some(error.user_message());
                torrent.stop_swarm().await;
                torrent.transition(TorrentStatus::Error);
                self.persist_logged(&id).await;
            }
        }
    }

    async fn route_incoming(
        &mut self,
        endpoint: SocketAddr,
        stream: TcpStream,
        handshake: PeerHandshake,
    ) {
        let id = handshake.info_hash.to_hex();
        let swarm = self
            .torrents
            .get(&id)
            .and_then(|torrent| torrent.swarm.as_ref());
        match swarm {
            Some(swarm) => {
                if let Err(e) = swarm.incoming(endpoint, stream, handshake).await {
                    tracing::debug!(peer = %endpoint, error = %e, "Swarm refused incoming peer");
                }
            }
            None => {
                tracing::debug!(peer = %endpoint, info_hash = %handshake.info_hash, "Dropping peer for unknown torrent")
            }
        }
    }

    /// # Errors
    /// - `TorrentError::NotFound` - Unknown id
    pub(crate) async fn pause(&mut self, id: &str) -> Result<(), TorrentError> {
        let torrent = self.torrent_mut(id)?;
        match torrent.status {
            TorrentStatus::Resolving => torrent.pause_requested = true,
            TorrentStatus::Downloading | TorrentStatus::Seeding => {
                torrent.stop_swarm().await;
                torrent.transition(TorrentStatus::Paused);
            }
            TorrentStatus::Paused => {}
            TorrentStatus::Canceled | TorrentStatus::Error => {
                tracing::debug!(info_hash = %torrent.info_hash, status = %torrent.status, "Pause ignored");
                return Ok(());
            }
        }
        self.persist_logged(id).await;
        Ok(())
    }

    /// # Errors
    /// - `TorrentError::NotFound` - Unknown id
    pub(crate) async fn resume(&mut self, id: &str) -> Result<(), TorrentError> {
        let env = &self.swarm_env;
        let torrent = self
            .torrents
            .get_mut(id)
            .ok_or_else(|| TorrentError::NotFound { id: id.to_string() })?;
        match torrent.status {
            TorrentStatus::Resolving => torrent.pause_requested = false,
            TorrentStatus::Paused => {
                let next = torrent.running_status();
                env.start(torrent);
                torrent.transition(next);
            }
            TorrentStatus::Downloading | TorrentStatus::Seeding => return Ok(()),
            TorrentStatus::Canceled | TorrentStatus::Error => {
                tracing::debug!(info_hash = %torrent.info_hash, status = %torrent.status, "Resume ignored");
                return Ok(());
            }
        }
        self.persist_logged(id).await;
        Ok(())
    }

    /// Stops a torrent and drops unverified data; files and entry stay.
    ///
    /// # Errors
    /// - `TorrentError::NotFound` - Unknown id
    pub(crate) async fn cancel(&mut self, id: &str) -> Result<(), TorrentError> {
        let torrent = self.torrent_mut(id)?;
        if !torrent.status.can_transition_to(TorrentStatus::Canceled) {
            tracing::debug!(info_hash = %torrent.info_hash, status = %torrent.status, "Cancel ignored");
            return Ok(());
        }
        torrent.abort_preparation();
        torrent.stop_swarm().await;
        if let Some(store) = &torrent.store {
            store.discard_unverified();
        }
        torrent.pause_requested = false;
        torrent.transition(TorrentStatus::Canceled);
        self.persist_logged(id).await;
        Ok(())
    }

    /// Removes a torrent, its files and its resume data.
    ///
    /// # Errors
    /// - `TorrentError::NotFound` - Unknown id
    /// - `TorrentError::Disk` - Files could not be removed; the entry is gone regardless
    pub(crate) async fn delete(&mut self, id: &str) -> Result<(), TorrentError> {
        let mut torrent = self
            .torrents
            .remove(id)
            .ok_or_else(|| TorrentError::NotFound { id: id.to_string() })?;
        self.order.retain(|known| known != id);
        torrent.abort_preparation();
        torrent.stop_swarm().await;
        self.swarm_env.discovery.unregister_torrent(torrent.info_hash);

        let removed = match (&torrent.store, &torrent.info) {
            (Some(store), _) => store.delete_files().await,
            (None, Some(info)) => remove_torrent_files(info, &torrent.save_path).await,
            (None, None) => Ok(()),
        };
        if let Err(e) = self.resume.remove(id).await {
            tracing::warn!(info_hash = %torrent.info_hash, error = %e, "Failed to remove resume data");
        }
        tracing::info!(info_hash = %torrent.info_hash, "Torrent deleted");
        removed.map_err(TorrentError::from)
    }

    /// # Errors
    /// - `TorrentError::NotFound` - Unknown id
    pub(crate) fn get_torrent(&self, id: &str) -> Result<TorrentSnapshot, TorrentError> {
        self.torrent(id).map(TorrentSnapshot::capture)
    }

    pub(crate) fn get_torrents(&self) -> Vec<TorrentSnapshot> {
        self.order
            .iter()
            .filter_map(|id| self.torrents.get(id))
            .map(TorrentSnapshot::capture)
            .collect()
    }

    /// # Errors
    /// - `TorrentError::NotFound` - Unknown id
    pub(crate) async fn get_torrent_peers(
        &self,
        id: &str,
    ) -> Result<Vec<PeerSnapshot>, TorrentError> {
        let torrent = self.torrent(id)?;
        match &torrent.swarm {
            Some(swarm) => Ok(swarm.peers().await.unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    /// Writes resume data for every torrent.
    ///
    /// # Errors
    /// - `TorrentError::Disk` - First write failure; remaining torrents are still attempted
    pub(crate) async fn save_resume_data(&self) -> Result<(), TorrentError> {
        let mut first_error = None;
        for id in &self.order {
            if let Err(e) = self.persist(id).await {
                tracing::warn!(id = %id, error = %e, "Failed to save resume data");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn persist(&self, id: &str) -> Result<(), TorrentError> {
        let torrent = self.torrent(id)?;
        self.resume.save(&resume_data(torrent)).await?;
        Ok(())
    }

    async fn persist_logged(&self, id: &str) {
        if let Err(e) = self.persist(id).await {
            tracing::warn!(id = %id, error = %e, "Failed to save resume data");
        }
    }

    /// Re-adds torrents recorded in resume data.
    pub(crate) async fn restore(&mut self) {
        let records = self.resume.load_all().await;
        if records.is_empty() {
            return;
        }
        tracing::info!(count = records.len(), "Restoring torrents from resume data");
        for record in records {
            self.restore_one(record);
        }
    }

    fn restore_one(&mut self, record: ResumeData) {
        let Some(info_hash) = record.parsed_info_hash() else {
            tracing::warn!(id = %record.info_hash, "Skipping resume record with invalid id");
            return;
        };
        let id = info_hash.to_hex();
        if self.torrents.contains_key(&id) {
            return;
        }

        let link = record
            .magnet
            .as_deref()
            .and_then(|uri| MagnetParser::parse_magnet_link(uri).ok().map(|link| (link, uri)));
        let info = record.info.as_ref().and_then(|bytes| {
            self.parser
                .parse_info_dict(Bytes::copy_from_slice(bytes), Some(info_hash))
                .map_err(|e| tracing::warn!(%info_hash, error = %e, "Discarding stored metadata"))
                .ok()
                .map(Arc::new)
        });
        let origin = match &link {
            Some((link, uri)) => TorrentOrigin::Magnet {
                link: link.clone(),
                uri: uri.to_string(),
            },
            None if info.is_some() => TorrentOrigin::Metadata,
            None => {
                tracing::warn!(%info_hash, "Skipping resume record without metadata or magnet");
                return;
            }
        };

        let mut torrent = ManagedTorrent::new(
            info_hash,
            record.name.clone(),
            PathBuf::from(&record.save_path),
            origin,
            record.trackers.clone(),
            record.added_seq,
        );
        torrent.added_at = DateTime::from_timestamp(record.added_at, 0).unwrap_or_else(Utc::now);
        torrent.counters = TransferCounters::new(record.downloaded, record.uploaded);
        torrent.info = info.clone();
        torrent.resume_verified = Some(record.verified.to_vec());
        self.next_seq = self.next_seq.max(record.added_seq + 1);

        let input = match (info, link) {
            (Some(info), _) => PrepareInput::Info {
                info,
                trackers: record.trackers.clone(),
            },
            (None, Some((link, _))) => PrepareInput::Magnet(MetadataSource::Magnet(link)),
            (None, None) => return,
        };

        match record.state.as_str() {
            STATE_CANCELED => {
                torrent.status = TorrentStatus::Canceled;
                self.insert(torrent);
            }
            state => {
                torrent.pause_requested = state == STATE_PAUSED;
                let verified = torrent.resume_verified.clone();
                let id = self.insert(torrent);
                self.start_preparation(&id, input, verified);
            }
        }
    }

    /// Stops every torrent and flushes resume data. Safe to call twice.
    pub(crate) async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        tracing::info!(torrents = self.torrents.len(), "Shutting down session");

        let stops = self.torrents.values_mut().map(|torrent| {
            torrent.abort_preparation();
            torrent.stop_swarm()
        });
        futures::future::join_all(stops).await;

        if let Err(e) = self.save_resume_data().await {
            tracing::warn!(error = %e, "Resume data incomplete at shutdown");
        }
    }
}

fn check_download_path(path: &Path) -> Result<(), TorrentError> {
    if path.as_os_str().is_empty() {
        return Err(TorrentError::invalid_argument(
            "download path must not be empty",
        ));
    }
    Ok(())
}

async fn create_download_dir(path: &Path) -> Result<(), TorrentError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| TorrentError::Disk(StorageError::file(path, e)))
}

/// Resolves metadata if needed, allocates storage and restores verified pieces.
async fn prepare(
    resolver: MetadataResolver,
    config: Arc<EngineConfig>,
    input: PrepareInput,
    save_path: PathBuf,
    verified: Option<Vec<u8>>,
) -> Result<Prepared, TorrentError> {
    let (info, trackers) = match input {
        PrepareInput::Magnet(source) => {
            let metainfo = resolver.resolve(&source).await?;
            (Arc::new(metainfo.info), metainfo.trackers)
        }
        PrepareInput::Info { info, trackers } => (info, trackers),
    };

    let existing = has_existing_data(&info, &save_path).await;
    let store = PieceStore::allocate(
        info.clone(),
        &save_path,
        config.torrent.block_size,
        config.storage.check_free_space,
    )
    .await?;

    if verified.is_none() && existing {
        let found = store
            .restore_verified(&Bitfield::full(info.piece_count()), true)
            .await;
        tracing::info!(info_hash = %info.info_hash, found, "Checked existing data");
    }

    if let Some(bytes) = verified {
        match Bitfield::from_bytes(&bytes, info.piece_count()) {
            Ok(pieces) if !pieces.is_empty() => {
                let restored = store
                    .restore_verified(&pieces, config.storage.recheck_on_restore)
                    .await;
                tracing::info!(
                    info_hash = %info.info_hash,
                    restored,
                    recorded = pieces.count(),
                    "Restored verified pieces"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(info_hash = %info.info_hash, error = %e, "Ignoring stored piece bitmap")
            }
        }
    }

    Ok(Prepared {
        store: Arc::new(store),
        trackers,
    })
}

/// Whether any of the torrent's files already holds data under `root`.
async fn has_existing_data(info: &TorrentInfo, root: &Path) -> bool {
    for file in &info.files {
        if let Ok(metadata) = tokio::fs::metadata(root.join(&file.path)).await
            && metadata.len() > 0
        {
            return true;
        }
    }
    false
}

fn resume_data(torrent: &ManagedTorrent) -> ResumeData {
    let verified = match (&torrent.store, &torrent.resume_verified) {
        (Some(store), _) => store.verified_bitfield().as_bytes().to_vec(),
        (None, Some(bytes)) => bytes.clone(),
        (None, None) => Vec::new(),
    };
    let state = match torrent.status {
        TorrentStatus::Paused => STATE_PAUSED,
        TorrentStatus::Resolving if torrent.pause_requested => STATE_PAUSED,
        TorrentStatus::Canceled => STATE_CANCELED,
        _ => STATE_ACTIVE,
    };
    let magnet = match &torrent.origin {
        TorrentOrigin::Magnet { uri, .. } => Some(uri.clone()),
        TorrentOrigin::Metadata => None,
    };

    ResumeData {
        info_hash: torrent.id.clone(),
        name: torrent.name.clone(),
        save_path: torrent.save_path.to_string_lossy().into_owned(),
        info: torrent
            .info
            .as_ref()
            .map(|info| ByteBuf::from(info.info_bytes().to_vec())),
        magnet,
        trackers: torrent.trackers.clone(),
        verified: ByteBuf::from(verified),
        uploaded: torrent.counters.uploaded(),
        downloaded: torrent.counters.downloaded(),
        state: state.to_string(),
        added_at: torrent.added_at.timestamp(),
        added_seq: torrent.added_seq,
    }
}
