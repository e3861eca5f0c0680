//! One torrent as tracked by the session: lifecycle state and owned parts.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::storage::PieceStore;
use crate::torrent::{InfoHash, MagnetLink, SwarmHandle, TorrentInfo, TransferCounters};

/// Session-visible lifecycle of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentStatus {
    Resolving,
    Downloading,
    Seeding,
    Paused,
    Canceled,
    Error,
}

impl TorrentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TorrentStatus::Resolving => "resolving",
            TorrentStatus::Downloading => "downloading",
            TorrentStatus::Seeding => "seeding",
            TorrentStatus::Paused => "paused",
            TorrentStatus::Canceled => "canceled",
            TorrentStatus::Error => "error",
        }
    }

    /// Whether a swarm runs in this state.
    pub fn is_active(self) -> bool {
        matches!(self, TorrentStatus::Downloading | TorrentStatus::Seeding)
    }

    /// `Canceled` and `Error` entries may be replaced by a fresh add.
    pub fn is_replaceable(self) -> bool {
        matches!(self, TorrentStatus::Canceled | TorrentStatus::Error)
    }

    pub fn can_transition_to(self, next: TorrentStatus) -> bool {
        use TorrentStatus::*;
        matches!(
            (self, next),
            (Resolving, Downloading | Seeding | Paused | Error | Canceled)
                | (Downloading, Seeding | Paused | Error | Canceled)
                | (Seeding, Paused | Error | Canceled)
                | (Paused, Downloading | Seeding | Canceled)
        )
    }
}

impl fmt::Display for TorrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the metadata of a torrent comes from.
#[derive(Debug, Clone)]
pub(crate) enum TorrentOrigin {
    /// Added by magnet link; keeps the original URI for resume data
    Magnet { link: MagnetLink, uri: String },
    /// Added with metadata in hand
    Metadata,
}

/// A torrent owned by the session.
pub(crate) struct ManagedTorrent {
    pub id: String,
    pub info_hash: InfoHash,
    pub name: Option<String>,
    pub save_path: PathBuf,
    pub origin: TorrentOrigin,
    pub trackers: Vec<String>,
    pub status: TorrentStatus,
    /// Pause requested while still resolving
    pub pause_requested: bool,
    pub error: Option<String>,
    /// Known once metadata is parsed or resolved
    pub info: Option<Arc<TorrentInfo>>,
    pub store: Option<Arc<PieceStore>>,
    /// Verified bitmap from resume data, until a store takes over
    pub resume_verified: Option<Vec<u8>>,
    pub swarm: Option<SwarmHandle>,
    pub counters: TransferCounters,
    /// Bumped whenever in-flight preparation must be ignored
    pub generation: u64,
    pub prepare_task: Option<JoinHandle<()>>,
    pub added_at: DateTime<Utc>,
    pub added_seq: u64,
}

impl ManagedTorrent {
    pub fn new(
        info_hash: InfoHash,
        name: Option<String>,
        save_path: PathBuf,
        origin: TorrentOrigin,
        trackers: Vec<String>,
        added_seq: u64,
    ) -> Self {
        Self {
            id: info_hash.to_hex(),
            info_hash,
            name,
            save_path,
            origin,
            trackers,
            status: TorrentStatus::Resolving,
            pause_requested: false,
            error: None,
            info: None,
            store: None,
            resume_verified: None,
            swarm: None,
            counters: TransferCounters::default(),
            generation: 0,
            prepare_task: None,
            added_at: Utc::now(),
            added_seq,
        }
    }

    /// Moves to `next`, logging and refusing invalid transitions.
    pub fn transition(&mut self, next: TorrentStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            tracing::debug!(
                info_hash = %self.info_hash,
                from = %self.status,
                to = %next,
                "Ignoring invalid torrent transition"
            );
            return false;
        }
        tracing::info!(info_hash = %self.info_hash, from = %self.status, to = %next, "Torrent state changed");
        self.status = next;
        true
    }

    /// Status a running torrent should have given its verified pieces.
    pub fn running_status(&self) -> TorrentStatus {
        match &self.store {
            Some(store) if store.is_complete() => TorrentStatus::Seeding,
            _ => TorrentStatus::Downloading,
        }
    }

    /// Peers known up front, from the magnet link.
    pub fn initial_peers(&self) -> Vec<SocketAddr> {
        match &self.origin {
            TorrentOrigin::Magnet { link, .. } => link.peers.clone(),
            TorrentOrigin::Metadata => Vec::new(),
        }
    }

    /// Makes any in-flight preparation result stale and stops it.
    pub fn abort_preparation(&mut self) {
        self.generation += 1;
        if let Some(task) = self.prepare_task.take() {
            task.abort();
        }
    }

    /// Stops the swarm, waiting for its connections to close.
    pub async fn stop_swarm(&mut self) {
        if let Some(swarm) = self.swarm.take() {
            swarm.shutdown().await;
        }
    }
}
