//! Handle for communicating with the session actor.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::commands::SessionCommand;
use super::snapshot::TorrentSnapshot;
use crate::torrent::{PeerSnapshot, TorrentError};

/// Control surface of a running session.
///
/// Cheap to clone and safe to share between tasks. Every method sends one
/// command to the actor and waits for its reply.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    listen_addr: Option<SocketAddr>,
}

impl SessionHandle {
    pub(crate) fn new(sender: mpsc::Sender<SessionCommand>, listen_addr: Option<SocketAddr>) -> Self {
        Self {
            sender,
            listen_addr,
        }
    }

    /// Address accepting incoming peers, if the listener is enabled.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    async fn request<T>(
        &self,
        command: SessionCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, TorrentError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| TorrentError::EngineShutdown)?;
        rx.await.map_err(|_| TorrentError::EngineShutdown)
    }

    /// Adds a torrent from a magnet link; metadata is fetched from peers.
    ///
    /// Returns the torrent id (hex info-hash) immediately; the torrent stays
    /// `resolving` until metadata arrives.
    ///
    /// # Errors
    /// - `TorrentError::InvalidArgument` - Malformed magnet link or empty download path
    /// - `TorrentError::DuplicateTorrent` - Torrent already in the session
    /// - `TorrentError::Disk` - Download directory cannot be created
    pub async fn add_magnet_link(
        &self,
        magnet_link: &str,
        download_path: impl Into<PathBuf>,
    ) -> Result<String, TorrentError> {
        let (responder, rx) = oneshot::channel();
        let command = SessionCommand::AddMagnet {
            magnet_link: magnet_link.to_string(),
            download_path: download_path.into(),
            responder,
        };
        self.request(command, rx).await?
    }

    /// Adds a torrent from a `.torrent` file on disk.
    ///
    /// # Errors
    /// - `TorrentError::InvalidArgument` - File unreadable or empty download path
    /// - `TorrentError::InvalidMetadata` - Malformed metadata
    /// - `TorrentError::DuplicateTorrent` - Torrent already in the session
    pub async fn add_torrent_file(
        &self,
        file_path: impl AsRef<Path>,
        download_path: impl Into<PathBuf>,
    ) -> Result<String, TorrentError> {
        let file_path = file_path.as_ref();
        let bytes = tokio::fs::read(file_path).await.map_err(|e| {
            TorrentError::invalid_argument(format!(
                "cannot read torrent file {}: {e}",
                file_path.display()
            ))
        })?;
        self.add_torrent_bytes(bytes, download_path).await
    }

    /// Adds a torrent from in-memory `.torrent` bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidArgument` - Empty download path
    /// - `TorrentError::InvalidMetadata` - Malformed metadata
    /// - `TorrentError::DuplicateTorrent` - Torrent already in the session
    pub async fn add_torrent_bytes(
        &self,
        bytes: impl Into<Bytes>,
        download_path: impl Into<PathBuf>,
    ) -> Result<String, TorrentError> {
        let (responder, rx) = oneshot::channel();
        let command = SessionCommand::AddTorrentBytes {
            bytes: bytes.into(),
            download_path: download_path.into(),
            responder,
        };
        self.request(command, rx).await?
    }

    /// Stops transfers, keeping verified pieces.
    ///
    /// # Errors
    /// - `TorrentError::NotFound` - Unknown id
    pub async fn pause_torrent(&self, id: &str) -> Result<(), TorrentError> {
        let (responder, rx) = oneshot::channel();
        let command = SessionCommand::Pause {
            id: id.to_string(),
            responder,
        };
        self.request(command, rx).await?
    }

    /// Restarts transfers of a paused torrent.
    ///
    /// # Errors
    /// - `TorrentError::NotFound` - Unknown id
    pub async fn resume_torrent(&self, id: &str) -> Result<(), TorrentError> {
        let (responder, rx) = oneshot::channel();
        let command = SessionCommand::Resume {
            id: id.to_string(),
            responder,
        };
        self.request(command, rx).await?
    }

    /// Stops a torrent and drops unverified data. Files stay on disk.
    ///
    /// # Errors
    /// - `TorrentError::NotFound` - Unknown id
    pub async fn cancel_torrent(&self, id: &str) -> Result<(), TorrentError> {
        let (responder, rx) = oneshot::channel();
        let command = SessionCommand::Cancel {
            id: id.to_string(),
            responder,
        };
        self.request(command, rx).await?
    }

    /// Removes a torrent and its downloaded files.
    ///
    /// # Errors
    /// - `TorrentError::NotFound` - Unknown id
    /// - `TorrentError::Disk` - Files could not be removed
    pub async fn delete_torrent(&self, id: &str) -> Result<(), TorrentError> {
        let (responder, rx) = oneshot::channel();
        let command = SessionCommand::Delete {
            id: id.to_string(),
            responder,
        };
        self.request(command, rx).await?
    }

    /// # Errors
    /// - `TorrentError::NotFound` - Unknown id
    pub async fn get_torrent(&self, id: &str) -> Result<TorrentSnapshot, TorrentError> {
        let (responder, rx) = oneshot::channel();
        let command = SessionCommand::GetTorrent {
            id: id.to_string(),
            responder,
        };
        self.request(command, rx).await?
    }

    /// Snapshots of every torrent in insertion order.
    ///
    /// Never fails: a stopped session reports no torrents.
    pub async fn get_torrents(&self) -> Vec<TorrentSnapshot> {
        let (responder, rx) = oneshot::channel();
        let command = SessionCommand::GetTorrents { responder };
        self.request(command, rx).await.unwrap_or_default()
    }

    /// # Errors
    /// - `TorrentError::NotFound` - Unknown id
    pub async fn get_torrent_peers(&self, id: &str) -> Result<Vec<PeerSnapshot>, TorrentError> {
        let (responder, rx) = oneshot::channel();
        let command = SessionCommand::GetTorrentPeers {
            id: id.to_string(),
            responder,
        };
        self.request(command, rx).await?
    }

    /// Writes resume data for every torrent now.
    ///
    /// # Errors
    /// - `TorrentError::Disk` - A record could not be written
    pub async fn save_resume_data(&self) -> Result<(), TorrentError> {
        let (responder, rx) = oneshot::channel();
        let command = SessionCommand::SaveResumeData { responder };
        self.request(command, rx).await?
    }

    /// Flushes resume data, closes all connections and stops the actor.
    ///
    /// # Errors
    /// - `TorrentError::EngineShutdown` - Already stopped
    pub async fn shutdown(&self) -> Result<(), TorrentError> {
        let (responder, rx) = oneshot::channel();
        let command = SessionCommand::Shutdown { responder };
        self.request(command, rx).await
    }
}
