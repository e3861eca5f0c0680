//! Command definitions for the session actor.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use super::snapshot::TorrentSnapshot;
use crate::storage::PieceStore;
use crate::torrent::{PeerHandshake, PeerSnapshot, TorrentError};

/// Requests sent to the session actor by [`super::SessionHandle`].
///
/// Each command carries a response channel; the actor processes them one
/// at a time, so session state needs no locks.
pub enum SessionCommand {
    AddMagnet {
        magnet_link: String,
        download_path: PathBuf,
        responder: oneshot::Sender<Result<String, TorrentError>>,
    },
    AddTorrentBytes {
        bytes: Bytes,
        download_path: PathBuf,
        responder: oneshot::Sender<Result<String, TorrentError>>,
    },
    Pause {
        id: String,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    Resume {
        id: String,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    Cancel {
        id: String,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    Delete {
        id: String,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    GetTorrent {
        id: String,
        responder: oneshot::Sender<Result<TorrentSnapshot, TorrentError>>,
    },
    GetTorrents {
        responder: oneshot::Sender<Vec<TorrentSnapshot>>,
    },
    GetTorrentPeers {
        id: String,
        responder: oneshot::Sender<Result<Vec<PeerSnapshot>, TorrentError>>,
    },
    SaveResumeData {
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Flush resume data, close every connection and stop.
    Shutdown { responder: oneshot::Sender<()> },
}

/// Metadata resolved and storage allocated for a torrent.
pub(crate) struct Prepared {
    pub store: Arc<PieceStore>,
    pub trackers: Vec<String>,
}

/// Notifications the actor sends itself from spawned work.
pub(crate) enum InternalEvent {
    Prepared {
        id: String,
        generation: u64,
        result: Result<Prepared, TorrentError>,
    },
    Incoming {
        endpoint: SocketAddr,
        stream: TcpStream,
        handshake: PeerHandshake,
    },
}
