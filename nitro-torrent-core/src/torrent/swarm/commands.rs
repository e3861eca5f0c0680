//! Messages exchanged between a swarm coordinator and its owner.

use std::net::SocketAddr;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::torrent::peer_connection::PeerSnapshot;
use crate::torrent::protocol::PeerHandshake;
use crate::torrent::{InfoHash, TorrentError};

/// Commands accepted by a running coordinator.
pub(crate) enum SwarmCommand {
    /// Snapshot every tracked connection.
    Peers {
        responder: oneshot::Sender<Vec<PeerSnapshot>>,
    },
    /// Queue extra endpoints for dialing.
    AddPeers { peers: Vec<SocketAddr> },
    /// Adopt a connection accepted by the session listener.
    Incoming {
        endpoint: SocketAddr,
        stream: TcpStream,
        remote: PeerHandshake,
    },
    /// Close every connection and stop the loop.
    Shutdown { responder: oneshot::Sender<()> },
}

/// Aggregate swarm figures, republished on every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwarmStats {
    /// Connections past the handshake
    pub peer_count: usize,
    /// Connected peers that hold every piece
    pub seed_count: usize,
    pub download_rate: u64,
    pub upload_rate: u64,
}

/// Events a coordinator reports to the session.
#[derive(Debug)]
pub enum SwarmNotice {
    /// Every piece is verified
    Completed { info_hash: InfoHash },
    /// Unrecoverable failure; the coordinator keeps running until shut down
    Failed {
        info_hash: InfoHash,
        error: TorrentError,
    },
}
