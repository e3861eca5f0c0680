//! Swarm coordination for one torrent.
//!
//! A coordinator owns every peer connection of its torrent and runs a
//! fixed-interval scheduling loop: discovery top-ups, dialing, choking,
//! request dispatch and connection hygiene. Peer tasks report back over a
//! channel keyed by endpoint and connection id, so the coordinator never
//! holds references into them.

pub mod choker;
pub(crate) mod commands;
mod coordinator;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub use commands::{SwarmNotice, SwarmStats};
use commands::SwarmCommand;
use coordinator::SwarmCoordinator;

use super::peer_connection::PeerSnapshot;
use super::protocol::PeerHandshake;
use super::{InfoHash, PeerId, TorrentError};
use crate::config::EngineConfig;
use crate::discovery::DiscoveryProvider;
use crate::network::BandwidthLimiter;
use crate::storage::PieceStore;

/// Cumulative payload counters for one torrent.
///
/// Shared between successive coordinators so pause and resume keep the
/// totals; reset only when the torrent is re-added.
#[derive(Debug, Clone, Default)]
pub struct TransferCounters {
    downloaded: Arc<AtomicU64>,
    uploaded: Arc<AtomicU64>,
}

impl TransferCounters {
    pub fn new(downloaded: u64, uploaded: u64) -> Self {
        Self {
            downloaded: Arc::new(AtomicU64::new(downloaded)),
            uploaded: Arc::new(AtomicU64::new(uploaded)),
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub(crate) fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Everything a coordinator needs to run one torrent.
pub struct SwarmParams {
    pub info_hash: InfoHash,
    pub our_id: PeerId,
    pub store: Arc<PieceStore>,
    pub discovery: Arc<dyn DiscoveryProvider>,
    pub limiter: BandwidthLimiter,
    pub config: Arc<EngineConfig>,
    /// Port advertised in extension handshakes
    pub listen_port: Option<u16>,
    pub counters: TransferCounters,
    /// Endpoints to dial before asking discovery
    pub initial_peers: Vec<SocketAddr>,
    pub notices: mpsc::UnboundedSender<SwarmNotice>,
}

/// Owner's handle to a running coordinator.
pub struct SwarmHandle {
    sender: mpsc::Sender<SwarmCommand>,
    stats: watch::Receiver<SwarmStats>,
    task: JoinHandle<()>,
}

/// Starts a coordinator task for one torrent.
pub fn spawn_swarm(params: SwarmParams) -> SwarmHandle {
    let (sender, receiver) = mpsc::channel(64);
    let (stats_tx, stats) = watch::channel(SwarmStats::default());
    let coordinator = SwarmCoordinator::new(params, stats_tx);
    let task = tokio::spawn(coordinator.run(receiver));
    SwarmHandle {
        sender,
        stats,
        task,
    }
}

impl SwarmHandle {
    /// Latest figures published by the scheduling loop.
    pub fn stats(&self) -> SwarmStats {
        *self.stats.borrow()
    }

    /// Snapshots every tracked connection.
    ///
    /// # Errors
    /// - `TorrentError::EngineShutdown` - Coordinator has stopped
    pub async fn peers(&self) -> Result<Vec<PeerSnapshot>, TorrentError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(SwarmCommand::Peers { responder })
            .await
            .map_err(|_| TorrentError::EngineShutdown)?;
        rx.await.map_err(|_| TorrentError::EngineShutdown)
    }

    /// Queues endpoints for dialing.
    ///
    /// # Errors
    /// - `TorrentError::EngineShutdown` - Coordinator has stopped
    pub async fn add_peers(&self, peers: Vec<SocketAddr>) -> Result<(), TorrentError> {
        self.sender
            .send(SwarmCommand::AddPeers { peers })
            .await
            .map_err(|_| TorrentError::EngineShutdown)
    }

    /// Hands over a connection whose handshake the listener already read.
    ///
    /// # Errors
    /// - `TorrentError::EngineShutdown` - Coordinator has stopped
    pub async fn incoming(
        &self,
        endpoint: SocketAddr,
        stream: TcpStream,
        remote: PeerHandshake,
    ) -> Result<(), TorrentError> {
        self.sender
            .send(SwarmCommand::Incoming {
                endpoint,
                stream,
                remote,
            })
            .await
            .map_err(|_| TorrentError::EngineShutdown)
    }

    /// Closes every connection and waits for the coordinator to stop.
    pub async fn shutdown(mut self) {
        let (responder, rx) = oneshot::channel();
        if self
            .sender
            .send(SwarmCommand::Shutdown { responder })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for SwarmHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_shared_between_clones() {
        let counters = TransferCounters::new(10, 5);
        let other = counters.clone();
        other.add_downloaded(90);
        other.add_uploaded(1);
        assert_eq!(counters.downloaded(), 100);
        assert_eq!(counters.uploaded(), 6);
    }
}
