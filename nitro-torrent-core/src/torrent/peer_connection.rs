//! Coordinator-side view of one peer connection.
//!
//! The socket itself lives in a spawned peer task; this struct holds the
//! protocol state the coordinator schedules against (choke and interest
//! flags, remote bitfield, outstanding requests, rates) plus the command
//! channel into the task.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::PeerMessage;
use super::{Bitfield, BlockRequest, PeerId, RateMeter};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Valid forward transitions; `Closing` and `Closed` are reachable from anywhere.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Handshaking, Connected)
                | (Connecting | Handshaking | Connected, Closing)
                | (_, Closed)
        )
    }
}

/// Instructions from the coordinator to a peer task.
#[derive(Debug)]
pub(crate) enum PeerCommand {
    Send(PeerMessage),
    Close,
}

/// A block request awaiting its piece message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub block: BlockRequest,
    pub requested_at: Instant,
}

/// Point-in-time view of one peer, as shown to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSnapshot {
    /// `ip:port`
    pub endpoint: String,
    pub client: String,
    /// Fraction of pieces the peer advertises
    pub progress: f64,
    pub download_rate: u64,
    pub upload_rate: u64,
    /// Comma separated state flags, or `none`
    pub flags: String,
}

pub struct PeerConnection {
    pub endpoint: SocketAddr,
    /// Distinguishes successive connections to the same endpoint
    pub conn_id: u64,
    pub state: ConnectionState,
    pub peer_id: Option<PeerId>,
    /// Client name from the extension handshake, preferred over the peer id
    pub client: Option<String>,
    pub bitfield: Bitfield,
    /// Whether the peer ever sent a bitfield or have
    pub announced: bool,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub outstanding: Vec<PendingRequest>,
    pub download: RateMeter,
    pub upload: RateMeter,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub incoming: bool,
    commands: mpsc::UnboundedSender<PeerCommand>,
    task: JoinHandle<()>,
}

impl PeerConnection {
    pub(crate) fn new(
        endpoint: SocketAddr,
        conn_id: u64,
        piece_count: u32,
        rate_window: Duration,
        incoming: bool,
        commands: mpsc::UnboundedSender<PeerCommand>,
        task: JoinHandle<()>,
    ) -> Self {
        let now = Instant::now();
        Self {
            endpoint,
            conn_id,
            state: if incoming {
                ConnectionState::Handshaking
            } else {
                ConnectionState::Connecting
            },
            peer_id: None,
            client: None,
            bitfield: Bitfield::new(piece_count),
            announced: false,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            outstanding: Vec::new(),
            download: RateMeter::starting_at(rate_window, now),
            upload: RateMeter::starting_at(rate_window, now),
            connected_at: now,
            last_activity: now,
            incoming,
            commands,
            task,
        }
    }

    /// Moves to `next` if the transition is valid.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Queues a message for the peer task. Returns false if the task is gone.
    pub(crate) fn send(&self, message: PeerMessage) -> bool {
        self.commands.send(PeerCommand::Send(message)).is_ok()
    }

    /// Updates local choke state, sending the change if it differs.
    pub(crate) fn set_choking(&mut self, choke: bool) {
        if self.am_choking != choke {
            self.am_choking = choke;
            self.send(if choke {
                PeerMessage::Choke
            } else {
                PeerMessage::Unchoke
            });
        }
    }

    /// Updates local interest, sending the change if it differs.
    pub(crate) fn set_interested(&mut self, interested: bool) {
        if self.am_interested != interested {
            self.am_interested = interested;
            self.send(if interested {
                PeerMessage::Interested
            } else {
                PeerMessage::NotInterested
            });
        }
    }

    /// Free request slots under the per-peer cap.
    pub fn request_capacity(&self, max_outstanding: usize) -> usize {
        max_outstanding.saturating_sub(self.outstanding.len())
    }

    /// Whether requests may be sent now.
    pub fn can_request(&self) -> bool {
        self.is_connected() && !self.peer_choking && self.am_interested
    }

    /// Removes and returns a pending request matching `block`.
    pub fn take_request(&mut self, block: &BlockRequest) -> Option<PendingRequest> {
        let position = self.outstanding.iter().position(|p| p.block == *block)?;
        Some(self.outstanding.swap_remove(position))
    }

    pub fn is_seed(&self) -> bool {
        self.announced && self.bitfield.is_full()
    }

    /// Tells the task to close; the task reports back with a disconnect.
    pub(crate) fn close(&mut self) {
        if self.transition(ConnectionState::Closing) {
            let _ = self.commands.send(PeerCommand::Close);
        }
    }

    /// Stops the task immediately.
    pub(crate) fn abort(&mut self) {
        self.state = ConnectionState::Closed;
        self.task.abort();
    }

    /// Comma separated state summary.
    pub fn flags(&self) -> String {
        let mut flags = Vec::new();
        if self.is_seed() {
            flags.push("seed");
        }
        if self.am_interested {
            flags.push("interesting");
        }
        if self.peer_interested {
            flags.push("remote_interested");
        }
        if self.am_choking {
            flags.push("choked");
        }
        if self.peer_choking {
            flags.push("remote_choked");
        }
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Handshaking
        ) {
            flags.push("connecting");
        }
        if flags.is_empty() {
            "none".to_string()
        } else {
            flags.join(",")
        }
    }

    pub fn snapshot(&self, now: Instant) -> PeerSnapshot {
        let client = self
            .client
            .clone()
            .or_else(|| self.peer_id.map(|id| id.client_name()))
            .unwrap_or_default();
        PeerSnapshot {
            endpoint: self.endpoint.to_string(),
            client,
            progress: self.bitfield.fraction(),
            download_rate: self.download.rate_at(now),
            upload_rate: self.upload.rate_at(now),
            flags: self.flags(),
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::PieceIndex;

    fn connection() -> (PeerConnection, mpsc::UnboundedReceiver<PeerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async {});
        let peer = PeerConnection::new(
            "10.0.0.1:6881".parse().unwrap(),
            1,
            4,
            Duration::from_secs(5),
            false,
            tx,
            task,
        );
        (peer, rx)
    }

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(!Connecting.can_transition_to(Connected));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Closing.can_transition_to(Closing));
    }

    #[tokio::test]
    async fn test_new_connection_flags() {
        let (peer, _rx) = connection();
        assert_eq!(peer.flags(), "choked,remote_choked,connecting");
        assert!(!peer.can_request());
    }

    #[tokio::test]
    async fn test_connected_seed_flags() {
        let (mut peer, _rx) = connection();
        peer.transition(ConnectionState::Handshaking);
        peer.transition(ConnectionState::Connected);
        peer.bitfield = Bitfield::full(4);
        peer.announced = true;
        peer.am_interested = true;
        peer.peer_choking = false;
        peer.am_choking = false;

        assert_eq!(peer.flags(), "seed,interesting");
        assert!(peer.can_request());
        assert_eq!(peer.snapshot(Instant::now()).progress, 1.0);
    }

    #[tokio::test]
    async fn test_choke_changes_are_sent_once() {
        let (mut peer, mut rx) = connection();
        peer.set_choking(false);
        peer.set_choking(false);
        peer.set_interested(true);

        assert!(matches!(rx.try_recv(), Ok(PeerCommand::Send(PeerMessage::Unchoke))));
        assert!(matches!(rx.try_recv(), Ok(PeerCommand::Send(PeerMessage::Interested))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_request_bookkeeping() {
        let (mut peer, _rx) = connection();
        let block = BlockRequest::new(PieceIndex::new(2), 0, 16384);
        peer.outstanding.push(PendingRequest {
            block,
            requested_at: Instant::now(),
        });

        assert_eq!(peer.request_capacity(4), 3);
        assert!(peer.take_request(&block).is_some());
        assert!(peer.take_request(&block).is_none());
        assert_eq!(peer.request_capacity(4), 4);
    }

    #[tokio::test]
    async fn test_client_falls_back_to_peer_id() {
        let (mut peer, _rx) = connection();
        peer.peer_id = Some(PeerId::new(*b"-qB4250-abcdefghijkl"));
        assert_eq!(peer.snapshot(Instant::now()).client, "qBittorrent 4.2.5");

        peer.client = Some("Transmission 3.00".to_string());
        assert_eq!(peer.snapshot(Instant::now()).client, "Transmission 3.00");
    }
}
