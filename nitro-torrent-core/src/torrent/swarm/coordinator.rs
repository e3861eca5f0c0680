//! The per-torrent scheduling loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::choker::{ChokeCandidate, pick_optimistic, select_unchoked};
use super::commands::{SwarmCommand, SwarmNotice, SwarmStats};
use super::{SwarmParams, TransferCounters};
use crate::config::EngineConfig;
use crate::discovery::{AnnounceStats, DiscoveryProvider};
use crate::storage::{BlockOutcome, PieceStore};
use crate::torrent::peer_connection::{ConnectionState, PeerConnection, PendingRequest};
use crate::torrent::peer_task::{
    PeerEvent, PeerEventKind, PeerTaskContext, PeerTransport, run_peer,
};
use crate::torrent::protocol::{PeerHandshake, PeerMessage};
use crate::torrent::{BlockRequest, InfoHash, PieceIndex, TorrentError};

/// How long shutdown waits for peer tasks to close their sockets.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub(super) struct SwarmCoordinator {
    info_hash: InfoHash,
    config: Arc<EngineConfig>,
    store: Arc<PieceStore>,
    discovery: Arc<dyn DiscoveryProvider>,
    counters: TransferCounters,
    notices: mpsc::UnboundedSender<SwarmNotice>,
    stats: watch::Sender<SwarmStats>,
    ctx: PeerTaskContext,
    events: mpsc::UnboundedReceiver<PeerEvent>,

    peers: HashMap<SocketAddr, PeerConnection>,
    next_conn_id: u64,
    /// Endpoints waiting to be dialed
    known: VecDeque<SocketAddr>,
    /// Endpoints that may not be dialed before the given instant
    cooldown: HashMap<SocketAddr, Instant>,
    banned: HashSet<SocketAddr>,
    hash_strikes: HashMap<SocketAddr, u32>,

    discovered_tx: mpsc::UnboundedSender<Vec<SocketAddr>>,
    discovered: mpsc::UnboundedReceiver<Vec<SocketAddr>>,
    discovery_task: Option<JoinHandle<()>>,
    last_discovery: Option<Instant>,

    last_choke: Instant,
    choke_round: u32,
    optimistic: Option<SocketAddr>,
    completed: bool,
    failed: bool,
}

impl SwarmCoordinator {
    pub(super) fn new(params: SwarmParams, stats: watch::Sender<SwarmStats>) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (discovered_tx, discovered) = mpsc::unbounded_channel();
        let ctx = PeerTaskContext {
            info_hash: params.info_hash,
            our_id: params.our_id,
            store: params.store.clone(),
            limiter: params.limiter,
            config: params.config.clone(),
            listen_port: params.listen_port,
            events: events_tx,
        };
        let completed = params.store.is_complete();
        let mut coordinator = Self {
            info_hash: params.info_hash,
            config: params.config,
            store: params.store,
            discovery: params.discovery,
            counters: params.counters,
            notices: params.notices,
            stats,
            ctx,
            events,
            peers: HashMap::new(),
            next_conn_id: 1,
            known: VecDeque::new(),
            cooldown: HashMap::new(),
            banned: HashSet::new(),
            hash_strikes: HashMap::new(),
            discovered_tx,
            discovered,
            discovery_task: None,
            last_discovery: None,
            last_choke: Instant::now(),
            choke_round: 0,
            optimistic: None,
            completed,
            failed: false,
        };
        coordinator.learn_peers(params.initial_peers);
        coordinator
    }

    pub(super) async fn run(mut self, mut commands: mpsc::Receiver<SwarmCommand>) {
        tracing::debug!(
            info_hash = %self.info_hash,
            complete = self.completed,
            "Swarm coordinator started"
        );
        let mut tick = tokio::time::interval(self.config.swarm.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(SwarmCommand::Shutdown { responder }) => {
                        self.shutdown().await;
                        let _ = responder.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(found) = self.discovered.recv() => {
                    self.discovery_task = None;
                    self.learn_peers(found);
                    self.dial_candidates();
                }
                _ = tick.tick() => self.on_tick(),
            }
        }
        tracing::debug!(info_hash = %self.info_hash, "Swarm coordinator stopped");
    }

    fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Peers { responder } => {
                let now = Instant::now();
                let peers = self.peers.values().map(|peer| peer.snapshot(now)).collect();
                let _ = responder.send(peers);
            }
            SwarmCommand::AddPeers { peers } => {
                self.learn_peers(peers);
                self.dial_candidates();
            }
            SwarmCommand::Incoming {
                endpoint,
                stream,
                remote,
            } => self.accept(endpoint, stream, remote),
            SwarmCommand::Shutdown { responder } => {
                // Handled by the loop
                let _ = responder.send(());
            }
        }
    }

    fn learn_peers(&mut self, peers: Vec<SocketAddr>) {
        for endpoint in peers {
            if self.banned.contains(&endpoint)
                || self.peers.contains_key(&endpoint)
                || self.known.contains(&endpoint)
            {
                continue;
            }
            self.known.push_back(endpoint);
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        self.expire_requests(now);
        self.drop_idle(now);
        if self.completed {
            self.drop_seeds();
        } else {
            self.maybe_discover(now);
            self.dial_candidates();
        }
        if now.duration_since(self.last_choke) >= self.config.swarm.choke_interval {
            self.last_choke = now;
            self.run_choker(now);
        }
        let endpoints: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for endpoint in endpoints {
            self.dispatch(endpoint);
        }
        self.publish_stats(now);
    }

    /// Re-issues requests the peer did not answer in time.
    fn expire_requests(&mut self, now: Instant) {
        let timeout = self.config.swarm.request_timeout;
        for peer in self.peers.values_mut() {
            let (expired, pending): (Vec<PendingRequest>, Vec<PendingRequest>) = peer
                .outstanding
                .drain(..)
                .partition(|request| now.duration_since(request.requested_at) >= timeout);
            peer.outstanding = pending;
            for request in expired {
                let block = request.block;
                peer.send(cancel_message(block));
                self.store.expire_block(peer.endpoint, block);
                tracing::debug!(
                    info_hash = %self.info_hash,
                    peer = %peer.endpoint,
                    %block,
                    "Block request timed out"
                );
            }
        }
    }

    fn drop_idle(&mut self, now: Instant) {
        let idle_timeout = self.config.network.idle_timeout;
        for peer in self.peers.values_mut() {
            if peer.is_connected() && now.duration_since(peer.last_activity) >= idle_timeout {
                tracing::debug!(info_hash = %self.info_hash, peer = %peer.endpoint, "Dropping idle peer");
                peer.close();
            }
        }
    }

    /// Seeds have nothing to offer a complete torrent and want nothing from it.
    fn drop_seeds(&mut self) {
        for peer in self.peers.values_mut() {
            if peer.is_connected() && peer.is_seed() {
                peer.close();
            }
        }
    }

    fn connected_count(&self) -> usize {
        self.peers.values().filter(|peer| peer.is_connected()).count()
    }

    fn maybe_discover(&mut self, now: Instant) {
        let swarm = &self.config.swarm;
        if self.discovery_task.is_some() || self.connected_count() >= swarm.target_peers {
            return;
        }
        if let Some(last) = self.last_discovery
            && now.duration_since(last) < self.config.network.discovery_interval
        {
            return;
        }
        self.last_discovery = Some(now);

        self.discovery.update_stats(
            self.info_hash,
            AnnounceStats {
                uploaded: self.counters.uploaded(),
                downloaded: self.counters.downloaded(),
                left: self
                    .store
                    .info()
                    .total_length
                    .saturating_sub(self.store.verified_bytes()),
            },
        );

        let wanted = swarm.max_peers.saturating_sub(self.peers.len()).max(1);
        let discovery = self.discovery.clone();
        let found_tx = self.discovered_tx.clone();
        let info_hash = self.info_hash;
        let timeout = self.config.network.discovery_timeout;
        self.discovery_task = Some(tokio::spawn(async move {
            let found = match tokio::time::timeout(timeout, discovery.get_peers(info_hash, wanted))
                .await
            {
                Ok(Ok(found)) => {
                    tracing::debug!(%info_hash, source = discovery.name(), count = found.len(), "Discovered peers");
                    found
                }
                Ok(Err(e)) => {
                    tracing::debug!(%info_hash, source = discovery.name(), error = %e, "Discovery failed");
                    Vec::new()
                }
                Err(_) => {
                    tracing::debug!(%info_hash, source = discovery.name(), "Discovery timed out");
                    Vec::new()
                }
            };
            let _ = found_tx.send(found);
        }));
    }

    /// Dials queued endpoints within the connection and concurrency caps.
    fn dial_candidates(&mut self) {
        if self.completed || self.failed {
            return;
        }
        let now = Instant::now();
        let dial_concurrency = self.config.swarm.dial_concurrency;
        let max_peers = self.config.swarm.max_peers;
        let mut in_flight = self
            .peers
            .values()
            .filter(|peer| {
                !peer.incoming
                    && matches!(
                        peer.state,
                        ConnectionState::Connecting | ConnectionState::Handshaking
                    )
            })
            .count();
        let mut deferred = Vec::new();

        while in_flight < dial_concurrency && self.peers.len() < max_peers {
            let Some(endpoint) = self.known.pop_front() else {
                break;
            };
            if self.banned.contains(&endpoint) || self.peers.contains_key(&endpoint) {
                continue;
            }
            if let Some(until) = self.cooldown.get(&endpoint) {
                if *until > now {
                    deferred.push(endpoint);
                    continue;
                }
                self.cooldown.remove(&endpoint);
            }
            self.spawn_connection(endpoint, PeerTransport::Outgoing, false);
            in_flight += 1;
        }
        self.known.extend(deferred);
    }

    fn accept(&mut self, endpoint: SocketAddr, stream: TcpStream, remote: PeerHandshake) {
        if self.banned.contains(&endpoint)
            || self.peers.contains_key(&endpoint)
            || self.peers.len() >= self.config.swarm.max_peers
            || self.failed
        {
            tracing::debug!(info_hash = %self.info_hash, peer = %endpoint, "Refusing incoming peer");
            return;
        }
        self.spawn_connection(endpoint, PeerTransport::Incoming { stream, remote }, true);
    }

    fn spawn_connection(&mut self, endpoint: SocketAddr, transport: PeerTransport, incoming: bool) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_peer(
            endpoint,
            conn_id,
            transport,
            self.ctx.clone(),
            commands,
        ));
        let peer = PeerConnection::new(
            endpoint,
            conn_id,
            self.store.piece_count(),
            self.config.swarm.rate_window,
            incoming,
            commands_tx,
            task,
        );
        tracing::debug!(info_hash = %self.info_hash, peer = %endpoint, conn_id, incoming, "Opening peer connection");
        self.peers.insert(endpoint, peer);
    }

    fn handle_event(&mut self, event: PeerEvent) {
        let PeerEvent {
            endpoint,
            conn_id,
            kind,
        } = event;
        let Some(peer) = self.peers.get_mut(&endpoint) else {
            return;
        };
        if peer.conn_id != conn_id {
            return;
        }
        peer.last_activity = Instant::now();

        match kind {
            PeerEventKind::Handshaking => {
                peer.transition(ConnectionState::Handshaking);
            }
            PeerEventKind::Connected { peer_id } => {
                if peer.state == ConnectionState::Connecting {
                    peer.transition(ConnectionState::Handshaking);
                }
                peer.transition(ConnectionState::Connected);
                peer.peer_id = Some(peer_id);
                self.cooldown.remove(&endpoint);
                tracing::debug!(
                    info_hash = %self.info_hash,
                    peer = %endpoint,
                    client = %peer_id.client_name(),
                    "Peer connected"
                );
                self.maybe_unchoke_early(endpoint);
            }
            PeerEventKind::Client(client) => peer.client = Some(client),
            PeerEventKind::Bitfield(bitfield) => {
                if peer.announced {
                    self.store.remove_peer_pieces(&peer.bitfield);
                }
                self.store.add_peer_pieces(&bitfield);
                peer.bitfield = bitfield;
                peer.announced = true;
                self.update_interest(endpoint);
                self.dispatch(endpoint);
            }
            PeerEventKind::Have(piece) => {
                if peer.bitfield.set(piece) {
                    self.store.add_peer_piece(piece);
                }
                peer.announced = true;
                self.update_interest(endpoint);
                self.dispatch(endpoint);
            }
            PeerEventKind::Choked => {
                peer.peer_choking = true;
                for request in peer.outstanding.drain(..) {
                    self.store.release_block(endpoint, request.block);
                }
            }
            PeerEventKind::Unchoked => {
                peer.peer_choking = false;
                self.dispatch(endpoint);
            }
            PeerEventKind::Interested => {
                peer.peer_interested = true;
                self.maybe_unchoke_early(endpoint);
            }
            PeerEventKind::NotInterested => peer.peer_interested = false,
            PeerEventKind::Activity => {}
            PeerEventKind::BlockStored { block, outcome } => {
                peer.take_request(&block);
                peer.download.record(u64::from(block.length));
                self.counters.add_downloaded(u64::from(block.length));
                self.on_block_outcome(endpoint, outcome);
                self.dispatch(endpoint);
            }
            PeerEventKind::Uploaded { bytes } => {
                peer.upload.record(bytes);
                self.counters.add_uploaded(bytes);
            }
            PeerEventKind::InvalidData { reason } => {
                tracing::debug!(info_hash = %self.info_hash, peer = %endpoint, reason = %reason, "Peer sent invalid data");
                self.ban(endpoint);
            }
            PeerEventKind::DiskFailure(error) => self.fail(TorrentError::Disk(error)),
            PeerEventKind::Disconnected { error } => self.on_disconnected(endpoint, error),
        }
    }

    fn on_block_outcome(&mut self, endpoint: SocketAddr, outcome: BlockOutcome) {
        match outcome {
            BlockOutcome::Stored | BlockOutcome::Duplicate => {}
            BlockOutcome::PieceVerified(piece) => self.on_piece_verified(piece),
            BlockOutcome::PieceFailed {
                piece,
                contributors,
                failures,
            } => {
                tracing::debug!(
                    info_hash = %self.info_hash,
                    peer = %endpoint,
                    %piece,
                    failures,
                    "Piece failed verification"
                );
                for contributor in contributors {
                    self.strike(contributor);
                }
            }
        }
    }

    fn on_piece_verified(&mut self, piece: PieceIndex) {
        tracing::debug!(info_hash = %self.info_hash, %piece, "Piece verified");
        for peer in self.peers.values_mut() {
            if !peer.is_connected() {
                continue;
            }
            peer.send(PeerMessage::Have { piece_index: piece });

            // Endgame duplicates of the finished piece are now useless
            let (done, pending): (Vec<PendingRequest>, Vec<PendingRequest>) = peer
                .outstanding
                .drain(..)
                .partition(|request| request.block.piece == piece);
            peer.outstanding = pending;
            for request in done {
                peer.send(cancel_message(request.block));
            }
        }

        let endpoints: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for endpoint in &endpoints {
            self.update_interest(*endpoint);
        }

        if !self.completed && self.store.is_complete() {
            self.completed = true;
            self.known.clear();
            tracing::info!(info_hash = %self.info_hash, "All pieces verified");
            let _ = self.notices.send(SwarmNotice::Completed {
                info_hash: self.info_hash,
            });
        }
    }

    /// Counts a hash failure against `endpoint` and bans it at the threshold.
    fn strike(&mut self, endpoint: SocketAddr) {
        let strikes = self.hash_strikes.entry(endpoint).or_insert(0);
        *strikes += 1;
        if *strikes < self.config.swarm.hash_failure_ban_threshold {
            return;
        }
        tracing::info!(info_hash = %self.info_hash, peer = %endpoint, strikes = *strikes, "Banning peer for corrupt data");
        self.ban(endpoint);
    }

    /// Never dials `endpoint` again and closes any live connection to it.
    fn ban(&mut self, endpoint: SocketAddr) {
        self.banned.insert(endpoint);
        self.known.retain(|known| *known != endpoint);
        self.cooldown.remove(&endpoint);
        if let Some(peer) = self.peers.get_mut(&endpoint) {
            peer.close();
        }
    }

    fn on_disconnected(&mut self, endpoint: SocketAddr, error: Option<TorrentError>) {
        let Some(mut peer) = self.peers.remove(&endpoint) else {
            return;
        };
        peer.transition(ConnectionState::Closed);
        if peer.announced {
            self.store.remove_peer_pieces(&peer.bitfield);
        }
        self.store.release_peer(endpoint);
        if self.optimistic == Some(endpoint) {
            self.optimistic = None;
        }
        match &error {
            Some(e) => tracing::debug!(info_hash = %self.info_hash, peer = %endpoint, error = %e, "Peer disconnected"),
            None => tracing::debug!(info_hash = %self.info_hash, peer = %endpoint, "Peer disconnected"),
        }

        // Failed handshakes and malformed frames are not retried
        if matches!(error, Some(TorrentError::ProtocolMismatch { .. })) {
            self.ban(endpoint);
            return;
        }
        if !self.banned.contains(&endpoint) && !peer.incoming {
            self.cooldown.insert(
                endpoint,
                Instant::now() + self.config.swarm.failed_peer_cooldown,
            );
            self.known.push_back(endpoint);
        }
    }

    fn fail(&mut self, error: TorrentError) {
        if self.failed {
            return;
        }
        self.failed = true;
        tracing::warn!(info_hash = %self.info_hash, error = %error, "Swarm stopped by unrecoverable error");
        for peer in self.peers.values_mut() {
            peer.close();
        }
        let _ = self.notices.send(SwarmNotice::Failed {
            info_hash: self.info_hash,
            error,
        });
    }

    fn update_interest(&mut self, endpoint: SocketAddr) {
        let Some(peer) = self.peers.get_mut(&endpoint) else {
            return;
        };
        if !peer.is_connected() {
            return;
        }
        let interested = !self.completed
            && !self.failed
            && peer
                .bitfield
                .has_any_missing_from(&self.store.verified_bitfield());
        peer.set_interested(interested);
    }

    /// Fills free request slots on `endpoint`.
    fn dispatch(&mut self, endpoint: SocketAddr) {
        if self.failed {
            return;
        }
        let Some(peer) = self.peers.get_mut(&endpoint) else {
            return;
        };
        if !peer.can_request() {
            return;
        }
        let capacity = peer.request_capacity(self.config.swarm.max_outstanding_requests);
        if capacity == 0 {
            return;
        }

        let now = Instant::now();
        for block in self
            .store
            .select_next_blocks(endpoint, &peer.bitfield, capacity)
        {
            if !peer.send(request_message(block)) {
                self.store.release_block(endpoint, block);
                continue;
            }
            peer.outstanding.push(PendingRequest {
                block,
                requested_at: now,
            });
        }
    }

    fn choke_candidates(&self, now: Instant) -> Vec<ChokeCandidate> {
        self.peers
            .values()
            .filter(|peer| peer.is_connected())
            .map(|peer| ChokeCandidate {
                endpoint: peer.endpoint,
                interested: peer.peer_interested,
                rate: if self.completed {
                    peer.upload.rate_at(now)
                } else {
                    peer.download.rate_at(now)
                },
                connected_at: peer.connected_at,
            })
            .collect()
    }

    fn run_choker(&mut self, now: Instant) {
        let slots = self.config.swarm.unchoke_slots;
        let candidates = self.choke_candidates(now);

        let rotation = self.config.swarm.optimistic_unchoke_rounds.max(1);
        if self.optimistic.is_none() || self.choke_round % rotation == 0 {
            self.optimistic = pick_optimistic(&candidates, slots, &mut rand::rng());
        }
        self.choke_round = self.choke_round.wrapping_add(1);

        let unchoked = select_unchoked(&candidates, slots, self.optimistic);
        for peer in self.peers.values_mut() {
            if peer.is_connected() {
                peer.set_choking(!unchoked.contains(&peer.endpoint));
            }
        }
    }

    /// Unchokes an interested peer right away while upload slots are free.
    fn maybe_unchoke_early(&mut self, endpoint: SocketAddr) {
        let unchoked = self
            .peers
            .values()
            .filter(|peer| peer.is_connected() && !peer.am_choking)
            .count();
        if unchoked >= self.config.swarm.unchoke_slots {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&endpoint)
            && peer.is_connected()
            && peer.peer_interested
        {
            peer.set_choking(false);
        }
    }

    fn publish_stats(&self, now: Instant) {
        let mut stats = SwarmStats::default();
        for peer in self.peers.values().filter(|peer| peer.is_connected()) {
            stats.peer_count += 1;
            if peer.is_seed() {
                stats.seed_count += 1;
            }
            stats.download_rate += peer.download.rate_at(now);
            stats.upload_rate += peer.upload.rate_at(now);
        }
        self.stats.send_replace(stats);
    }

    async fn shutdown(&mut self) {
        if let Some(task) = self.discovery_task.take() {
            task.abort();
        }
        for peer in self.peers.values_mut() {
            peer.close();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.peers.is_empty() {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) | Err(_) => break,
            }
        }
        for (endpoint, mut peer) in self.peers.drain() {
            if peer.announced {
                self.store.remove_peer_pieces(&peer.bitfield);
            }
            self.store.release_peer(endpoint);
            peer.abort();
        }
        self.publish_stats(Instant::now());
        tracing::debug!(info_hash = %self.info_hash, "Swarm connections closed");
    }
}

fn request_message(block: BlockRequest) -> PeerMessage {
    PeerMessage::Request {
        piece_index: block.piece,
        offset: block.offset,
        length: block.length,
    }
}

fn cancel_message(block: BlockRequest) -> PeerMessage {
    PeerMessage::Cancel {
        piece_index: block.piece,
        offset: block.offset,
        length: block.length,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::net::TcpListener;

    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::network::BandwidthLimiter;
    use crate::testing::{SimulatedSeed, TorrentFixture};
    use crate::torrent::protocol::{FrameReader, FrameWriter, read_handshake, write_handshake};
    use crate::torrent::{Bitfield, PeerId};

    const PIECE: u32 = 16 * 1024;
    const WAIT: Duration = Duration::from_secs(10);

    /// Four single-block pieces.
    fn fixture() -> TorrentFixture {
        TorrentFixture::single_file("swarm.bin", 4 * PIECE as usize, PIECE).unwrap()
    }

    struct Harness {
        coordinator: SwarmCoordinator,
        store: Arc<PieceStore>,
        notices: mpsc::UnboundedReceiver<SwarmNotice>,
        _stats: watch::Receiver<SwarmStats>,
    }

    async fn harness(
        fixture: &TorrentFixture,
        root: &Path,
        config: EngineConfig,
        peers: Vec<SocketAddr>,
    ) -> Harness {
        let config = Arc::new(config);
        let store = Arc::new(
            PieceStore::allocate(fixture.info().clone(), root, config.torrent.block_size, false)
                .await
                .unwrap(),
        );
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let (stats_tx, stats) = watch::channel(SwarmStats::default());
        let params = SwarmParams {
            info_hash: fixture.info_hash(),
            our_id: PeerId::generate("-NT0001-"),
            store: store.clone(),
            discovery: Arc::new(StaticDiscovery::default()),
            limiter: BandwidthLimiter::unlimited(),
            config,
            listen_port: None,
            counters: TransferCounters::default(),
            initial_peers: peers,
            notices: notices_tx,
        };
        Harness {
            coordinator: SwarmCoordinator::new(params, stats_tx),
            store,
            notices,
            _stats: stats,
        }
    }

    impl Harness {
        /// Runs the scheduling loop until `done` holds. False on timeout.
        async fn drive_until(
            &mut self,
            limit: Duration,
            done: impl Fn(&SwarmCoordinator) -> bool,
        ) -> bool {
            let deadline = tokio::time::Instant::now() + limit;
            let mut tick = tokio::time::interval(self.coordinator.config.swarm.tick_interval);
            let c = &mut self.coordinator;
            while !done(c) {
                tokio::select! {
                    Some(event) = c.events.recv() => c.handle_event(event),
                    Some(found) = c.discovered.recv() => {
                        c.discovery_task = None;
                        c.learn_peers(found);
                    }
                    _ = tick.tick() => c.on_tick(),
                    _ = tokio::time::sleep_until(deadline) => return false,
                }
            }
            true
        }
    }

    /// Accepts one connection and never sends a block. With `pieces` set it
    /// advertises that many pieces and unchokes; otherwise it stays silent.
    /// Everything it receives is forwarded.
    async fn spawn_quiet_peer(
        info_hash: InfoHash,
        pieces: Option<u32>,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<PeerMessage>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_handshake(&mut stream).await.unwrap();
            let ours = PeerHandshake::new(info_hash, PeerId::generate("-QP0001-"));
            write_handshake(&mut stream, &ours).await.unwrap();

            let (read_half, write_half) = stream.into_split();
            let mut writer = FrameWriter::new(write_half);
            if let Some(pieces) = pieces {
                let bitfield = Bitfield::full(pieces).to_bytes();
                writer.send(&PeerMessage::Bitfield { bitfield }).await.unwrap();
                writer.send(&PeerMessage::Unchoke).await.unwrap();
            }
            let mut reader = FrameReader::new(read_half);
            while let Ok(message) = reader.read_message().await {
                if tx.send(message).is_err() {
                    break;
                }
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn test_timed_out_requests_move_to_another_peer() {
        let fixture = fixture();
        let dir = tempfile::tempdir().unwrap();
        let (stalled, mut received) = spawn_quiet_peer(fixture.info_hash(), Some(4)).await;
        let mut h = harness(&fixture, dir.path(), EngineConfig::for_testing(), vec![stalled]).await;

        let requested = h
            .drive_until(WAIT, |c| {
                c.peers
                    .get(&stalled)
                    .is_some_and(|peer| peer.outstanding.len() == 4)
            })
            .await;
        assert!(requested, "stalled peer never got requests");

        let seed = SimulatedSeed::full(&fixture).await.unwrap();
        h.coordinator.learn_peers(vec![seed.addr()]);
        let store = h.store.clone();
        assert!(h.drive_until(WAIT, move |_| store.is_complete()).await);
        h.drive_until(Duration::from_millis(300), |_| false).await;

        assert_eq!(seed.blocks_served(), 4);
        let (mut requests, mut cancels) = (0, 0);
        while let Ok(message) = received.try_recv() {
            match message {
                PeerMessage::Request { .. } => requests += 1,
                PeerMessage::Cancel { .. } => cancels += 1,
                _ => {}
            }
        }
        // Each block was asked of the stalled peer once, then withdrawn
        assert_eq!(requests, 4);
        assert_eq!(cancels, 4);
        assert!(matches!(
            h.notices.try_recv(),
            Ok(SwarmNotice::Completed { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_peer_banned_at_threshold() {
        let fixture = fixture();
        let dir = tempfile::tempdir().unwrap();
        let liar = SimulatedSeed::builder()
            .corrupt(true)
            .spawn(&fixture)
            .await
            .unwrap();
        let addr = liar.addr();
        let mut h = harness(&fixture, dir.path(), EngineConfig::for_testing(), vec![addr]).await;

        assert!(h.drive_until(WAIT, |c| c.banned.contains(&addr)).await);
        let threshold = h.coordinator.config.swarm.hash_failure_ban_threshold;
        assert!(h.coordinator.hash_strikes[&addr] >= threshold);
        assert_eq!(h.store.verified_count(), 0);

        // Stays gone well past the reconnect cooldown
        let cooldown = h.coordinator.config.swarm.failed_peer_cooldown;
        h.drive_until(cooldown * 3, |_| false).await;
        assert!(!h.coordinator.peers.contains_key(&addr));
        assert!(!h.coordinator.known.contains(&addr));
        assert_eq!(liar.connections(), 1);
    }

    #[tokio::test]
    async fn test_wrong_torrent_peer_not_redialed() {
        let fixture = fixture();
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicU32::new(0));
        let counter = accepted.clone();
        let stranger = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::Relaxed);
                let _ = read_handshake(&mut stream).await;
                let other = PeerHandshake::new(InfoHash::new([0xAB; 20]), PeerId::generate("-XX0001-"));
                let _ = write_handshake(&mut stream, &other).await;
            }
        });
        let mut h = harness(&fixture, dir.path(), EngineConfig::for_testing(), vec![addr]).await;

        assert!(h.drive_until(WAIT, |c| c.banned.contains(&addr)).await);
        let cooldown = h.coordinator.config.swarm.failed_peer_cooldown;
        h.drive_until(cooldown * 3, |_| false).await;
        assert_eq!(accepted.load(Ordering::Relaxed), 1);
        assert!(!h.coordinator.known.contains(&addr));
        stranger.abort();
    }

    #[tokio::test]
    async fn test_idle_peer_dropped_and_requeued() {
        let fixture = fixture();
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::for_testing();
        config.network.idle_timeout = Duration::from_millis(300);
        let (silent, _received) = spawn_quiet_peer(fixture.info_hash(), None).await;
        let mut h = harness(&fixture, dir.path(), config, vec![silent]).await;

        let connected = h
            .drive_until(WAIT, |c| {
                c.peers.get(&silent).is_some_and(PeerConnection::is_connected)
            })
            .await;
        assert!(connected);
        assert!(h.drive_until(WAIT, |c| !c.peers.contains_key(&silent)).await);

        // Idle is not misbehavior: the endpoint waits out its cooldown
        assert!(h.coordinator.known.contains(&silent));
        assert!(!h.coordinator.banned.contains(&silent));
    }

    #[tokio::test]
    async fn test_optimistic_slot_rotates_on_schedule() {
        let fixture = fixture();
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::for_testing();
        config.swarm.unchoke_slots = 2;
        config.swarm.optimistic_unchoke_rounds = 3;
        let mut h = harness(&fixture, dir.path(), config, Vec::new()).await;

        let (commands_tx, _commands) = mpsc::unbounded_channel();
        for port in 1..=5u16 {
            let endpoint = SocketAddr::from(([10, 0, 0, 1], port));
            let mut peer = PeerConnection::new(
                endpoint,
                u64::from(port),
                4,
                Duration::from_secs(5),
                true,
                commands_tx.clone(),
                tokio::spawn(async {}),
            );
            peer.transition(ConnectionState::Connected);
            peer.peer_interested = true;
            h.coordinator.peers.insert(endpoint, peer);
        }

        let now = Instant::now();
        let mut picks = Vec::new();
        for _ in 0..30 {
            h.coordinator.run_choker(now);
            let optimistic = h.coordinator.optimistic.unwrap();
            assert!(!h.coordinator.peers[&optimistic].am_choking);
            let unchoked = h
                .coordinator
                .peers
                .values()
                .filter(|peer| !peer.am_choking)
                .count();
            assert_eq!(unchoked, 2);
            picks.push(optimistic);
        }

        // A new pick happens only on every third round
        for (round, pair) in picks.windows(2).enumerate() {
            if (round + 1) % 3 != 0 {
                assert_eq!(pair[0], pair[1], "rotated early at round {}", round + 1);
            }
        }
        let distinct: HashSet<SocketAddr> = picks.iter().copied().collect();
        assert!(distinct.len() > 1);
    }

    #[tokio::test]
    async fn test_disk_failure_stops_swarm() {
        let fixture = fixture();
        let dir = tempfile::tempdir().unwrap();
        let seed = SimulatedSeed::full(&fixture).await.unwrap();
        let mut h = harness(&fixture, dir.path(), EngineConfig::for_testing(), vec![seed.addr()]).await;

        // A directory where the data file was makes every piece write fail
        let path = dir.path().join(&fixture.info().files[0].path);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(h.drive_until(WAIT, |c| c.failed).await);
        match h.notices.try_recv() {
            Ok(SwarmNotice::Failed {
                error: TorrentError::Disk(_),
                ..
            }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.store.verified_count(), 0);
        assert!(h.drive_until(WAIT, |c| c.peers.is_empty()).await);
    }
}
