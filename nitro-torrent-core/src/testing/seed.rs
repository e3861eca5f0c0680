//! Loopback peer that seeds a fixture over the real wire protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};

use super::TorrentFixture;
use crate::torrent::protocol::extension::{
    EXTENSION_HANDSHAKE_ID, LOCAL_UT_METADATA_ID, metadata_piece,
};
use crate::torrent::protocol::{
    ExtensionHandshake, FrameReader, FrameWriter, MetadataMessage, read_handshake, write_handshake,
};
use crate::torrent::{
    Bitfield, PeerHandshake, PeerId, PeerMessage, PieceIndex, TorrentError, TorrentInfo,
};

/// Builder for customizing seed behavior.
#[derive(Debug, Clone)]
pub struct SeedBuilder {
    pieces: Option<Vec<u32>>,
    corrupt: bool,
    serve_metadata: bool,
}

impl Default for SeedBuilder {
    fn default() -> Self {
        Self {
            pieces: None,
            corrupt: false,
            serve_metadata: true,
        }
    }
}

impl SeedBuilder {
    /// Advertise and serve only these pieces.
    pub fn pieces(mut self, pieces: impl IntoIterator<Item = u32>) -> Self {
        self.pieces = Some(pieces.into_iter().collect());
        self
    }

    /// Serve blocks with every byte inverted.
    pub fn corrupt(mut self, corrupt: bool) -> Self {
        self.corrupt = corrupt;
        self
    }

    /// Answer `ut_metadata` requests; rejected when off.
    pub fn serve_metadata(mut self, serve: bool) -> Self {
        self.serve_metadata = serve;
        self
    }

    /// Binds a loopback listener and starts serving.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Loopback bind failed
    pub async fn spawn(self, fixture: &TorrentFixture) -> Result<SimulatedSeed, TorrentError> {
        let info = fixture.info().clone();
        let mut have = Bitfield::new(info.piece_count());
        match &self.pieces {
            Some(pieces) => {
                for piece in pieces {
                    if *piece < info.piece_count() {
                        have.set(PieceIndex::new(*piece));
                    }
                }
            }
            None => have = Bitfield::full(info.piece_count()),
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(SeedState {
            info,
            content: fixture.content().clone(),
            have,
            corrupt: self.corrupt,
            serve_metadata: self.serve_metadata,
            peer_id: PeerId::generate("-SS0001-"),
            blocks_served: AtomicU64::new(0),
            connections: AtomicU64::new(0),
        });

        let task = tokio::spawn(accept_loop(listener, state.clone()));
        Ok(SimulatedSeed {
            addr,
            state,
            task,
            outgoing: Mutex::new(JoinSet::new()),
        })
    }
}

struct SeedState {
    info: Arc<TorrentInfo>,
    content: Bytes,
    have: Bitfield,
    corrupt: bool,
    serve_metadata: bool,
    peer_id: PeerId,
    blocks_served: AtomicU64,
    connections: AtomicU64,
}

/// A peer on loopback that holds some or all pieces of a fixture.
///
/// Answers interest with an unchoke, serves block requests for the pieces
/// it advertises and serves metadata. Stops when dropped.
pub struct SimulatedSeed {
    addr: SocketAddr,
    state: Arc<SeedState>,
    task: JoinHandle<()>,
    outgoing: Mutex<JoinSet<()>>,
}

impl SimulatedSeed {
    pub fn builder() -> SeedBuilder {
        SeedBuilder::default()
    }

    /// Seed holding every piece.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Loopback bind failed
    pub async fn full(fixture: &TorrentFixture) -> Result<Self, TorrentError> {
        Self::builder().spawn(fixture).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> PeerId {
        self.state.peer_id
    }

    /// Blocks sent so far across all connections.
    pub fn blocks_served(&self) -> u64 {
        self.state.blocks_served.load(Ordering::Relaxed)
    }

    /// Handshaken connections so far, accepted or dialed.
    pub fn connections(&self) -> u64 {
        self.state.connections.load(Ordering::Relaxed)
    }

    /// Dials `addr` and seeds to it, like a peer that found us first.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Connect failed
    pub async fn connect_to(&self, addr: SocketAddr) -> Result<(), TorrentError> {
        let stream = TcpStream::connect(addr).await?;
        let state = self.state.clone();
        self.outgoing.lock().spawn(async move {
            if let Err(e) = dial_peer(stream, &state).await {
                tracing::debug!(peer = %addr, error = %e, "Simulated seed session ended");
            }
        });
        Ok(())
    }
}

impl Drop for SimulatedSeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<SeedState>) {
    let mut sessions = JoinSet::new();
    while let Ok((stream, remote)) = listener.accept().await {
        let state = state.clone();
        sessions.spawn(async move {
            if let Err(e) = serve_peer(stream, &state).await {
                tracing::debug!(peer = %remote, error = %e, "Simulated seed session ended");
            }
        });
    }
}

async fn serve_peer(mut stream: TcpStream, state: &SeedState) -> Result<(), TorrentError> {
    let remote = read_handshake(&mut stream).await?;
    if remote.info_hash != state.info.info_hash {
        return Err(TorrentError::protocol("unknown info hash"));
    }
    write_handshake(
        &mut stream,
        &PeerHandshake::new(state.info.info_hash, state.peer_id),
    )
    .await?;
    serve_session(stream, remote, state).await
}

async fn dial_peer(mut stream: TcpStream, state: &SeedState) -> Result<(), TorrentError> {
    write_handshake(
        &mut stream,
        &PeerHandshake::new(state.info.info_hash, state.peer_id),
    )
    .await?;
    let remote = read_handshake(&mut stream).await?;
    if remote.info_hash != state.info.info_hash {
        return Err(TorrentError::protocol("unknown info hash"));
    }
    serve_session(stream, remote, state).await
}

async fn serve_session(
    stream: TcpStream,
    remote: PeerHandshake,
    state: &SeedState,
) -> Result<(), TorrentError> {
    state.connections.fetch_add(1, Ordering::Relaxed);

    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    if !state.have.is_empty() {
        writer
            .send(&PeerMessage::Bitfield {
                bitfield: state.have.to_bytes(),
            })
            .await?;
    }
    if remote.supports_extensions() {
        let metadata_size = state
            .serve_metadata
            .then(|| state.info.info_bytes().len());
        let handshake = ExtensionHandshake::ours("SimulatedSeed", metadata_size, None);
        writer
            .send(&PeerMessage::Extended {
                id: EXTENSION_HANDSHAKE_ID,
                payload: handshake.encode()?,
            })
            .await?;
    }

    let mut remote_metadata_id = None;
    loop {
        // Remote closing the connection ends the session normally
        let Ok(message) = reader.read_message().await else {
            return Ok(());
        };

        match message {
            PeerMessage::Interested => {
                writer.send(&PeerMessage::Unchoke).await?;
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                let Some(data) = state.block(piece_index, offset, length) else {
                    continue;
                };
                writer
                    .send(&PeerMessage::Piece {
                        piece_index,
                        offset,
                        data,
                    })
                    .await?;
                state.blocks_served.fetch_add(1, Ordering::Relaxed);
            }
            PeerMessage::Extended {
                id: EXTENSION_HANDSHAKE_ID,
                payload,
            } => {
                remote_metadata_id = ExtensionHandshake::decode(&payload)?.ut_metadata_id();
            }
            PeerMessage::Extended {
                id: LOCAL_UT_METADATA_ID,
                payload,
            } => {
                let (Some(reply_id), MetadataMessage::Request { piece }) =
                    (remote_metadata_id, MetadataMessage::decode(&payload)?)
                else {
                    continue;
                };
                let info_bytes = state.info.info_bytes();
                let reply = match metadata_piece(info_bytes, piece) {
                    Some(data) if state.serve_metadata => MetadataMessage::Data {
                        piece,
                        total_size: info_bytes.len(),
                        data,
                    },
                    _ => MetadataMessage::Reject { piece },
                };
                writer
                    .send(&PeerMessage::Extended {
                        id: reply_id,
                        payload: reply.encode()?,
                    })
                    .await?;
            }
            _ => {}
        }
    }
}

impl SeedState {
    fn block(&self, piece: PieceIndex, offset: u32, length: u32) -> Option<Bytes> {
        if !self.have.has(piece) || offset.checked_add(length)? > self.info.piece_size(piece) {
            return None;
        }
        let start = (self.info.piece_offset(piece) + u64::from(offset)) as usize;
        let block = self.content.slice(start..start + length as usize);
        if !self.corrupt {
            return Some(block);
        }
        Some(block.iter().map(|byte| !byte).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::torrent::metadata_exchange::fetch_metadata;

    #[tokio::test]
    async fn test_seed_serves_metadata() {
        let fixture = TorrentFixture::single_file("seed.bin", 3000, 1024).unwrap();
        let seed = SimulatedSeed::full(&fixture).await.unwrap();

        let info_bytes = fetch_metadata(
            seed.addr(),
            fixture.info_hash(),
            PeerId::generate("-NT0001-"),
            &EngineConfig::for_testing(),
        )
        .await
        .unwrap();

        assert_eq!(&info_bytes, fixture.info().info_bytes());
        assert_eq!(seed.connections(), 1);
    }

    #[tokio::test]
    async fn test_seed_without_metadata_rejects() {
        let fixture = TorrentFixture::single_file("seed.bin", 3000, 1024).unwrap();
        let seed = SimulatedSeed::builder()
            .serve_metadata(false)
            .spawn(&fixture)
            .await
            .unwrap();

        let result = fetch_metadata(
            seed.addr(),
            fixture.info_hash(),
            PeerId::generate("-NT0001-"),
            &EngineConfig::for_testing(),
        )
        .await;
        assert!(matches!(result, Err(TorrentError::ProtocolMismatch { .. })));
    }

    #[test]
    fn test_corrupt_blocks_differ() {
        let fixture = TorrentFixture::single_file("seed.bin", 100, 64).unwrap();
        let state = SeedState {
            info: fixture.info().clone(),
            content: fixture.content().clone(),
            have: Bitfield::full(2),
            corrupt: true,
            serve_metadata: true,
            peer_id: PeerId::generate("-SS0001-"),
            blocks_served: AtomicU64::new(0),
            connections: AtomicU64::new(0),
        };

        let block = state.block(PieceIndex::new(1), 0, 36).unwrap();
        assert_ne!(block, fixture.piece(PieceIndex::new(1)));
        assert!(state.block(PieceIndex::new(1), 0, 40).is_none());
    }
}
