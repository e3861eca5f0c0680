//! Per-connection I/O task.
//!
//! Owns the socket: performs the handshake, reads frames in a dedicated
//! reader task, writes messages the coordinator queues, stores received
//! blocks and serves upload requests. Everything the coordinator needs to
//! know flows back as [`PeerEvent`]s tagged with the connection id.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use super::peer_connection::PeerCommand;
use super::protocol::extension::{
    EXTENSION_HANDSHAKE_ID, LOCAL_UT_METADATA_ID, metadata_piece,
};
use super::protocol::{
    ExtensionHandshake, FrameReader, FrameWriter, HandshakeCodec, MetadataMessage, PeerHandshake,
    PeerId, PeerMessage, connect_with_timeout, read_handshake, write_handshake,
};
use super::{Bitfield, BlockRequest, InfoHash, PieceIndex, TorrentError};
use crate::config::EngineConfig;
use crate::network::BandwidthLimiter;
use crate::storage::{BlockOutcome, PieceStore, StorageError};

/// Upload requests queued per peer before further requests are dropped.
const MAX_UPLOAD_QUEUE: usize = 256;
/// Frames buffered between the reader task and the connection loop.
const READ_BUFFER: usize = 64;

/// Something a peer task reports to its coordinator.
#[derive(Debug)]
pub(crate) struct PeerEvent {
    pub endpoint: SocketAddr,
    pub conn_id: u64,
    pub kind: PeerEventKind,
}

#[derive(Debug)]
pub(crate) enum PeerEventKind {
    /// TCP connected, handshake in progress
    Handshaking,
    /// Handshake accepted
    Connected {
        peer_id: PeerId,
    },
    Client(String),
    Bitfield(Bitfield),
    Have(PieceIndex),
    Choked,
    Unchoked,
    Interested,
    NotInterested,
    /// Any other traffic, used for idle tracking
    Activity,
    BlockStored {
        block: BlockRequest,
        outcome: BlockOutcome,
    },
    Uploaded {
        bytes: u64,
    },
    /// The peer sent data that cannot be stored
    InvalidData {
        reason: String,
    },
    /// Writing a verified piece failed
    DiskFailure(StorageError),
    /// Connection ended; `error` is `None` for an orderly close
    Disconnected {
        error: Option<TorrentError>,
    },
}

/// How the connection came to exist.
pub(crate) enum PeerTransport {
    Outgoing,
    /// Accepted by the listener, which already read the remote handshake
    Incoming {
        stream: TcpStream,
        remote: PeerHandshake,
    },
}

/// Shared, per-torrent inputs every peer task needs.
#[derive(Clone)]
pub(crate) struct PeerTaskContext {
    pub info_hash: InfoHash,
    pub our_id: PeerId,
    pub store: Arc<PieceStore>,
    pub limiter: BandwidthLimiter,
    pub config: Arc<EngineConfig>,
    pub listen_port: Option<u16>,
    pub events: mpsc::UnboundedSender<PeerEvent>,
}

struct Session {
    endpoint: SocketAddr,
    conn_id: u64,
    ctx: PeerTaskContext,
    writer: FrameWriter<OwnedWriteHalf>,
    am_choking: bool,
    remote_metadata_id: Option<u8>,
    uploads: VecDeque<BlockRequest>,
    last_sent: Instant,
}

impl Session {
    fn emit(&self, kind: PeerEventKind) -> bool {
        self.ctx
            .events
            .send(PeerEvent {
                endpoint: self.endpoint,
                conn_id: self.conn_id,
                kind,
            })
            .is_ok()
    }

    async fn send(&mut self, message: &PeerMessage) -> Result<usize, TorrentError> {
        let written = self.writer.send(message).await?;
        self.last_sent = Instant::now();
        Ok(written)
    }
}

/// Runs one connection until it closes, then reports `Disconnected`.
pub(crate) async fn run_peer(
    endpoint: SocketAddr,
    conn_id: u64,
    transport: PeerTransport,
    ctx: PeerTaskContext,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
) {
    let events = ctx.events.clone();
    let error = drive(endpoint, conn_id, transport, ctx, commands).await.err();
    match &error {
        Some(e) => tracing::debug!(peer = %endpoint, conn_id, error = %e, "Peer connection ended"),
        None => tracing::debug!(peer = %endpoint, conn_id, "Peer connection closed"),
    }
    let _ = events.send(PeerEvent {
        endpoint,
        conn_id,
        kind: PeerEventKind::Disconnected { error },
    });
}

async fn drive(
    endpoint: SocketAddr,
    conn_id: u64,
    transport: PeerTransport,
    ctx: PeerTaskContext,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
) -> Result<(), TorrentError> {
    let network = &ctx.config.network;
    let ours = PeerHandshake::new(ctx.info_hash, ctx.our_id);

    let (stream, remote) = match transport {
        PeerTransport::Outgoing => {
            let mut stream = connect_with_timeout(endpoint, network.connect_timeout).await?;
            let _ = ctx.events.send(PeerEvent {
                endpoint,
                conn_id,
                kind: PeerEventKind::Handshaking,
            });
            write_handshake(&mut stream, &ours).await?;
            let remote = tokio::time::timeout(network.handshake_timeout, read_handshake(&mut stream))
                .await
                .map_err(|_| TorrentError::peer("handshake timed out"))??;
            (stream, remote)
        }
        PeerTransport::Incoming { mut stream, remote } => {
            write_handshake(&mut stream, &ours).await?;
            (stream, remote)
        }
    };
    HandshakeCodec::validate(&remote, ctx.info_hash, ctx.our_id)?;

    let (read_half, write_half) = stream.into_split();
    let mut session = Session {
        endpoint,
        conn_id,
        ctx: ctx.clone(),
        writer: FrameWriter::new(write_half),
        am_choking: true,
        remote_metadata_id: None,
        uploads: VecDeque::new(),
        last_sent: Instant::now(),
    };
    session.emit(PeerEventKind::Connected {
        peer_id: remote.peer_id,
    });

    // Bitfield must be the first message after the handshake
    let verified = ctx.store.verified_bitfield();
    if !verified.is_empty() {
        session
            .send(&PeerMessage::Bitfield {
                bitfield: verified.to_bytes(),
            })
            .await?;
    }
    if remote.supports_extensions() {
        let handshake = ExtensionHandshake::ours(
            ctx.config.torrent.client_version,
            Some(ctx.store.info().info_bytes().len()),
            ctx.listen_port,
        );
        session
            .send(&PeerMessage::Extended {
                id: EXTENSION_HANDSHAKE_ID,
                payload: handshake.encode()?,
            })
            .await?;
    }

    let (frames_tx, mut frames) = mpsc::channel(READ_BUFFER);
    let reader = tokio::spawn(read_frames(read_half, frames_tx, ctx.limiter.clone()));
    let mut keep_alive = tokio::time::interval(network.keep_alive_interval);
    keep_alive.reset();

    let result = loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(PeerCommand::Send(message)) => {
                    match &message {
                        PeerMessage::Choke => {
                            session.am_choking = true;
                            session.uploads.clear();
                        }
                        PeerMessage::Unchoke => session.am_choking = false,
                        _ => {}
                    }
                    if let Err(e) = session.send(&message).await {
                        break Err(e);
                    }
                }
                Some(PeerCommand::Close) | None => break Ok(()),
            },
            frame = frames.recv() => match frame {
                Some(Ok(message)) => {
                    if let Err(e) = handle_message(&mut session, message).await {
                        break Err(e);
                    }
                }
                Some(Err(e)) => break Err(e),
                None => break Err(TorrentError::peer("reader stopped")),
            },
            _ = std::future::ready(()), if !session.uploads.is_empty() => {
                if let Err(e) = serve_upload(&mut session).await {
                    break Err(e);
                }
            }
            _ = keep_alive.tick() => {
                if session.last_sent.elapsed() >= network.keep_alive_interval
                    && let Err(e) = session.send(&PeerMessage::KeepAlive).await
                {
                    break Err(e);
                }
            }
        }
    };

    reader.abort();
    session.writer.close().await;
    result
}

async fn read_frames(
    read_half: OwnedReadHalf,
    frames: mpsc::Sender<Result<PeerMessage, TorrentError>>,
    limiter: BandwidthLimiter,
) {
    let mut reader = FrameReader::new(read_half);
    loop {
        let message = reader.read_message().await;
        let failed = message.is_err();
        if let Ok(PeerMessage::Piece { data, .. }) = &message {
            limiter.acquire_download(data.len()).await;
        }
        if frames.send(message).await.is_err() || failed {
            return;
        }
    }
}

async fn handle_message(session: &mut Session, message: PeerMessage) -> Result<(), TorrentError> {
    let piece_count = session.ctx.store.piece_count();
    match message {
        PeerMessage::Choke => {
            session.emit(PeerEventKind::Choked);
        }
        PeerMessage::Unchoke => {
            session.emit(PeerEventKind::Unchoked);
        }
        PeerMessage::Interested => {
            session.emit(PeerEventKind::Interested);
        }
        PeerMessage::NotInterested => {
            session.emit(PeerEventKind::NotInterested);
        }
        PeerMessage::Have { piece_index } => {
            if piece_index.as_u32() >= piece_count {
                return Err(TorrentError::protocol(format!(
                    "have for piece {piece_index} of {piece_count}"
                )));
            }
            session.emit(PeerEventKind::Have(piece_index));
        }
        PeerMessage::Bitfield { bitfield } => {
            let bitfield = Bitfield::from_bytes(&bitfield, piece_count)?;
            session.emit(PeerEventKind::Bitfield(bitfield));
        }
        PeerMessage::Request {
            piece_index,
            offset,
            length,
        } => {
            if !session.am_choking && session.uploads.len() < MAX_UPLOAD_QUEUE {
                session
                    .uploads
                    .push_back(BlockRequest::new(piece_index, offset, length));
            }
            session.emit(PeerEventKind::Activity);
        }
        PeerMessage::Cancel {
            piece_index,
            offset,
            length,
        } => {
            let cancelled = BlockRequest::new(piece_index, offset, length);
            session.uploads.retain(|request| *request != cancelled);
            session.emit(PeerEventKind::Activity);
        }
        PeerMessage::Piece {
            piece_index,
            offset,
            data,
        } => store_block(session, piece_index, offset, data).await,
        PeerMessage::Extended { id, payload } => {
            handle_extended(session, id, payload).await?;
        }
        PeerMessage::KeepAlive | PeerMessage::Port { .. } => {
            session.emit(PeerEventKind::Activity);
        }
    }
    Ok(())
}

async fn store_block(session: &mut Session, piece: PieceIndex, offset: u32, data: Bytes) {
    let block = BlockRequest::new(piece, offset, data.len() as u32);
    let kind = match session
        .ctx
        .store
        .write_block(session.endpoint, piece, offset, data)
        .await
    {
        Ok(outcome) => PeerEventKind::BlockStored { block, outcome },
        Err(StorageError::OutOfRange { .. }) => PeerEventKind::InvalidData {
            reason: format!("block {block} does not fit the torrent"),
        },
        Err(e) => PeerEventKind::DiskFailure(e),
    };
    session.emit(kind);
}

async fn handle_extended(
    session: &mut Session,
    id: u8,
    payload: Bytes,
) -> Result<(), TorrentError> {
    match id {
        EXTENSION_HANDSHAKE_ID => {
            let handshake = ExtensionHandshake::decode(&payload)?;
            session.remote_metadata_id = handshake.ut_metadata_id();
            if let Some(client) = handshake.client() {
                session.emit(PeerEventKind::Client(client));
            }
        }
        LOCAL_UT_METADATA_ID => {
            let message = MetadataMessage::decode(&payload)?;
            if let (MetadataMessage::Request { piece }, Some(remote_id)) =
                (message, session.remote_metadata_id)
            {
                let info_bytes = session.ctx.store.info().info_bytes();
                let reply = match metadata_piece(info_bytes, piece) {
                    Some(data) => MetadataMessage::Data {
                        piece,
                        total_size: info_bytes.len(),
                        data,
                    },
                    None => MetadataMessage::Reject { piece },
                };
                session
                    .send(&PeerMessage::Extended {
                        id: remote_id,
                        payload: reply.encode()?,
                    })
                    .await?;
            }
        }
        _ => {}
    }
    session.emit(PeerEventKind::Activity);
    Ok(())
}

async fn serve_upload(session: &mut Session) -> Result<(), TorrentError> {
    let Some(request) = session.uploads.pop_front() else {
        return Ok(());
    };
    let data = match session
        .ctx
        .store
        .read_block(request.piece, request.offset, request.length)
        .await
    {
        Ok(data) => data,
        Err(e @ (StorageError::PieceNotVerified { .. } | StorageError::OutOfRange { .. })) => {
            return Err(TorrentError::protocol(format!("bad request {request}: {e}")));
        }
        Err(e) => {
            tracing::warn!(peer = %session.endpoint, error = %e, "Failed to read block for upload");
            return Ok(());
        }
    };

    session.ctx.limiter.acquire_upload(data.len()).await;
    // Choke or cancel may have arrived while waiting for budget
    if session.am_choking {
        return Ok(());
    }
    let bytes = data.len() as u64;
    session
        .send(&PeerMessage::Piece {
            piece_index: request.piece,
            offset: request.offset,
            data,
        })
        .await?;
    session.emit(PeerEventKind::Uploaded { bytes });
    Ok(())
}
