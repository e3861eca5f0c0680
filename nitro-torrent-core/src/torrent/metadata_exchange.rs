//! Metadata exchange (BEP 9) for magnet links.
//!
//! The info dictionary is fetched piece-wise from one peer over the
//! extension protocol, reassembled, and accepted only when its SHA-1
//! matches the magnet's info-hash.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::time::Instant;

use super::protocol::extension::{
    EXTENSION_HANDSHAKE_ID, LOCAL_UT_METADATA_ID, METADATA_PIECE_SIZE, metadata_piece_count,
};
use super::protocol::{
    ExtensionHandshake, FrameReader, FrameWriter, HandshakeCodec, MetadataMessage, PeerHandshake,
    PeerId, PeerMessage, connect_with_timeout, read_handshake, write_handshake,
};
use super::{InfoHash, TorrentError};
use crate::config::EngineConfig;

/// Collects metadata pieces until the info dictionary is complete.
#[derive(Debug)]
pub struct MetadataAssembler {
    total_size: usize,
    pieces: Vec<Option<Bytes>>,
    received: usize,
}

impl MetadataAssembler {
    /// # Errors
    /// - `TorrentError::InvalidMetadata` - Size is zero or above `max_size`
    pub fn new(total_size: usize, max_size: usize) -> Result<Self, TorrentError> {
        if total_size == 0 || total_size > max_size {
            return Err(TorrentError::invalid_metadata(format!(
                "advertised metadata size {total_size} outside 1..={max_size}"
            )));
        }
        Ok(Self {
            total_size,
            pieces: vec![None; metadata_piece_count(total_size)],
            received: 0,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    fn expected_len(&self, piece: usize) -> usize {
        let start = piece * METADATA_PIECE_SIZE;
        (self.total_size - start).min(METADATA_PIECE_SIZE)
    }

    /// Stores one piece. Returns true once every piece is present.
    ///
    /// Repeated pieces are ignored.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolMismatch` - Unknown piece or wrong length
    pub fn accept(&mut self, piece: u32, data: Bytes) -> Result<bool, TorrentError> {
        let index = piece as usize;
        if index >= self.pieces.len() {
            return Err(TorrentError::protocol(format!(
                "metadata piece {piece} out of range"
            )));
        }
        let expected = self.expected_len(index);
        if data.len() != expected {
            return Err(TorrentError::protocol(format!(
                "metadata piece {piece} has {} bytes, expected {expected}",
                data.len()
            )));
        }
        if self.pieces[index].is_none() {
            self.pieces[index] = Some(data);
            self.received += 1;
        }
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.pieces.len()
    }

    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, piece)| piece.is_none())
            .map(|(index, _)| index as u32)
    }

    /// Concatenates the pieces and checks them against `info_hash`.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetadata` - Pieces missing or hash mismatch
    pub fn finish(self, info_hash: InfoHash) -> Result<Bytes, TorrentError> {
        if !self.is_complete() {
            return Err(TorrentError::invalid_metadata("metadata incomplete"));
        }
        let mut info = BytesMut::with_capacity(self.total_size);
        for piece in self.pieces.into_iter().flatten() {
            info.extend_from_slice(&piece);
        }
        let digest: [u8; 20] = Sha1::digest(&info).into();
        if InfoHash::new(digest) != info_hash {
            return Err(TorrentError::invalid_metadata(format!(
                "metadata hash {} does not match {info_hash}",
                InfoHash::new(digest)
            )));
        }
        Ok(info.freeze())
    }
}

/// Downloads the raw info dictionary for `info_hash` from one peer.
///
/// # Errors
/// - `TorrentError::PeerConnection` - Connect, read or write failure, or the exchange outlived
///   `metadata_timeout`
/// - `TorrentError::ProtocolMismatch` - Peer lacks `ut_metadata`, rejects a piece or misbehaves
/// - `TorrentError::InvalidMetadata` - Reassembled metadata fails validation
pub async fn fetch_metadata(
    address: SocketAddr,
    info_hash: InfoHash,
    peer_id: PeerId,
    config: &EngineConfig,
) -> Result<Bytes, TorrentError> {
    let stream = connect_with_timeout(address, config.network.connect_timeout).await?;
    let (mut read_half, mut write_half) = stream.into_split();

    write_handshake(&mut write_half, &PeerHandshake::new(info_hash, peer_id)).await?;
    let remote = tokio::time::timeout(
        config.network.handshake_timeout,
        read_handshake(&mut read_half),
    )
    .await
    .map_err(|_| TorrentError::peer(format!("handshake with {address} timed out")))??;
    HandshakeCodec::validate(&remote, info_hash, peer_id)?;
    if !remote.supports_extensions() {
        return Err(TorrentError::protocol("peer does not support extensions"));
    }

    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);
    let ours = ExtensionHandshake::ours(config.torrent.client_version, None, None);
    writer
        .send(&PeerMessage::Extended {
            id: EXTENSION_HANDSHAKE_ID,
            payload: ours.encode()?,
        })
        .await?;

    // One budget for the whole exchange; unrelated frames do not extend it
    let deadline = Instant::now() + config.torrent.metadata_timeout;
    let (remote_id, total_size) = loop {
        if let PeerMessage::Extended {
            id: EXTENSION_HANDSHAKE_ID,
            payload,
        } = read_before(&mut reader, deadline).await?
        {
            let handshake = ExtensionHandshake::decode(&payload)?;
            let remote_id = handshake
                .ut_metadata_id()
                .ok_or_else(|| TorrentError::protocol("peer does not offer ut_metadata"))?;
            let total_size = handshake
                .metadata_size()
                .ok_or_else(|| TorrentError::protocol("peer did not advertise metadata_size"))?;
            break (remote_id, total_size);
        }
    };

    let mut assembler = MetadataAssembler::new(total_size, config.torrent.max_metadata_size)?;
    tracing::debug!(
        %info_hash,
        peer = %address,
        size = total_size,
        pieces = assembler.piece_count(),
        "Requesting metadata"
    );

    let pending: Vec<u32> = assembler.missing().collect();
    for piece in pending {
        writer
            .send(&PeerMessage::Extended {
                id: remote_id,
                payload: MetadataMessage::Request { piece }.encode()?,
            })
            .await?;
    }

    loop {
        let PeerMessage::Extended {
            id: LOCAL_UT_METADATA_ID,
            payload,
        } = read_before(&mut reader, deadline).await?
        else {
            continue;
        };

        match MetadataMessage::decode(&payload)? {
            MetadataMessage::Data {
                piece,
                total_size: advertised,
                data,
            } => {
                if advertised != total_size {
                    return Err(TorrentError::protocol(format!(
                        "metadata size changed from {total_size} to {advertised}"
                    )));
                }
                if assembler.accept(piece, data)? {
                    break;
                }
            }
            MetadataMessage::Reject { piece } => {
                return Err(TorrentError::protocol(format!(
                    "peer rejected metadata piece {piece}"
                )));
            }
            MetadataMessage::Request { piece } => {
                let reject = MetadataMessage::Reject { piece }.encode()?;
                writer
                    .send(&PeerMessage::Extended {
                        id: remote_id,
                        payload: reject,
                    })
                    .await?;
            }
        }
    }

    writer.close().await;
    assembler.finish(info_hash)
}

async fn read_before<R>(
    reader: &mut FrameReader<R>,
    deadline: Instant,
) -> Result<PeerMessage, TorrentError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    tokio::time::timeout_at(deadline, reader.read_message())
        .await
        .map_err(|_| TorrentError::peer("metadata exchange timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_of(size: usize) -> (Bytes, InfoHash) {
        let info: Bytes = (0..size).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
        let hash = InfoHash::new(Sha1::digest(&info).into());
        (info, hash)
    }

    #[test]
    fn test_assembles_out_of_order() {
        let (info, hash) = info_of(METADATA_PIECE_SIZE * 2 + 100);
        let mut assembler = MetadataAssembler::new(info.len(), 1 << 20).unwrap();
        assert_eq!(assembler.piece_count(), 3);

        let piece = |i: usize| {
            let end = ((i + 1) * METADATA_PIECE_SIZE).min(info.len());
            info.slice(i * METADATA_PIECE_SIZE..end)
        };
        assert!(!assembler.accept(2, piece(2)).unwrap());
        assert!(!assembler.accept(0, piece(0)).unwrap());
        assert!(!assembler.accept(0, piece(0)).unwrap());
        assert_eq!(assembler.missing().collect::<Vec<_>>(), vec![1]);
        assert!(assembler.accept(1, piece(1)).unwrap());

        assert_eq!(assembler.finish(hash).unwrap(), info);
    }

    #[test]
    fn test_rejects_wrong_hash() {
        let (info, _) = info_of(500);
        let mut assembler = MetadataAssembler::new(500, 1 << 20).unwrap();
        assembler.accept(0, info).unwrap();
        let result = assembler.finish(InfoHash::new([0; 20]));
        assert!(matches!(result, Err(TorrentError::InvalidMetadata { .. })));
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(MetadataAssembler::new(0, 100).is_err());
        assert!(MetadataAssembler::new(101, 100).is_err());

        let mut assembler = MetadataAssembler::new(METADATA_PIECE_SIZE + 10, 1 << 20).unwrap();
        assert!(assembler.accept(1, Bytes::from(vec![0u8; 9])).is_err());
        assert!(assembler.accept(5, Bytes::from(vec![0u8; 10])).is_err());
    }

    #[tokio::test]
    async fn test_fetch_from_unreachable_peer_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = fetch_metadata(
            addr,
            InfoHash::new([1; 20]),
            PeerId::generate("-NT0001-"),
            &EngineConfig::for_testing(),
        )
        .await;
        assert!(matches!(result, Err(TorrentError::PeerConnection { .. })));
    }

    #[tokio::test]
    async fn test_chatty_peer_cannot_stall_exchange() {
        let info_hash = InfoHash::new([7; 20]);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Advertises metadata, then only ever sends `have`
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_handshake(&mut stream).await.unwrap();
            write_handshake(
                &mut stream,
                &PeerHandshake::new(info_hash, PeerId::generate("-XX0001-")),
            )
            .await
            .unwrap();
            let (_read_half, write_half) = stream.into_split();
            let mut writer = FrameWriter::new(write_half);
            let handshake = ExtensionHandshake::ours("Chatty", Some(100), None);
            writer
                .send(&PeerMessage::Extended {
                    id: EXTENSION_HANDSHAKE_ID,
                    payload: handshake.encode().unwrap(),
                })
                .await
                .unwrap();
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                let have = PeerMessage::Have {
                    piece_index: crate::torrent::PieceIndex::new(0),
                };
                if writer.send(&have).await.is_err() {
                    break;
                }
            }
        });

        let config = EngineConfig::for_testing();
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            config.torrent.metadata_timeout * 3,
            fetch_metadata(addr, info_hash, PeerId::generate("-NT0001-"), &config),
        )
        .await
        .expect("exchange outlived its deadline");

        assert!(matches!(result, Err(TorrentError::PeerConnection { .. })));
        assert!(started.elapsed() < config.torrent.metadata_timeout * 2);
        peer.abort();
    }
}
