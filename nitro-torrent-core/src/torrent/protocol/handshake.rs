//! BitTorrent handshake serialization and validation

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::{PROTOCOL_NAME, PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Length of a BEP 3 handshake: pstrlen, pstr, reserved, info-hash, peer id.
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LEN);
        buf.push(handshake.protocol.len() as u8);
        buf.extend_from_slice(handshake.protocol.as_bytes());
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(handshake.info_hash.as_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// Deserializes handshake message following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::ProtocolMismatch` - Wrong length or protocol identifier
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, TorrentError> {
        if data.len() != HANDSHAKE_LEN {
            return Err(TorrentError::protocol(format!(
                "handshake is {} bytes, expected {HANDSHAKE_LEN}",
                data.len()
            )));
        }

        let protocol_len = data[0] as usize;
        if protocol_len != PROTOCOL_NAME.len() || &data[1..20] != PROTOCOL_NAME.as_bytes() {
            return Err(TorrentError::protocol("peer does not speak BitTorrent protocol"));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(PeerHandshake {
            protocol: PROTOCOL_NAME.to_string(),
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }

    /// Checks a remote handshake against the torrent we expect.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolMismatch` - Different info-hash or a connection to ourselves
    pub fn validate(
        remote: &PeerHandshake,
        expected: InfoHash,
        our_id: PeerId,
    ) -> Result<(), TorrentError> {
        if remote.info_hash != expected {
            return Err(TorrentError::protocol(format!(
                "info hash mismatch: expected {expected}, got {}",
                remote.info_hash
            )));
        }
        if remote.peer_id == our_id {
            return Err(TorrentError::protocol("connected to ourselves"));
        }
        Ok(())
    }
}

/// Writes our handshake to the stream.
///
/// # Errors
/// - `TorrentError::PeerConnection` - Write failure
pub async fn write_handshake<W>(writer: &mut W, handshake: &PeerHandshake) -> Result<(), TorrentError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&HandshakeCodec::serialize_handshake(handshake))
        .await
        .map_err(|e| TorrentError::peer(format!("failed to send handshake: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| TorrentError::peer(format!("failed to send handshake: {e}")))
}

/// Reads one handshake from the stream.
///
/// # Errors
/// - `TorrentError::PeerConnection` - Read failure or early close
/// - `TorrentError::ProtocolMismatch` - Malformed handshake
pub async fn read_handshake<R>(reader: &mut R) -> Result<PeerHandshake, TorrentError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; HANDSHAKE_LEN];
    reader
        .read_exact(&mut buffer)
        .await
        .map_err(|e| TorrentError::peer(format!("failed to read handshake: {e}")))?;
    HandshakeCodec::deserialize_handshake(&buffer)
}
