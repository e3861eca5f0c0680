//! BEP 10 extension handshake and BEP 9 `ut_metadata` messages

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::torrent::TorrentError;
use crate::torrent::parsing::bencode;

/// Extended message id reserved for the extension handshake.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;
/// Extension name for metadata exchange.
pub const UT_METADATA: &str = "ut_metadata";
/// Id under which we accept `ut_metadata` messages.
pub const LOCAL_UT_METADATA_ID: u8 = 1;
/// Metadata is exchanged in 16 KiB pieces; only the last may be shorter.
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;

/// Dictionary sent as extended message 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtensionHandshake {
    /// Extension name to message id, 0 meaning disabled
    #[serde(default)]
    pub m: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,
    /// Listen port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<i64>,
    /// Client name and version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<ByteBuf>,
    /// Outstanding request queue depth the sender accepts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<i64>,
}

impl ExtensionHandshake {
    /// Builds our handshake; `metadata_size` is set when we can serve metadata.
    pub fn ours(client: &str, metadata_size: Option<usize>, listen_port: Option<u16>) -> Self {
        let mut m = BTreeMap::new();
        m.insert(UT_METADATA.to_string(), i64::from(LOCAL_UT_METADATA_ID));
        Self {
            m,
            metadata_size: metadata_size.map(|size| size as i64),
            p: listen_port.map(i64::from),
            v: Some(ByteBuf::from(client.as_bytes().to_vec())),
            reqq: Some(250),
        }
    }

    /// Message id the remote wants `ut_metadata` messages sent under.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m
            .get(UT_METADATA)
            .and_then(|id| u8::try_from(*id).ok())
            .filter(|id| *id != 0)
    }

    /// Advertised info dictionary size, if positive.
    pub fn metadata_size(&self) -> Option<usize> {
        self.metadata_size
            .and_then(|size| usize::try_from(size).ok())
            .filter(|size| *size > 0)
    }

    pub fn client(&self) -> Option<String> {
        self.v
            .as_ref()
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// # Errors
    /// - `TorrentError::InvalidMetadata` - Value cannot be encoded
    pub fn encode(&self) -> Result<Bytes, TorrentError> {
        bencode::encode(self).map(Bytes::from)
    }

    /// # Errors
    /// - `TorrentError::ProtocolMismatch` - Payload is not a handshake dictionary
    pub fn decode(payload: &[u8]) -> Result<Self, TorrentError> {
        bencode::decode(payload)
            .map_err(|e| TorrentError::protocol(format!("bad extension handshake: {e}")))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataHeader {
    msg_type: i64,
    piece: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<i64>,
}

/// A `ut_metadata` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: usize, data: Bytes },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn piece(&self) -> u32 {
        match self {
            MetadataMessage::Request { piece }
            | MetadataMessage::Data { piece, .. }
            | MetadataMessage::Reject { piece } => *piece,
        }
    }

    /// Encodes the bencoded header followed by raw data for `Data` messages.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetadata` - Header cannot be encoded
    pub fn encode(&self) -> Result<Bytes, TorrentError> {
        let (msg_type, total_size, data) = match self {
            MetadataMessage::Request { .. } => (0, None, None),
            MetadataMessage::Data {
                total_size, data, ..
            } => (1, Some(*total_size as i64), Some(data)),
            MetadataMessage::Reject { .. } => (2, None, None),
        };
        let mut out = bencode::encode(&MetadataHeader {
            msg_type,
            piece: i64::from(self.piece()),
            total_size,
        })?;
        if let Some(data) = data {
            out.extend_from_slice(data);
        }
        Ok(Bytes::from(out))
    }

    /// # Errors
    /// - `TorrentError::ProtocolMismatch` - Malformed header or unknown message type
    pub fn decode(payload: &Bytes) -> Result<Self, TorrentError> {
        let (header, consumed): (MetadataHeader, usize) = bencode::decode_prefix(payload)
            .map_err(|e| TorrentError::protocol(format!("bad ut_metadata message: {e}")))?;
        let piece = u32::try_from(header.piece)
            .map_err(|_| TorrentError::protocol("negative ut_metadata piece"))?;

        match header.msg_type {
            0 => Ok(MetadataMessage::Request { piece }),
            1 => {
                let total_size = header
                    .total_size
                    .and_then(|size| usize::try_from(size).ok())
                    .ok_or_else(|| TorrentError::protocol("ut_metadata data without total_size"))?;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data: payload.slice(consumed..),
                })
            }
            2 => Ok(MetadataMessage::Reject { piece }),
            other => Err(TorrentError::protocol(format!(
                "unknown ut_metadata msg_type {other}"
            ))),
        }
    }
}

/// Number of metadata pieces for an info dictionary of `total_size` bytes.
pub fn metadata_piece_count(total_size: usize) -> usize {
    total_size.div_ceil(METADATA_PIECE_SIZE)
}

/// Slice of `info_bytes` served for metadata piece `piece`.
pub fn metadata_piece(info_bytes: &Bytes, piece: u32) -> Option<Bytes> {
    let start = (piece as usize).checked_mul(METADATA_PIECE_SIZE)?;
    if start >= info_bytes.len() {
        return None;
    }
    let end = (start + METADATA_PIECE_SIZE).min(info_bytes.len());
    Some(info_bytes.slice(start..end))
}
