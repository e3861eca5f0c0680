//! BitTorrent protocol implementation: metadata, wire protocol, peers and swarm scheduling

pub mod bitfield;
pub mod creation;
pub mod metadata_exchange;
pub mod parsing;
pub mod peer_connection;
pub(crate) mod peer_task;
pub mod protocol;
pub mod rate;
pub mod resolver;
pub mod swarm;

use std::fmt;

pub use bitfield::Bitfield;
pub use creation::{DEFAULT_PIECE_SIZE, TorrentCreator};
pub use metadata_exchange::MetadataAssembler;
pub use parsing::{MagnetLink, Metainfo, MetadataSource, TorrentFile, TorrentInfo};
pub use peer_connection::{ConnectionState, PeerConnection, PeerSnapshot};
pub use protocol::{PeerHandshake, PeerId, PeerMessage};
pub use rate::RateMeter;
pub use resolver::MetadataResolver;
pub use swarm::{SwarmHandle, SwarmNotice, SwarmParams, SwarmStats, TransferCounters, spawn_swarm};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the bencoded info dictionary. Its lowercase hex
/// form doubles as the session-visible torrent id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Parses the 40 character hex form used as torrent id.
    pub fn from_hex(text: &str) -> Option<Self> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(text, &mut hash).ok()?;
        Some(Self(hash))
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex form, identical to the `Display` output.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A sub-range of a piece: the unit of network requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRequest {
    pub piece: PieceIndex,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: PieceIndex, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }
}

impl fmt::Display for BlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}:{}", self.piece, self.offset, self.length)
    }
}

/// Errors that can occur during torrent operations.
///
/// The first group is surfaced to callers of the session control surface.
/// Peer-level variants stay inside the swarm and are recovered from by
/// dropping the connection.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Invalid metadata: {reason}")]
    InvalidMetadata { reason: String },

    #[error("Protocol mismatch: {reason}")]
    ProtocolMismatch { reason: String },

    #[error("Metadata for {info_hash} not received after {attempts} attempts")]
    MetadataTimeout { info_hash: InfoHash, attempts: u32 },

    #[error("Disk error: {0}")]
    Disk(#[from] StorageError),

    #[error("Torrent {id} not found")]
    NotFound { id: String },

    #[error("Torrent {info_hash} already added")]
    DuplicateTorrent { info_hash: InfoHash },

    #[error("Peer connection error: {reason}")]
    PeerConnection { reason: String },

    #[error("Tracker {url} failed: {reason}")]
    Tracker { url: String, reason: String },

    #[error("Session engine has shut down")]
    EngineShutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TorrentError {
    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_metadata(reason: impl Into<String>) -> Self {
        Self::InvalidMetadata {
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolMismatch {
            reason: reason.into(),
        }
    }

    pub(crate) fn peer(reason: impl Into<String>) -> Self {
        Self::PeerConnection {
            reason: reason.into(),
        }
    }

    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            TorrentError::InvalidArgument { reason } => format!("Invalid input: {reason}"),
            TorrentError::InvalidMetadata { reason } => {
                format!("Torrent metadata is invalid: {reason}")
            }
            TorrentError::MetadataTimeout { .. } => {
                "Could not fetch torrent metadata from any peer".to_string()
            }
            TorrentError::Disk(storage) => format!("Disk error: {storage}"),
            TorrentError::NotFound { id } => format!("Torrent {id} not found"),
            TorrentError::DuplicateTorrent { .. } => "Torrent is already added".to_string(),
            TorrentError::EngineShutdown => "Torrent session is not running".to_string(),
            TorrentError::ProtocolMismatch { .. }
            | TorrentError::PeerConnection { .. }
            | TorrentError::Tracker { .. } => "Network error occurred".to_string(),
            TorrentError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to caller input.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TorrentError::InvalidArgument { .. }
                | TorrentError::InvalidMetadata { .. }
                | TorrentError::NotFound { .. }
                | TorrentError::DuplicateTorrent { .. }
        )
    }
}
