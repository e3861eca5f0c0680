//! Core types for the BitTorrent wire protocol

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// Protocol identifier sent in every handshake.
pub const PROTOCOL_NAME: &str = "BitTorrent protocol";

/// Reserved-byte index and mask advertising BEP 10 extension support.
pub const EXTENSION_BYTE: usize = 5;
pub const EXTENSION_BIT: u8 = 0x10;

/// BitTorrent peer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a random peer ID behind an Azureus-style client prefix.
    ///
    /// Prefixes longer than 20 bytes are truncated.
    pub fn generate(client_prefix: &str) -> Self {
        let mut id: [u8; 20] = rand::random();
        let prefix = client_prefix.as_bytes();
        let len = prefix.len().min(20);
        id[..len].copy_from_slice(&prefix[..len]);
        Self(id)
    }

    /// Human-readable client name decoded from an Azureus-style id.
    ///
    /// Falls back to the hex of the first eight bytes.
    pub fn client_name(&self) -> String {
        let id = &self.0;
        let azureus = id[0] == b'-'
            && id[7] == b'-'
            && id[1..3].iter().all(u8::is_ascii_alphanumeric)
            && id[3..7].iter().all(u8::is_ascii_alphanumeric);
        if !azureus {
            return hex::encode(&id[..8]);
        }

        let code = String::from_utf8_lossy(&id[1..3]);
        let name = match code.as_ref() {
            "NT" => "NitroTorrent",
            "qB" => "qBittorrent",
            "TR" => "Transmission",
            "UT" => "µTorrent",
            "LT" => "libtorrent",
            "lt" => "rTorrent",
            "DE" => "Deluge",
            "AZ" => "Vuze",
            "BT" => "BitTorrent",
            "KT" => "KTorrent",
            other => other,
        };
        let version: Vec<String> = id[3..6]
            .iter()
            .map(|digit| char::from(*digit).to_string())
            .collect();
        format!("{name} {}", version.join("."))
    }
}

/// BitTorrent wire protocol messages (BEP 3 plus the BEP 10 envelope).
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Keep-alive message to maintain connection
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Announce a newly verified piece
    Have {
        piece_index: PieceIndex,
    },
    /// Complete piece availability bitmap, sent right after the handshake
    Bitfield {
        bitfield: Bytes,
    },
    Request {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// DHT port announcement; accepted and ignored
    Port {
        port: u16,
    },
    /// BEP 10 extension message: id 0 is the extension handshake
    Extended {
        id: u8,
        payload: Bytes,
    },
}

impl PeerMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "keep-alive",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Cancel { .. } => "cancel",
            PeerMessage::Port { .. } => "port",
            PeerMessage::Extended { .. } => "extended",
        }
    }
}

/// Peer handshake information.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Protocol identifier string ("BitTorrent protocol")
    pub protocol: String,
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Creates a handshake advertising extension protocol support.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the remote advertised BEP 10 extension messages.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_generation() {
        let peer_id = PeerId::generate("-NT0001-");
        assert_eq!(&peer_id.as_bytes()[..8], b"-NT0001-");

        let other = PeerId::generate("-NT0001-");
        assert_ne!(peer_id.as_bytes(), other.as_bytes());
    }

    #[test]
    fn test_client_name_decoding() {
        let mut id = [b'x'; 20];
        id[..8].copy_from_slice(b"-qB4250-");
        assert_eq!(PeerId::new(id).client_name(), "qBittorrent 4.2.5");

        id[..8].copy_from_slice(b"-ZZ1000-");
        assert_eq!(PeerId::new(id).client_name(), "ZZ 1.0.0");

        let opaque = PeerId::new([0xAB; 20]);
        assert_eq!(opaque.client_name(), "abababababababab");
    }

    #[test]
    fn test_handshake_sets_extension_bit() {
        let handshake = PeerHandshake::new(InfoHash::new([1u8; 20]), PeerId::new([2u8; 20]));
        assert_eq!(handshake.protocol, PROTOCOL_NAME);
        assert!(handshake.supports_extensions());
        assert_eq!(handshake.reserved, [0, 0, 0, 0, 0, 0x10, 0, 0]);
    }
}
