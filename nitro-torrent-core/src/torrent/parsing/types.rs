//! Core types produced by metadata parsing

use std::net::SocketAddr;
use std::path::PathBuf;

use bytes::Bytes;

use super::super::{InfoHash, PieceIndex};

/// Resolved, immutable torrent metadata.
///
/// Invariants checked at construction: file lengths sum to
/// `total_length` and there is exactly one hash per `piece_length` chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub files: Vec<TorrentFile>,
    pub private: bool,
    pub(crate) info_bytes: Bytes,
}

/// A file within the torrent's content, laid out back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path relative to the save directory, rooted at the torrent name for multi-file torrents
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset of this file within the concatenated content
    pub offset: u64,
}

/// Portion of a file covered by a range of torrent content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// A parsed `.torrent` file: the info dictionary plus announce data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub info: TorrentInfo,
    pub trackers: Vec<String>,
}

/// Magnet link components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    /// Peer addresses from `x.pe` parameters
    pub peers: Vec<SocketAddr>,
}

/// Input to metadata resolution.
#[derive(Debug, Clone)]
pub enum MetadataSource {
    Magnet(MagnetLink),
    FileBytes(Bytes),
}

impl TorrentInfo {
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Length of a piece; the last piece may be shorter.
    pub fn piece_size(&self, piece: PieceIndex) -> u32 {
        let start = self.piece_offset(piece);
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(u64::from(self.piece_length)) as u32
    }

    /// Byte offset of a piece within the concatenated content.
    pub fn piece_offset(&self, piece: PieceIndex) -> u64 {
        u64::from(piece.as_u32()) * u64::from(self.piece_length)
    }

    pub fn expected_hash(&self, piece: PieceIndex) -> Option<&[u8; 20]> {
        self.piece_hashes.get(piece.as_usize())
    }

    /// Raw bencoded info dictionary exactly as hashed.
    pub fn info_bytes(&self) -> &Bytes {
        &self.info_bytes
    }

    /// Maps a content range onto the files that hold it, in order.
    ///
    /// Zero-length files are skipped.
    pub fn file_slices(&self, content_offset: u64, length: u64) -> Vec<FileSlice> {
        let end = content_offset.saturating_add(length).min(self.total_length);
        let mut slices = Vec::new();

        for (file_index, file) in self.files.iter().enumerate() {
            let file_end = file.offset + file.length;
            if file.length == 0 || file_end <= content_offset {
                continue;
            }
            if file.offset >= end {
                break;
            }

            let start = content_offset.max(file.offset);
            let stop = end.min(file_end);
            slices.push(FileSlice {
                file_index,
                file_offset: start - file.offset,
                length: stop - start,
            });
        }

        slices
    }
}

impl MagnetLink {
    /// Display name, falling back to the hex info-hash.
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.info_hash.to_string())
    }
}
