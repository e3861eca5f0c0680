//! Deterministic torrent content with matching metadata.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::torrent::parsing::BencodeTorrentParser;
use crate::torrent::{InfoHash, PieceIndex, TorrentCreator, TorrentError, TorrentInfo};

/// A torrent together with the content its piece hashes describe.
#[derive(Debug, Clone)]
pub struct TorrentFixture {
    torrent_bytes: Bytes,
    info: Arc<TorrentInfo>,
    content: Bytes,
}

/// Byte `index` of the content generated for `seed`.
fn pattern_byte(seed: u8, index: usize) -> u8 {
    ((index * 7 + usize::from(seed)) % 251) as u8
}

fn pattern(seed: u8, length: usize) -> Vec<u8> {
    (0..length).map(|index| pattern_byte(seed, index)).collect()
}

impl TorrentFixture {
    /// Single-file torrent of `length` generated bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidArgument` - Zero length
    pub fn single_file(name: &str, length: usize, piece_size: u32) -> Result<Self, TorrentError> {
        let content = pattern(1, length);
        let bytes = TorrentCreator::with_piece_size(piece_size).build_single_file(name, &content)?;
        Self::from_parts(bytes, content)
    }

    /// Multi-file torrent; each entry is a relative path and a file length.
    ///
    /// # Errors
    /// - `TorrentError::InvalidArgument` - All files empty
    pub fn multi_file(
        name: &str,
        files: &[(&str, usize)],
        piece_size: u32,
    ) -> Result<Self, TorrentError> {
        let entries: Vec<(PathBuf, Vec<u8>)> = files
            .iter()
            .enumerate()
            .map(|(index, (path, length))| (PathBuf::from(path), pattern(index as u8 + 1, *length)))
            .collect();
        let content: Vec<u8> = entries
            .iter()
            .flat_map(|(_, data)| data.iter().copied())
            .collect();
        let bytes = TorrentCreator::with_piece_size(piece_size).build_multi_file(name, &entries)?;
        Self::from_parts(bytes, content)
    }

    fn from_parts(bytes: Vec<u8>, content: Vec<u8>) -> Result<Self, TorrentError> {
        let metainfo = BencodeTorrentParser::new().parse_torrent_data(&bytes)?;
        Ok(Self {
            torrent_bytes: Bytes::from(bytes),
            info: Arc::new(metainfo.info),
            content: Bytes::from(content),
        })
    }

    pub fn info(&self) -> &Arc<TorrentInfo> {
        &self.info
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info.info_hash
    }

    /// Session id of this torrent.
    pub fn id(&self) -> String {
        self.info.info_hash.to_hex()
    }

    /// Encoded `.torrent` file.
    pub fn torrent_bytes(&self) -> Bytes {
        self.torrent_bytes.clone()
    }

    /// Concatenated content of all files.
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn piece(&self, piece: PieceIndex) -> Bytes {
        let start = self.info.piece_offset(piece) as usize;
        let end = start + self.info.piece_size(piece) as usize;
        self.content.slice(start..end)
    }

    /// Magnet link carrying the info-hash, name and `x.pe` peer hints.
    pub fn magnet_link(&self, peers: &[SocketAddr]) -> String {
        let mut link = format!(
            "magnet:?xt=urn:btih:{}&dn={}",
            self.info.info_hash,
            urlencoding::encode(&self.info.name)
        );
        for peer in peers {
            link.push_str("&x.pe=");
            link.push_str(&peer.to_string());
        }
        link
    }

    /// Writes the complete content into `root` using the torrent's layout.
    ///
    /// # Errors
    /// - `std::io::Error` - Directory or file cannot be written
    pub async fn write_to(&self, root: &Path) -> std::io::Result<()> {
        for file in &self.info.files {
            let path = root.join(&file.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let start = file.offset as usize;
            let end = start + file.length as usize;
            tokio::fs::write(&path, &self.content[start..end]).await?;
        }
        Ok(())
    }

    /// Reads the files back from `root` and compares them with the content.
    pub async fn matches_on_disk(&self, root: &Path) -> bool {
        for file in &self.info.files {
            let Ok(data) = tokio::fs::read(root.join(&file.path)).await else {
                return false;
            };
            let start = file.offset as usize;
            let end = start + file.length as usize;
            if data != self.content[start..end] {
                return false;
            }
        }
        true
    }
}
