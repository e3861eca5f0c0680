//! Torrent creation from in-memory content or local files
//!
//! Splits content into pieces, hashes them with SHA-1 and emits a bencoded
//! `.torrent` file. Used by the `create` CLI command and by test fixtures.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;

use super::TorrentError;
use super::parsing::bencode;

/// Standard BitTorrent piece size (256KB)
pub const DEFAULT_PIECE_SIZE: u32 = 262_144;

#[derive(Serialize)]
struct MetainfoFile<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    announce: Option<&'a str>,
    #[serde(rename = "announce-list", skip_serializing_if = "Option::is_none")]
    announce_list: Option<Vec<Vec<&'a str>>>,
    #[serde(rename = "created by")]
    created_by: &'a str,
    #[serde(rename = "creation date")]
    creation_date: i64,
    info: InfoDict<'a>,
}

#[derive(Serialize)]
struct InfoDict<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<Vec<FileEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    name: &'a str,
    #[serde(rename = "piece length")]
    piece_length: u32,
    pieces: ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    private: Option<u8>,
}

#[derive(Serialize)]
struct FileEntry {
    length: u64,
    path: Vec<String>,
}

/// Incremental piece hasher over content that may span several files.
struct PieceHasher {
    piece_size: usize,
    hasher: Sha1,
    filled: usize,
    hashes: Vec<u8>,
}

impl PieceHasher {
    fn new(piece_size: u32) -> Self {
        Self {
            piece_size: piece_size as usize,
            hasher: Sha1::new(),
            filled: 0,
            hashes: Vec::new(),
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (self.piece_size - self.filled).min(data.len());
            self.hasher.update(&data[..take]);
            self.filled += take;
            data = &data[take..];
            if self.filled == self.piece_size {
                let digest = std::mem::replace(&mut self.hasher, Sha1::new()).finalize();
                self.hashes.extend_from_slice(&digest);
                self.filled = 0;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.hashes.extend_from_slice(&self.hasher.finalize());
        }
        self.hashes
    }
}

/// Builder for `.torrent` files.
#[derive(Debug, Clone)]
pub struct TorrentCreator {
    piece_size: u32,
    trackers: Vec<String>,
    private: bool,
}

impl Default for TorrentCreator {
    fn default() -> Self {
        Self::new()
    }
}

impl TorrentCreator {
    /// Creates torrent creator with default piece size (256KB)
    pub fn new() -> Self {
        Self::with_piece_size(DEFAULT_PIECE_SIZE)
    }

    /// Creates torrent creator with custom piece size
    pub fn with_piece_size(piece_size: u32) -> Self {
        Self {
            piece_size: piece_size.max(1),
            trackers: Vec::new(),
            private: false,
        }
    }

    /// Sets announce URLs; the first becomes `announce`, all go in `announce-list` tiers.
    pub fn with_trackers(mut self, trackers: Vec<String>) -> Self {
        self.trackers = trackers;
        self
    }

    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    /// Builds a single-file torrent from in-memory content.
    ///
    /// # Errors
    /// - `TorrentError::InvalidArgument` - Empty content or name
    pub fn build_single_file(&self, name: &str, content: &[u8]) -> Result<Vec<u8>, TorrentError> {
        if content.is_empty() {
            return Err(TorrentError::invalid_argument(
                "Cannot create torrent from empty content",
            ));
        }
        let mut hasher = PieceHasher::new(self.piece_size);
        hasher.update(content);
        self.encode(name, Some(content.len() as u64), None, hasher.finish())
    }

    /// Builds a multi-file torrent from in-memory files, in the given order.
    ///
    /// Paths are relative to the torrent root directory `name`.
    ///
    /// # Errors
    /// - `TorrentError::InvalidArgument` - No content or a path that is not valid UTF-8
    pub fn build_multi_file(
        &self,
        name: &str,
        files: &[(PathBuf, Vec<u8>)],
    ) -> Result<Vec<u8>, TorrentError> {
        let mut hasher = PieceHasher::new(self.piece_size);
        let mut entries = Vec::with_capacity(files.len());
        for (path, content) in files {
            hasher.update(content);
            entries.push(FileEntry {
                length: content.len() as u64,
                path: path_components(path)?,
            });
        }

        if entries.iter().all(|entry| entry.length == 0) {
            return Err(TorrentError::invalid_argument(
                "Cannot create torrent from empty content",
            ));
        }
        self.encode(name, None, Some(entries), hasher.finish())
    }

    /// Creates a torrent from a file or a directory on disk.
    ///
    /// Directory contents are walked recursively in sorted path order.
    ///
    /// # Errors
    /// - `TorrentError::InvalidArgument` - Path missing, empty or not UTF-8
    /// - `TorrentError::Io` - Read failure
    pub async fn create_from_path(&self, path: &Path) -> Result<Vec<u8>, TorrentError> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            TorrentError::invalid_argument(format!("Cannot read {}: {e}", path.display()))
        })?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TorrentError::invalid_argument("Invalid file name"))?
            .to_string();

        let mut hasher = PieceHasher::new(self.piece_size);

        if metadata.is_file() {
            let length = hash_file(path, &mut hasher).await?;
            if length == 0 {
                return Err(TorrentError::invalid_argument(
                    "Cannot create torrent from empty file",
                ));
            }
            return self.encode(&name, Some(length), None, hasher.finish());
        }

        let mut relative_files = Vec::new();
        collect_files(path, PathBuf::new(), &mut relative_files).await?;
        relative_files.sort();

        let mut entries = Vec::with_capacity(relative_files.len());
        for relative in relative_files {
            let length = hash_file(&path.join(&relative), &mut hasher).await?;
            entries.push(FileEntry {
                length,
                path: path_components(&relative)?,
            });
        }

        if entries.iter().all(|entry| entry.length == 0) {
            return Err(TorrentError::invalid_argument(
                "Directory contains no data",
            ));
        }
        self.encode(&name, None, Some(entries), hasher.finish())
    }

    fn encode(
        &self,
        name: &str,
        length: Option<u64>,
        files: Option<Vec<FileEntry>>,
        pieces: Vec<u8>,
    ) -> Result<Vec<u8>, TorrentError> {
        if name.is_empty() {
            return Err(TorrentError::invalid_argument("Torrent name is empty"));
        }

        let metainfo = MetainfoFile {
            announce: self.trackers.first().map(String::as_str),
            announce_list: (self.trackers.len() > 1)
                .then(|| self.trackers.iter().map(|url| vec![url.as_str()]).collect()),
            created_by: "nitro-torrent",
            creation_date: chrono::Utc::now().timestamp(),
            info: InfoDict {
                files,
                length,
                name,
                piece_length: self.piece_size,
                pieces: ByteBuf::from(pieces),
                private: self.private.then_some(1),
            },
        };

        bencode::encode(&metainfo)
    }
}

async fn hash_file(path: &Path, hasher: &mut PieceHasher) -> Result<u64, TorrentError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            return Ok(total);
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
}

async fn collect_files(
    root: &Path,
    relative: PathBuf,
    out: &mut Vec<PathBuf>,
) -> Result<(), TorrentError> {
    let mut stack = vec![relative];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(root.join(&dir)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let child = dir.join(entry.file_name());
            if file_type.is_dir() {
                stack.push(child);
            } else if file_type.is_file() {
                out.push(child);
            }
        }
    }
    Ok(())
}

fn path_components(path: &Path) -> Result<Vec<String>, TorrentError> {
    let components: Option<Vec<String>> = path
        .components()
        .map(|component| component.as_os_str().to_str().map(str::to_string))
        .collect();
    components
        .filter(|parts| !parts.is_empty())
        .ok_or_else(|| {
            TorrentError::invalid_argument(format!("Invalid file path {}", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::parsing::BencodeTorrentParser;

    #[test]
    fn test_single_file_roundtrip_through_parser() {
        let content: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let bytes = TorrentCreator::with_piece_size(16_384)
            .with_trackers(vec!["http://tracker.test/announce".to_string()])
            .build_single_file("data.bin", &content)
            .unwrap();

        let metainfo = BencodeTorrentParser::new().parse_torrent_data(&bytes).unwrap();
        let info = metainfo.info;
        assert_eq!(info.name, "data.bin");
        assert_eq!(info.total_length, 40_000);
        assert_eq!(info.piece_count(), 3);
        assert_eq!(
            info.piece_hashes[2],
            <[u8; 20]>::from(Sha1::digest(&content[32_768..]))
        );
        assert_eq!(metainfo.trackers, vec!["http://tracker.test/announce"]);
    }

    #[test]
    fn test_pieces_span_file_boundaries() {
        let files = vec![
            (PathBuf::from("a.txt"), vec![1u8; 10]),
            (PathBuf::from("nested/b.txt"), vec![2u8; 6]),
        ];
        let bytes = TorrentCreator::with_piece_size(8)
            .build_multi_file("pack", &files)
            .unwrap();
        let info = BencodeTorrentParser::new()
            .parse_torrent_data(&bytes)
            .unwrap()
            .info;

        assert_eq!(info.piece_count(), 2);
        let mut second = vec![1u8; 2];
        second.extend(vec![2u8; 6]);
        assert_eq!(info.piece_hashes[1], <[u8; 20]>::from(Sha1::digest(&second)));
        assert_eq!(info.files[1].path, PathBuf::from("pack/nested/b.txt"));
    }

    #[test]
    fn test_empty_content_rejected() {
        let creator = TorrentCreator::new();
        assert!(creator.build_single_file("empty", &[]).is_err());
        assert!(
            creator
                .build_multi_file("empty", &[(PathBuf::from("a"), Vec::new())])
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_create_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("album");
        tokio::fs::create_dir_all(root.join("disc1")).await.unwrap();
        tokio::fs::write(root.join("disc1/track.bin"), vec![3u8; 5000])
            .await
            .unwrap();
        tokio::fs::write(root.join("cover.jpg"), vec![4u8; 700])
            .await
            .unwrap();

        let bytes = TorrentCreator::with_piece_size(1024)
            .create_from_path(&root)
            .await
            .unwrap();
        let info = BencodeTorrentParser::new()
            .parse_torrent_data(&bytes)
            .unwrap()
            .info;

        assert_eq!(info.name, "album");
        assert_eq!(info.total_length, 5700);
        assert_eq!(info.files[0].path, PathBuf::from("album/cover.jpg"));
        assert_eq!(info.files[1].path, PathBuf::from("album/disc1/track.bin"));
    }
}
