//! `.torrent` parsing and info-dictionary validation

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use serde::Deserialize;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use super::super::{InfoHash, TorrentError};
use super::bencode;
use super::types::{Metainfo, TorrentFile, TorrentInfo};

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    #[serde(default)]
    announce: Option<String>,
    #[serde(default, rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "piece length")]
    piece_length: i64,
    pieces: ByteBuf,
    #[serde(default)]
    length: Option<i64>,
    #[serde(default)]
    files: Option<Vec<RawFile>>,
    #[serde(default)]
    private: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    length: i64,
    path: Vec<String>,
}

/// Parser for `.torrent` files and bare info dictionaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct BencodeTorrentParser;

impl BencodeTorrentParser {
    pub fn new() -> Self {
        Self
    }

    /// Parses a complete `.torrent` file.
    ///
    /// The info-hash is computed over the info dictionary's bytes exactly as
    /// they appear in `data`.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetadata` - Malformed bencode, missing fields or inconsistent lengths
    pub fn parse_torrent_data(&self, data: &[u8]) -> Result<Metainfo, TorrentError> {
        let info_span = bencode::dict_value_span(data, b"info")?
            .ok_or_else(|| TorrentError::invalid_metadata("missing 'info' dictionary"))?;
        let info = self.parse_info_dict(Bytes::copy_from_slice(&data[info_span]), None)?;

        let raw: RawMetainfo = bencode::decode(data)?;
        let mut trackers: Vec<String> = Vec::new();
        let tiers = raw.announce_list.unwrap_or_default();
        for url in tiers.into_iter().flatten().chain(raw.announce) {
            let url = url.trim().to_string();
            if !url.is_empty() && !trackers.contains(&url) {
                trackers.push(url);
            }
        }

        Ok(Metainfo { info, trackers })
    }

    /// Validates a bencoded info dictionary and builds `TorrentInfo`.
    ///
    /// When `expected` is given the SHA-1 of `info_bytes` must match it.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetadata` - Hash mismatch, malformed fields or inconsistent lengths
    pub fn parse_info_dict(
        &self,
        info_bytes: Bytes,
        expected: Option<InfoHash>,
    ) -> Result<TorrentInfo, TorrentError> {
        if info_bytes.first() != Some(&b'd') {
            return Err(TorrentError::invalid_metadata(
                "info must be a dictionary",
            ));
        }
        if bencode::value_end(&info_bytes, 0)? != info_bytes.len() {
            return Err(TorrentError::invalid_metadata(
                "trailing bytes after info dictionary",
            ));
        }

        let info_hash = InfoHash::new(Sha1::digest(&info_bytes).into());
        if let Some(expected) = expected
            && expected != info_hash
        {
            return Err(TorrentError::invalid_metadata(format!(
                "info dictionary hashes to {info_hash}, expected {expected}"
            )));
        }

        let raw: RawInfo = bencode::decode(&info_bytes)?;

        let piece_length = u32::try_from(raw.piece_length)
            .ok()
            .filter(|length| *length > 0)
            .ok_or_else(|| {
                TorrentError::invalid_metadata(format!(
                    "invalid piece length {}",
                    raw.piece_length
                ))
            })?;

        if raw.pieces.is_empty() || raw.pieces.len() % 20 != 0 {
            return Err(TorrentError::invalid_metadata(format!(
                "Invalid pieces length {}",
                raw.pieces.len()
            )));
        }
        let piece_hashes: Vec<[u8; 20]> = raw
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let name = raw
            .name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| TorrentError::invalid_metadata("missing name"))?;
        let root = safe_component(&name)?;

        let files = match (raw.length, raw.files) {
            (Some(length), None) => vec![TorrentFile {
                path: PathBuf::from(root),
                length: non_negative(length)?,
                offset: 0,
            }],
            (None, Some(raw_files)) => {
                if raw_files.is_empty() {
                    return Err(TorrentError::invalid_metadata("empty file list"));
                }
                let mut offset = 0u64;
                let mut files = Vec::with_capacity(raw_files.len());
                for raw_file in raw_files {
                    let length = non_negative(raw_file.length)?;
                    let path = relative_path(root, &raw_file.path)?;
                    files.push(TorrentFile {
                        path,
                        length,
                        offset,
                    });
                    offset = offset.checked_add(length).ok_or_else(|| {
                        TorrentError::invalid_metadata("total length overflow")
                    })?;
                }
                files
            }
            _ => {
                return Err(TorrentError::invalid_metadata(
                    "info must contain exactly one of 'length' or 'files'",
                ));
            }
        };

        let total_length: u64 = files.iter().map(|file| file.length).sum();
        check_layout(total_length, piece_length, piece_hashes.len())?;

        Ok(TorrentInfo {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
            private: raw.private == Some(1),
            info_bytes,
        })
    }

    /// Reads and parses a `.torrent` file from disk.
    ///
    /// # Errors
    /// - `TorrentError::InvalidArgument` - File cannot be read
    /// - `TorrentError::InvalidMetadata` - Contents are not a valid torrent
    pub async fn parse_torrent_file(&self, path: &Path) -> Result<Metainfo, TorrentError> {
        let contents = tokio::fs::read(path).await.map_err(|e| {
            TorrentError::invalid_argument(format!(
                "cannot read torrent file {}: {e}",
                path.display()
            ))
        })?;
        self.parse_torrent_data(&contents)
    }
}

/// Checks `ceil(total / piece_length) == piece_count`.
pub(crate) fn check_layout(
    total_length: u64,
    piece_length: u32,
    piece_count: usize,
) -> Result<(), TorrentError> {
    if total_length == 0 {
        return Err(TorrentError::invalid_metadata("torrent has no content"));
    }
    let expected = total_length.div_ceil(u64::from(piece_length));
    if expected != piece_count as u64 {
        return Err(TorrentError::invalid_metadata(format!(
            "{piece_count} piece hashes for {total_length} bytes at piece length {piece_length}, expected {expected}"
        )));
    }
    Ok(())
}

fn non_negative(length: i64) -> Result<u64, TorrentError> {
    u64::try_from(length)
        .map_err(|_| TorrentError::invalid_metadata(format!("negative file length {length}")))
}

/// Accepts a single path component that cannot escape the save directory.
fn safe_component(part: &str) -> Result<&str, TorrentError> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !part.contains(['/', '\\']) => Ok(part),
        _ => Err(TorrentError::invalid_metadata(format!(
            "unsafe path component {part:?}"
        ))),
    }
}

fn relative_path(root: &str, parts: &[String]) -> Result<PathBuf, TorrentError> {
    if parts.is_empty() {
        return Err(TorrentError::invalid_metadata("file with empty path"));
    }
    let mut path = PathBuf::from(root);
    for part in parts {
        path.push(safe_component(part)?);
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::torrent::TorrentCreator;

    const SINGLE: &[u8] = b"d8:announce9:test:80804:infod6:lengthi1000e4:name8:test.txt12:piece lengthi32768e6:pieces20:12345678901234567890ee";

    #[test]
    fn test_single_file_torrent() {
        let metainfo = BencodeTorrentParser::new().parse_torrent_data(SINGLE).unwrap();
        let info = &metainfo.info;

        assert_eq!(info.name, "test.txt");
        assert_eq!(info.piece_length, 32768);
        assert_eq!(info.total_length, 1000);
        assert_eq!(info.piece_count(), 1);
        assert_eq!(info.files[0].path, PathBuf::from("test.txt"));
        assert_eq!(metainfo.trackers, vec!["test:8080".to_string()]);

        let info_start = SINGLE.windows(5).position(|w| w == b"4:inf").unwrap() + 6;
        let raw_info = &SINGLE[info_start..SINGLE.len() - 1];
        assert_eq!(info.info_bytes().as_ref(), raw_info);
        assert_eq!(
            info.info_hash,
            InfoHash::new(Sha1::digest(raw_info).into())
        );
    }

    #[test]
    fn test_multi_file_torrent() {
        let data = b"d4:infod5:filesld6:lengthi500e4:pathl3:sub5:file1eed6:lengthi300e4:pathl5:file2eee4:name8:test.dir12:piece lengthi512e6:pieces40:12345678901234567890ABCDEFGHIJ12345678901234567890ee";
        let metainfo = BencodeTorrentParser::new().parse_torrent_data(data).unwrap();
        let info = &metainfo.info;

        assert_eq!(info.total_length, 800);
        assert_eq!(info.files.len(), 2);
        assert_eq!(info.files[0].path, PathBuf::from("test.dir/sub/file1"));
        assert_eq!(info.files[1].offset, 500);
        assert!(metainfo.trackers.is_empty());
    }

    #[test]
    fn test_missing_info_field() {
        let result = BencodeTorrentParser::new().parse_torrent_data(b"d8:announce9:test:8080e");
        assert!(matches!(result, Err(TorrentError::InvalidMetadata { .. })));
    }

    #[test]
    fn test_invalid_pieces_length() {
        let data = b"d4:infod6:lengthi1000e4:name8:test.txt12:piece lengthi32768e6:pieces19:1234567890123456789ee";
        let err = BencodeTorrentParser::new()
            .parse_torrent_data(data)
            .unwrap_err();
        assert!(err.to_string().contains("Invalid pieces length"));
    }

    #[test]
    fn test_piece_count_mismatch_rejected() {
        // 1000 bytes at 512 per piece needs two hashes
        let data = b"d4:infod6:lengthi1000e4:name8:test.txt12:piece lengthi512e6:pieces20:12345678901234567890ee";
        let result = BencodeTorrentParser::new().parse_torrent_data(data);
        assert!(matches!(result, Err(TorrentError::InvalidMetadata { .. })));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let data = b"d4:infod5:filesld6:lengthi10e4:pathl2:..6:passwdeee4:name3:dir12:piece lengthi16e6:pieces20:12345678901234567890ee";
        let result = BencodeTorrentParser::new().parse_torrent_data(data);
        assert!(matches!(result, Err(TorrentError::InvalidMetadata { .. })));
    }

    #[test]
    fn test_invalid_utf8_in_path_rejected() {
        let mut data = Vec::from(&b"d4:infod5:filesld6:lengthi500e4:pathl4:"[..]);
        data.extend_from_slice(&[0xFF, 0xFE, 0xFD, 0xFC]);
        data.extend_from_slice(
            b"eee4:name3:dir12:piece lengthi512e6:pieces20:12345678901234567890ee",
        );
        assert!(BencodeTorrentParser::new().parse_torrent_data(&data).is_err());
    }

    #[test]
    fn test_hash_mismatch_rejected() {
        let parser = BencodeTorrentParser::new();
        let info = parser.parse_torrent_data(SINGLE).unwrap().info;

        let wrong = InfoHash::new([0xAB; 20]);
        let result = parser.parse_info_dict(info.info_bytes().clone(), Some(wrong));
        assert!(matches!(result, Err(TorrentError::InvalidMetadata { .. })));

        let same = parser
            .parse_info_dict(info.info_bytes().clone(), Some(info.info_hash))
            .unwrap();
        assert_eq!(same, info);
    }

    #[test]
    fn test_non_dictionary_roots_rejected() {
        let parser = BencodeTorrentParser::new();
        assert!(parser.parse_torrent_data(b"le").is_err());
        assert!(parser.parse_torrent_data(b"l4:teste").is_err());
        assert!(parser.parse_torrent_data(b"invalid torrent data").is_err());
    }

    #[tokio::test]
    async fn test_unreadable_file_is_invalid_argument() {
        let result = BencodeTorrentParser::new()
            .parse_torrent_file(Path::new("/nonexistent/file.torrent"))
            .await;
        assert!(matches!(result, Err(TorrentError::InvalidArgument { .. })));
    }

    proptest! {
        #[test]
        fn prop_resolve_is_idempotent_and_consistent(
            file_sizes in proptest::collection::vec(0usize..3000, 1..4),
            piece_length in prop_oneof![Just(256u32), Just(1024u32), Just(4096u32)],
        ) {
            prop_assume!(file_sizes.iter().sum::<usize>() > 0);
            let files: Vec<(PathBuf, Vec<u8>)> = file_sizes
                .iter()
                .enumerate()
                .map(|(i, size)| (PathBuf::from(format!("f{i}.bin")), vec![i as u8; *size]))
                .collect();
            let bytes = TorrentCreator::with_piece_size(piece_length)
                .build_multi_file("content", &files)
                .unwrap();

            let parser = BencodeTorrentParser::new();
            let first = parser.parse_torrent_data(&bytes).unwrap();
            let second = parser.parse_torrent_data(&bytes).unwrap();
            prop_assert_eq!(&first, &second);

            let info = first.info;
            let sum: u64 = info.files.iter().map(|f| f.length).sum();
            prop_assert_eq!(sum, info.total_length);
            prop_assert_eq!(
                info.piece_count() as u64,
                info.total_length.div_ceil(u64::from(info.piece_length))
            );
        }
    }
}
