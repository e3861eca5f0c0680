//! Persisted per-torrent state for restart without re-download.
//!
//! One bencoded file per torrent under `<state_dir>/resume`. Files are
//! written to a temporary name and renamed into place so a crash never
//! leaves a half-written record behind.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use super::StorageError;
use crate::torrent::InfoHash;

const RESUME_DIR: &str = "resume";
const RESUME_EXTENSION: &str = "resume";

/// Everything needed to re-add a torrent after restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    /// Hex info hash, also the torrent id
    pub info_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub save_path: String,
    /// Raw info dictionary once metadata is known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ByteBuf>,
    /// Original magnet link for torrents still resolving
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnet: Option<String>,
    #[serde(default)]
    pub trackers: Vec<String>,
    /// Verified-piece bitfield in wire layout
    pub verified: ByteBuf,
    pub uploaded: u64,
    pub downloaded: u64,
    /// "active", "paused" or "canceled"
    pub state: String,
    /// Unix timestamp (seconds)
    pub added_at: i64,
    /// Monotonic insertion sequence, preserves listing order across restarts
    pub added_seq: u64,
}

impl ResumeData {
    pub fn parsed_info_hash(&self) -> Option<InfoHash> {
        InfoHash::from_hex(&self.info_hash)
    }
}

/// Reads and writes resume files.
#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
    temp_suffix: &'static str,
}

impl ResumeStore {
    pub fn new(state_dir: &Path, temp_suffix: &'static str) -> Self {
        Self {
            dir: state_dir.join(RESUME_DIR),
            temp_suffix,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, info_hash: &str) -> PathBuf {
        self.dir.join(format!("{info_hash}.{RESUME_EXTENSION}"))
    }

    /// Atomically replaces the record for `data.info_hash`.
    ///
    /// # Errors
    /// - `StorageError::FileAccess` - Directory or file cannot be written
    /// - `StorageError::Corrupt` - Record cannot be encoded
    pub async fn save(&self, data: &ResumeData) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StorageError::file(&self.dir, e))?;

        let target = self.path_for(&data.info_hash);
        let encoded = serde_bencode::to_bytes(data).map_err(|e| StorageError::Corrupt {
            path: target.clone(),
            reason: e.to_string(),
        })?;

        let mut temp = target.clone().into_os_string();
        temp.push(self.temp_suffix);
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, &encoded)
            .await
            .map_err(|e| StorageError::file(&temp, e))?;
        tokio::fs::rename(&temp, &target)
            .await
            .map_err(|e| StorageError::file(&target, e))?;

        tracing::trace!(info_hash = %data.info_hash, bytes = encoded.len(), "Saved resume data");
        Ok(())
    }

    /// Loads every readable record, oldest first.
    ///
    /// Corrupt or unreadable files are logged and skipped.
    pub async fn load_all(&self) -> Vec<ResumeData> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Cannot list resume data");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(dir = %self.dir.display(), error = %e, "Resume scan aborted");
                    break;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RESUME_EXTENSION) {
                continue;
            }
            match self.load_file(&path).await {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(error = %e, "Skipping resume file"),
            }
        }

        records.sort_by_key(|record| record.added_seq);
        records
    }

    async fn load_file(&self, path: &Path) -> Result<ResumeData, StorageError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StorageError::file(path, e))?;
        let record: ResumeData =
            serde_bencode::from_bytes(&bytes).map_err(|e| StorageError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if record.parsed_info_hash().is_none() {
            return Err(StorageError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("invalid info hash {:?}", record.info_hash),
            });
        }
        Ok(record)
    }

    /// Deletes the record for a torrent; a missing record is not an error.
    ///
    /// # Errors
    /// - `StorageError::FileAccess` - File exists but cannot be removed
    pub async fn remove(&self, info_hash: &str) -> Result<(), StorageError> {
        let path = self.path_for(info_hash);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::file(path, e)),
        }
    }
}
