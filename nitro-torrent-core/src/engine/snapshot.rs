//! Poll-friendly views of session state.

use serde::Serialize;

use super::torrent::{ManagedTorrent, TorrentStatus};

/// Point-in-time status of one torrent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TorrentSnapshot {
    pub id: String,
    /// Metadata name, or the id while unknown
    pub name: String,
    /// Verified fraction of the content, 0.0 to 1.0
    pub progress: f64,
    pub status: TorrentStatus,
    pub save_path: String,
    pub download_rate: u64,
    pub upload_rate: u64,
    /// Bytes of verified content
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub peer_count: usize,
    pub seed_count: usize,
    pub paused: bool,
    /// Cumulative payload received, including discarded data
    pub total_downloaded: u64,
    pub total_uploaded: u64,
    /// Set while `status` is `error`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// RFC 3339 timestamp
    pub added_at: String,
}

impl TorrentSnapshot {
    pub(crate) fn capture(torrent: &ManagedTorrent) -> Self {
        let (progress, downloaded_bytes, total_bytes) = match &torrent.store {
            Some(store) => (
                store.progress(),
                store.verified_bytes(),
                store.info().total_length,
            ),
            None => (
                0.0,
                0,
                torrent.info.as_ref().map_or(0, |info| info.total_length),
            ),
        };
        let stats = torrent
            .swarm
            .as_ref()
            .map(|swarm| swarm.stats())
            .unwrap_or_default();

        Self {
            id: torrent.id.clone(),
            name: torrent.name.clone().unwrap_or_else(|| torrent.id.clone()),
            progress,
            status: torrent.status,
            save_path: torrent.save_path.display().to_string(),
            download_rate: stats.download_rate,
            upload_rate: stats.upload_rate,
            downloaded_bytes,
            total_bytes,
            peer_count: stats.peer_count,
            seed_count: stats.seed_count,
            paused: torrent.status == TorrentStatus::Paused
                || (torrent.status == TorrentStatus::Resolving && torrent.pause_requested),
            total_downloaded: torrent.counters.downloaded(),
            total_uploaded: torrent.counters.uploaded(),
            error: torrent.error.clone(),
            added_at: torrent.added_at.to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::engine::torrent::TorrentOrigin;
    use crate::torrent::InfoHash;

    #[test]
    fn test_resolving_snapshot_defaults() {
        let mut torrent = ManagedTorrent::new(
            InfoHash::new([0xab; 20]),
            None,
            PathBuf::from("/downloads"),
            TorrentOrigin::Metadata,
            Vec::new(),
            3,
        );
        torrent.pause_requested = true;

        let snapshot = TorrentSnapshot::capture(&torrent);
        assert_eq!(snapshot.name, snapshot.id);
        assert_eq!(snapshot.status, TorrentStatus::Resolving);
        assert_eq!(snapshot.progress, 0.0);
        assert_eq!(snapshot.total_bytes, 0);
        assert_eq!(snapshot.peer_count, 0);
        assert!(snapshot.paused);
        assert_eq!(snapshot.save_path, "/downloads");

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"], "resolving");
        assert!(json.get("error").is_none());
    }
}
