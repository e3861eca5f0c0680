//! Peer discovery behind a single "give me peers" contract.
//!
//! Swarm coordinators only see [`DiscoveryProvider`]. Concrete transports
//! (HTTP trackers, fixed endpoint lists) and the fan-out combinator live in
//! the submodules and can be mixed freely.

pub mod composite;
pub mod static_peers;
pub mod tracker;

use std::net::SocketAddr;

use async_trait::async_trait;
pub use composite::CompositeDiscovery;
pub use static_peers::StaticDiscovery;
pub use tracker::HttpTrackerDiscovery;

use crate::torrent::{InfoHash, TorrentError};

/// Transfer totals reported to discovery sources that announce them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Source of candidate peer endpoints.
///
/// Implementations must be safe to share between torrents and must return
/// within a bounded time. Results may contain fewer than `wanted` entries
/// and may repeat endpoints the caller already knows about.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Returns up to `wanted` peer endpoints for a torrent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Tracker` - Every source for this torrent failed
    async fn get_peers(
        &self,
        info_hash: InfoHash,
        wanted: usize,
    ) -> Result<Vec<SocketAddr>, TorrentError>;

    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Makes announce URLs from metadata known to the provider.
    fn register_torrent(&self, _info_hash: InfoHash, _trackers: &[String]) {}

    /// Forgets a torrent that left the session.
    fn unregister_torrent(&self, _info_hash: InfoHash) {}

    /// Updates transfer totals used in subsequent announces.
    fn update_stats(&self, _info_hash: InfoHash, _stats: AnnounceStats) {}
}

/// Removes duplicates while keeping first-seen order.
pub(crate) fn dedup_endpoints(peers: &mut Vec<SocketAddr>) {
    let mut seen = std::collections::HashSet::with_capacity(peers.len());
    peers.retain(|peer| seen.insert(*peer));
}
