//! Fixed endpoint discovery for known peers, magnet `x.pe` hints and tests

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{DiscoveryProvider, dedup_endpoints};
use crate::torrent::{InfoHash, TorrentError};

/// Returns configured endpoints: ones bound to a torrent first, then
/// endpoints offered for every torrent.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    global: Vec<SocketAddr>,
    per_torrent: RwLock<HashMap<InfoHash, Vec<SocketAddr>>>,
}

impl StaticDiscovery {
    pub fn new(global: Vec<SocketAddr>) -> Self {
        Self {
            global,
            per_torrent: RwLock::new(HashMap::new()),
        }
    }

    /// Binds endpoints to one torrent.
    pub fn add_peers(&self, info_hash: InfoHash, peers: impl IntoIterator<Item = SocketAddr>) {
        let mut map = self.per_torrent.write();
        let entry = map.entry(info_hash).or_default();
        entry.extend(peers);
        dedup_endpoints(entry);
    }

    pub fn with_peers(self, info_hash: InfoHash, peers: Vec<SocketAddr>) -> Self {
        self.add_peers(info_hash, peers);
        self
    }
}

#[async_trait]
impl DiscoveryProvider for StaticDiscovery {
    async fn get_peers(
        &self,
        info_hash: InfoHash,
        wanted: usize,
    ) -> Result<Vec<SocketAddr>, TorrentError> {
        let mut peers = self
            .per_torrent
            .read()
            .get(&info_hash)
            .cloned()
            .unwrap_or_default();
        peers.extend(self.global.iter().copied());
        dedup_endpoints(&mut peers);
        peers.truncate(wanted);
        Ok(peers)
    }

    fn name(&self) -> &str {
        "static"
    }

    fn unregister_torrent(&self, info_hash: InfoHash) {
        self.per_torrent.write().remove(&info_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_per_torrent_peers_come_first() {
        let hash = InfoHash::new([1; 20]);
        let other = InfoHash::new([2; 20]);
        let discovery =
            StaticDiscovery::new(vec![addr(1), addr(2)]).with_peers(hash, vec![addr(3), addr(1)]);

        let peers = discovery.get_peers(hash, 10).await.unwrap();
        assert_eq!(peers, vec![addr(3), addr(1), addr(2)]);

        let peers = discovery.get_peers(other, 10).await.unwrap();
        assert_eq!(peers, vec![addr(1), addr(2)]);
    }

    #[tokio::test]
    async fn test_wanted_truncates() {
        let discovery = StaticDiscovery::new(vec![addr(1), addr(2), addr(3)]);
        let peers = discovery.get_peers(InfoHash::new([0; 20]), 2).await.unwrap();
        assert_eq!(peers.len(), 2);
    }

    #[tokio::test]
    async fn test_unregister_drops_bound_peers() {
        let hash = InfoHash::new([5; 20]);
        let discovery = StaticDiscovery::default().with_peers(hash, vec![addr(9)]);
        discovery.unregister_torrent(hash);
        assert!(discovery.get_peers(hash, 10).await.unwrap().is_empty());
    }
}
