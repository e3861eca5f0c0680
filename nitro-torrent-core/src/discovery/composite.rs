//! Fan-out over several discovery providers

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use super::{AnnounceStats, DiscoveryProvider, dedup_endpoints};
use crate::torrent::{InfoHash, TorrentError};

/// Queries every provider concurrently and merges their answers.
///
/// Each provider gets the same deadline; slow or failing providers are
/// skipped. The merge fails only when all providers fail.
pub struct CompositeDiscovery {
    providers: Vec<Arc<dyn DiscoveryProvider>>,
    timeout: Duration,
}

impl CompositeDiscovery {
    pub fn new(providers: Vec<Arc<dyn DiscoveryProvider>>, timeout: Duration) -> Self {
        Self { providers, timeout }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl DiscoveryProvider for CompositeDiscovery {
    async fn get_peers(
        &self,
        info_hash: InfoHash,
        wanted: usize,
    ) -> Result<Vec<SocketAddr>, TorrentError> {
        let queries = self.providers.iter().map(|provider| async move {
            match tokio::time::timeout(self.timeout, provider.get_peers(info_hash, wanted)).await {
                Ok(result) => (provider.name().to_string(), result),
                Err(_) => (
                    provider.name().to_string(),
                    Err(TorrentError::Tracker {
                        url: provider.name().to_string(),
                        reason: "discovery timed out".to_string(),
                    }),
                ),
            }
        });

        let mut peers = Vec::new();
        let mut last_error = None;
        let mut any_success = self.providers.is_empty();
        for (name, result) in join_all(queries).await {
            match result {
                Ok(found) => {
                    tracing::trace!(provider = %name, %info_hash, count = found.len(), "Discovery answered");
                    any_success = true;
                    peers.extend(found);
                }
                Err(e) => {
                    tracing::debug!(provider = %name, %info_hash, error = %e, "Discovery failed");
                    last_error = Some(e);
                }
            }
        }

        if !any_success && let Some(e) = last_error {
            return Err(e);
        }

        dedup_endpoints(&mut peers);
        peers.truncate(wanted);
        Ok(peers)
    }

    fn name(&self) -> &str {
        "composite"
    }

    fn register_torrent(&self, info_hash: InfoHash, trackers: &[String]) {
        for provider in &self.providers {
            provider.register_torrent(info_hash, trackers);
        }
    }

    fn unregister_torrent(&self, info_hash: InfoHash) {
        for provider in &self.providers {
            provider.unregister_torrent(info_hash);
        }
    }

    fn update_stats(&self, info_hash: InfoHash, stats: AnnounceStats) {
        for provider in &self.providers {
            provider.update_stats(info_hash, stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;

    struct Failing;

    #[async_trait]
    impl DiscoveryProvider for Failing {
        async fn get_peers(&self, _: InfoHash, _: usize) -> Result<Vec<SocketAddr>, TorrentError> {
            Err(TorrentError::Tracker {
                url: "http://down.example/announce".to_string(),
                reason: "connection refused".to_string(),
            })
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    struct Hanging;

    #[async_trait]
    impl DiscoveryProvider for Hanging {
        async fn get_peers(&self, _: InfoHash, _: usize) -> Result<Vec<SocketAddr>, TorrentError> {
            futures::future::pending().await
        }

        fn name(&self) -> &str {
            "hanging"
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 1], port))
    }

    #[tokio::test]
    async fn test_merges_and_skips_failures() {
        let composite = CompositeDiscovery::new(
            vec![
                Arc::new(StaticDiscovery::new(vec![addr(1), addr(2)])),
                Arc::new(Failing),
                Arc::new(Hanging),
                Arc::new(StaticDiscovery::new(vec![addr(2), addr(3)])),
            ],
            Duration::from_millis(100),
        );

        let peers = composite.get_peers(InfoHash::new([1; 20]), 10).await.unwrap();
        assert_eq!(peers, vec![addr(1), addr(2), addr(3)]);
    }

    #[tokio::test]
    async fn test_all_failing_surfaces_error() {
        let composite = CompositeDiscovery::new(
            vec![Arc::new(Failing), Arc::new(Hanging)],
            Duration::from_millis(50),
        );

        let result = composite.get_peers(InfoHash::new([1; 20]), 10).await;
        assert!(matches!(result, Err(TorrentError::Tracker { .. })));
    }

    #[tokio::test]
    async fn test_empty_composite_returns_nothing() {
        let composite = CompositeDiscovery::new(Vec::new(), Duration::from_millis(50));
        assert!(composite.is_empty());
        let peers = composite.get_peers(InfoHash::new([1; 20]), 10).await.unwrap();
        assert!(peers.is_empty());
    }
}
