//! Turns a magnet link or `.torrent` bytes into validated metadata.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;

use super::metadata_exchange::fetch_metadata;
use super::parsing::{BencodeTorrentParser, MagnetLink, MetadataSource, Metainfo};
use super::{PeerId, TorrentError};
use crate::config::EngineConfig;
use crate::discovery::{DiscoveryProvider, dedup_endpoints};

/// Resolves metadata sources into [`Metainfo`].
///
/// Resolution is bounded: a magnet link is tried against at most
/// `metadata_max_peers` peers in each of `metadata_max_attempts` rounds.
/// Dropping the returned future aborts any in-flight exchange.
#[derive(Clone)]
pub struct MetadataResolver {
    config: Arc<EngineConfig>,
    discovery: Arc<dyn DiscoveryProvider>,
    peer_id: PeerId,
    parser: BencodeTorrentParser,
}

impl MetadataResolver {
    pub fn new(
        config: Arc<EngineConfig>,
        discovery: Arc<dyn DiscoveryProvider>,
        peer_id: PeerId,
    ) -> Self {
        Self {
            config,
            discovery,
            peer_id,
            parser: BencodeTorrentParser::new(),
        }
    }

    /// Produces metadata for `source`.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetadata` - Malformed `.torrent` data
    /// - `TorrentError::MetadataTimeout` - No peer delivered valid metadata in time
    pub async fn resolve(&self, source: &MetadataSource) -> Result<Metainfo, TorrentError> {
        match source {
            MetadataSource::FileBytes(bytes) => self.parser.parse_torrent_data(bytes),
            MetadataSource::Magnet(magnet) => self.resolve_magnet(magnet).await,
        }
    }

    async fn resolve_magnet(&self, magnet: &MagnetLink) -> Result<Metainfo, TorrentError> {
        let info_hash = magnet.info_hash;
        let limits = &self.config.torrent;
        self.discovery.register_torrent(info_hash, &magnet.trackers);

        let mut failed: HashSet<SocketAddr> = HashSet::new();
        for attempt in 1..=limits.metadata_max_attempts {
            let candidates = self.candidates(magnet, &failed).await;
            tracing::debug!(
                %info_hash,
                attempt,
                candidates = candidates.len(),
                "Metadata resolution attempt"
            );

            let mut exchanges: FuturesUnordered<_> = candidates
                .into_iter()
                .map(|peer| async move {
                    let result = fetch_metadata(peer, info_hash, self.peer_id, &self.config).await;
                    (peer, result)
                })
                .collect();

            while let Some((peer, result)) = exchanges.next().await {
                let parsed = result.and_then(|info_bytes| {
                    self.parser.parse_info_dict(info_bytes, Some(info_hash))
                });
                match parsed {
                    Ok(info) => {
                        tracing::info!(%info_hash, peer = %peer, name = %info.name, "Resolved magnet metadata");
                        return Ok(Metainfo {
                            info,
                            trackers: magnet.trackers.clone(),
                        });
                    }
                    Err(e) => {
                        tracing::debug!(%info_hash, peer = %peer, error = %e, "Metadata exchange failed");
                        failed.insert(peer);
                    }
                }
            }

            if attempt < limits.metadata_max_attempts {
                tokio::time::sleep(self.retry_delay()).await;
            }
        }

        tracing::warn!(%info_hash, attempts = limits.metadata_max_attempts, "Metadata resolution gave up");
        Err(TorrentError::MetadataTimeout {
            info_hash,
            attempts: limits.metadata_max_attempts,
        })
    }

    /// Magnet hints and discovered peers, untried ones first.
    async fn candidates(&self, magnet: &MagnetLink, failed: &HashSet<SocketAddr>) -> Vec<SocketAddr> {
        let limit = self.config.torrent.metadata_max_peers;
        let mut peers = magnet.peers.clone();

        let discovered = tokio::time::timeout(
            self.config.network.discovery_timeout,
            self.discovery.get_peers(magnet.info_hash, limit * 2),
        )
        .await;
        match discovered {
            Ok(Ok(found)) => peers.extend(found),
            Ok(Err(e)) => {
                tracing::debug!(info_hash = %magnet.info_hash, error = %e, "Discovery failed during resolution")
            }
            Err(_) => {
                tracing::debug!(info_hash = %magnet.info_hash, "Discovery timed out during resolution")
            }
        }

        dedup_endpoints(&mut peers);
        peers.sort_by_key(|peer| failed.contains(peer));
        peers.truncate(limit);
        peers
    }

    fn retry_delay(&self) -> std::time::Duration {
        self.config
            .network
            .discovery_interval
            .min(self.config.torrent.metadata_timeout)
    }
}
