//! HTTP tracker announce (BEP 3) with compact peer lists (BEP 23).
//!
//! Announce URLs come from torrent metadata through `register_torrent`.
//! Each tracker's answer is cached until its announce interval elapses, so
//! frequent `get_peers` calls from a coordinator do not hammer trackers.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_bytes::ByteBuf;

use super::{AnnounceStats, DiscoveryProvider, dedup_endpoints};
use crate::config::NetworkConfig;
use crate::torrent::parsing::bencode;
use crate::torrent::{InfoHash, PeerId, TorrentError};

/// Announce interval assumed when a tracker omits one.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1800);
/// Floor applied to tracker-provided intervals.
const MIN_INTERVAL: Duration = Duration::from_secs(30);
/// Retry delay after a failed announce.
const FAILURE_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct TrackerSlot {
    peers: Vec<SocketAddr>,
    next_announce: Option<Instant>,
    started_sent: bool,
}

#[derive(Debug, Default)]
struct TrackedTorrent {
    trackers: Vec<String>,
    slots: HashMap<String, TrackerSlot>,
    stats: AnnounceStats,
}

#[derive(Debug, Deserialize)]
struct AnnounceReply {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<ByteBuf>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(rename = "min interval", default)]
    min_interval: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DictPeer {
    ip: String,
    port: u16,
}

/// Parsed announce response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

/// Discovery through HTTP(S) trackers.
pub struct HttpTrackerDiscovery {
    client: reqwest::Client,
    peer_id: PeerId,
    port: AtomicU16,
    torrents: Mutex<HashMap<InfoHash, TrackedTorrent>>,
}

impl HttpTrackerDiscovery {
    /// # Errors
    /// - `TorrentError::Tracker` - HTTP client cannot be constructed
    pub fn new(config: &NetworkConfig, peer_id: PeerId) -> Result<Self, TorrentError> {
        let client = reqwest::Client::builder()
            .timeout(config.tracker_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| TorrentError::Tracker {
                url: String::new(),
                reason: format!("cannot build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            peer_id,
            port: AtomicU16::new(config.listen_port.unwrap_or(0)),
            torrents: Mutex::new(HashMap::new()),
        })
    }

    /// Port advertised in announces, updated once the listener is bound.
    pub fn set_listen_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    /// Builds the announce URL with binary-safe escaping.
    pub fn announce_url(
        &self,
        tracker: &str,
        info_hash: InfoHash,
        stats: AnnounceStats,
        wanted: usize,
        started: bool,
    ) -> String {
        let separator = if tracker.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{tracker}{separator}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={wanted}",
            urlencoding::encode_binary(info_hash.as_bytes()),
            urlencoding::encode_binary(self.peer_id.as_bytes()),
            self.port.load(Ordering::Relaxed),
            stats.uploaded,
            stats.downloaded,
            stats.left,
        );
        if started {
            url.push_str("&event=started");
        }
        url
    }

    async fn announce(&self, url: &str, tracker: &str) -> Result<Announce, TorrentError> {
        let failed = |reason: String| TorrentError::Tracker {
            url: tracker.to_string(),
            reason,
        };

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                failed("request timed out".to_string())
            } else {
                failed(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP status {status}")));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| failed(format!("cannot read response: {e}")))?;

        parse_announce(&body).map_err(|e| failed(e.to_string()))
    }
}

/// Parses a bencoded announce response.
///
/// # Errors
/// - `TorrentError::InvalidMetadata` - Malformed body or tracker-reported failure
pub fn parse_announce(body: &[u8]) -> Result<Announce, TorrentError> {
    let reply: AnnounceReply = bencode::decode(body)?;
    if let Some(reason) = reply.failure_reason {
        return Err(TorrentError::invalid_metadata(format!(
            "tracker failure: {}",
            String::from_utf8_lossy(&reason)
        )));
    }

    let seconds = reply.min_interval.into_iter().chain(reply.interval).max();
    let interval = seconds
        .and_then(|s| u64::try_from(s).ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_INTERVAL)
        .max(MIN_INTERVAL);

    let mut peers = Vec::new();
    if let Some(span) = bencode::dict_value_span(body, b"peers")? {
        let raw = &body[span];
        if raw.first() == Some(&b'l') {
            let list: Vec<DictPeer> = bencode::decode(raw)?;
            peers.extend(list.into_iter().filter_map(|peer| {
                peer.ip
                    .parse::<IpAddr>()
                    .ok()
                    .map(|ip| SocketAddr::new(ip, peer.port))
            }));
        } else {
            let compact: ByteBuf = bencode::decode(raw)?;
            peers.extend(parse_compact(&compact, 6)?);
        }
    }
    if let Some(span) = bencode::dict_value_span(body, b"peers6")? {
        let compact: ByteBuf = bencode::decode(&body[span])?;
        peers.extend(parse_compact(&compact, 18)?);
    }

    Ok(Announce { interval, peers })
}

/// Decodes compact IPv4 (6-byte) or IPv6 (18-byte) peer entries.
fn parse_compact(data: &[u8], entry: usize) -> Result<Vec<SocketAddr>, TorrentError> {
    if !data.len().is_multiple_of(entry) {
        return Err(TorrentError::invalid_metadata(format!(
            "compact peer list of {} bytes is not a multiple of {entry}",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(entry)
        .filter_map(|chunk| {
            let (ip, port) = chunk.split_at(entry - 2);
            let port = u16::from_be_bytes([port[0], port[1]]);
            let ip = match ip.len() {
                4 => IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
                _ => {
                    let octets: [u8; 16] = ip.try_into().ok()?;
                    IpAddr::V6(Ipv6Addr::from(octets))
                }
            };
            (port != 0).then_some(SocketAddr::new(ip, port))
        })
        .collect())
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[async_trait]
impl DiscoveryProvider for HttpTrackerDiscovery {
    async fn get_peers(
        &self,
        info_hash: InfoHash,
        wanted: usize,
    ) -> Result<Vec<SocketAddr>, TorrentError> {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut peers = Vec::new();
        {
            let torrents = self.torrents.lock();
            let Some(torrent) = torrents.get(&info_hash) else {
                return Ok(Vec::new());
            };
            for tracker in &torrent.trackers {
                let slot = torrent.slots.get(tracker);
                match slot.and_then(|s| s.next_announce) {
                    Some(next) if next > now => {
                        peers.extend(slot.map(|s| s.peers.clone()).unwrap_or_default());
                    }
                    _ => {
                        let started = !slot.is_some_and(|s| s.started_sent);
                        let url = self.announce_url(tracker, info_hash, torrent.stats, wanted, started);
                        due.push((tracker.clone(), url));
                    }
                }
            }
        }

        let mut last_error = None;
        let attempted = due.len();
        let results =
            futures::future::join_all(due.iter().map(|(tracker, url)| self.announce(url, tracker)))
                .await;

        let mut torrents = self.torrents.lock();
        for ((tracker, _), result) in due.into_iter().zip(results) {
            let slot = torrents
                .get_mut(&info_hash)
                .map(|torrent| torrent.slots.entry(tracker.clone()).or_default());
            match result {
                Ok(announce) => {
                    tracing::debug!(
                        %info_hash,
                        tracker = %tracker,
                        peers = announce.peers.len(),
                        interval_secs = announce.interval.as_secs(),
                        "Tracker announce succeeded"
                    );
                    if let Some(slot) = slot {
                        slot.peers = announce.peers.clone();
                        slot.next_announce = Some(now + announce.interval);
                        slot.started_sent = true;
                    }
                    peers.extend(announce.peers);
                }
                Err(e) => {
                    tracing::debug!(%info_hash, tracker = %tracker, error = %e, "Tracker announce failed");
                    if let Some(slot) = slot {
                        slot.next_announce = Some(now + FAILURE_BACKOFF);
                    }
                    last_error = Some(e);
                }
            }
        }

        if peers.is_empty()
            && attempted > 0
            && let Some(e) = last_error
        {
            return Err(e);
        }

        dedup_endpoints(&mut peers);
        peers.truncate(wanted);
        Ok(peers)
    }

    fn name(&self) -> &str {
        "http-tracker"
    }

    fn register_torrent(&self, info_hash: InfoHash, trackers: &[String]) {
        let mut torrents = self.torrents.lock();
        let torrent = torrents.entry(info_hash).or_default();
        for tracker in trackers.iter().filter(|t| is_http(t)) {
            if !torrent.trackers.contains(tracker) {
                torrent.trackers.push(tracker.clone());
            }
        }
        let skipped = trackers.iter().filter(|t| !is_http(t)).count();
        if skipped > 0 {
            tracing::trace!(%info_hash, skipped, "Ignoring non-HTTP trackers");
        }
    }

    fn unregister_torrent(&self, info_hash: InfoHash) {
        self.torrents.lock().remove(&info_hash);
    }

    fn update_stats(&self, info_hash: InfoHash, stats: AnnounceStats) {
        if let Some(torrent) = self.torrents.lock().get_mut(&info_hash) {
            torrent.stats = stats;
        }
    }
}
