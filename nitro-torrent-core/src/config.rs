//! Centralized configuration for the session engine.
//!
//! All tunable parameters are defined here so that timeouts, limits and
//! scheduling intervals are not scattered through the protocol code.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all engine components.
///
/// Groups related settings into sections. Supports environment variable
/// overrides through [`EngineConfig::from_env`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub swarm: SwarmConfig,
}

/// Protocol and metadata-resolution settings.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Azureus-style client prefix used for generated peer ids
    pub client_id: &'static str,
    /// Client name advertised in the extension handshake
    pub client_version: &'static str,
    /// Size of a single block request
    pub block_size: u32,
    /// Peers tried per metadata-exchange attempt
    pub metadata_max_peers: usize,
    /// Discovery rounds before a magnet resolution gives up
    pub metadata_max_attempts: u32,
    /// Timeout for one metadata-exchange round trip
    pub metadata_timeout: Duration,
    /// Upper bound accepted for an advertised info dictionary
    pub max_metadata_size: usize,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: "-NT0001-",
            client_version: "NitroTorrent 0.1.0",
            block_size: 16_384, // 16 KiB
            metadata_max_peers: 8,
            metadata_max_attempts: 3,
            metadata_timeout: Duration::from_secs(10),
            max_metadata_size: 8 * 1024 * 1024,
        }
    }
}

/// Network communication, discovery and bandwidth settings.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port for incoming peer connections (`None` disables the listener, 0 picks a free port)
    pub listen_port: Option<u16>,
    /// HTTP request timeout for tracker announces
    pub tracker_timeout: Duration,
    /// Upper bound for a single discovery query
    pub discovery_timeout: Duration,
    /// Minimum delay between discovery queries for one torrent
    pub discovery_interval: Duration,
    /// User agent for tracker requests
    pub user_agent: &'static str,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Deadline for completing the peer handshake
    pub handshake_timeout: Duration,
    /// Connections silent for longer than this are dropped
    pub idle_timeout: Duration,
    /// Interval between keep-alive messages on quiet connections
    pub keep_alive_interval: Duration,
    /// Global download cap in bytes per second (None = unlimited)
    pub download_limit: Option<u64>,
    /// Global upload cap in bytes per second (None = unlimited)
    pub upload_limit: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: Some(6881),
            tracker_timeout: Duration::from_secs(15),
            discovery_timeout: Duration::from_secs(20),
            discovery_interval: Duration::from_secs(60),
            user_agent: "nitro-torrent/0.1.0",
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(180),
            keep_alive_interval: Duration::from_secs(90),
            download_limit: None,
            upload_limit: None,
        }
    }
}

/// Disk and persistence settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding resume data
    pub state_dir: PathBuf,
    /// Suffix for files written before an atomic rename
    pub temp_file_suffix: &'static str,
    /// Interval between periodic resume-data flushes
    pub resume_save_interval: Duration,
    /// Re-hash pieces listed as verified in resume data
    pub recheck_on_restore: bool,
    /// Refuse allocation when the target disk lacks space
    pub check_free_space: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("nitro-torrent-state"),
            temp_file_suffix: ".tmp",
            resume_save_interval: Duration::from_secs(60),
            recheck_on_restore: true,
            check_free_space: true,
        }
    }
}

/// Swarm scheduling, choking and request pipelining settings.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Fixed scheduling tick, independent of peer I/O
    pub tick_interval: Duration,
    /// How often the choke set is recomputed
    pub choke_interval: Duration,
    /// Choke rounds between optimistic unchoke rotations
    pub optimistic_unchoke_rounds: u32,
    /// Upload slots including the optimistic one
    pub unchoke_slots: usize,
    /// Maximum simultaneous connections per torrent
    pub max_peers: usize,
    /// Discovery is queried while connected peers stay below this
    pub target_peers: usize,
    /// Maximum outbound connection attempts in flight
    pub dial_concurrency: usize,
    /// Cap on outstanding block requests per peer
    pub max_outstanding_requests: usize,
    /// Requests older than this are re-issued elsewhere
    pub request_timeout: Duration,
    /// Failed pieces a peer may contribute to before it is banned
    pub hash_failure_ban_threshold: u32,
    /// Delay before redialing an endpoint that failed
    pub failed_peer_cooldown: Duration,
    /// Sliding window for rate estimation
    pub rate_window: Duration,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            choke_interval: Duration::from_secs(10),
            optimistic_unchoke_rounds: 3,
            unchoke_slots: 4,
            max_peers: 50,
            target_peers: 30,
            dial_concurrency: 8,
            max_outstanding_requests: 16,
            request_timeout: Duration::from_secs(30),
            hash_failure_ban_threshold: 2,
            failed_peer_cooldown: Duration::from_secs(300),
            rate_window: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("NITRO_TORRENT_LISTEN_PORT") {
            config.network.listen_port = match port.as_str() {
                "off" | "none" => None,
                value => value.parse().ok().or(config.network.listen_port),
            };
        }

        if let Ok(timeout) = std::env::var("NITRO_TORRENT_TRACKER_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.network.tracker_timeout = Duration::from_secs(seconds);
        }

        if let Ok(max_peers) = std::env::var("NITRO_TORRENT_MAX_PEERS")
            && let Ok(count) = max_peers.parse::<usize>()
        {
            config.swarm.max_peers = count;
        }

        if let Ok(limit) = std::env::var("NITRO_TORRENT_DOWNLOAD_LIMIT")
            && let Ok(bytes) = limit.parse::<u64>()
        {
            config.network.download_limit = (bytes > 0).then_some(bytes);
        }

        if let Ok(limit) = std::env::var("NITRO_TORRENT_UPLOAD_LIMIT")
            && let Ok(bytes) = limit.parse::<u64>()
        {
            config.network.upload_limit = (bytes > 0).then_some(bytes);
        }

        if let Ok(dir) = std::env::var("NITRO_TORRENT_STATE_DIR")
            && !dir.is_empty()
        {
            config.storage.state_dir = PathBuf::from(dir);
        }

        config
    }

    /// Creates a configuration with short intervals for tests.
    ///
    /// The listener is disabled; tests that need inbound connections
    /// set `listen_port` to `Some(0)`.
    pub fn for_testing() -> Self {
        Self {
            torrent: TorrentConfig {
                metadata_timeout: Duration::from_secs(2),
                metadata_max_attempts: 2,
                ..TorrentConfig::default()
            },
            network: NetworkConfig {
                listen_port: None,
                discovery_interval: Duration::from_millis(200),
                discovery_timeout: Duration::from_secs(2),
                connect_timeout: Duration::from_secs(2),
                handshake_timeout: Duration::from_secs(2),
                idle_timeout: Duration::from_secs(10),
                ..NetworkConfig::default()
            },
            storage: StorageConfig {
                resume_save_interval: Duration::from_secs(1),
                check_free_space: false,
                ..StorageConfig::default()
            },
            swarm: SwarmConfig {
                tick_interval: Duration::from_millis(50),
                choke_interval: Duration::from_millis(200),
                request_timeout: Duration::from_secs(2),
                failed_peer_cooldown: Duration::from_millis(500),
                ..SwarmConfig::default()
            },
        }
    }

    /// Returns the same configuration with its state directory replaced.
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.storage.state_dir = state_dir.into();
        self
    }
}
