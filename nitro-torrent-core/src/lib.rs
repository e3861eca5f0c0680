//! Nitro Torrent Core - BitTorrent session engine
//!
//! Resolves metadata from `.torrent` files and magnet links, stores and
//! verifies pieces on disk, speaks the peer wire protocol and schedules
//! requests across a swarm. [`engine::SessionHandle`] is the control
//! surface host applications drive.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod network;
pub mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::EngineConfig;
pub use engine::{
    SessionHandle, TorrentSnapshot, TorrentStatus, spawn_default_session, spawn_session,
};
pub use storage::StorageError;
pub use torrent::{InfoHash, PeerId, PeerSnapshot, TorrentError};

pub type Result<T> = std::result::Result<T, TorrentError>;
