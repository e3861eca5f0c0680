//! Session manager: the registry of torrents and its control surface.
//!
//! Runs as an actor. [`SessionHandle`] sends commands; the actor owns every
//! torrent, its piece store and its swarm coordinator, and answers queries
//! by building snapshots from live state.

mod actor;
mod commands;
mod core;
mod handle;
mod listener;
mod snapshot;
mod torrent;

pub use actor::{spawn_default_session, spawn_session};
pub use commands::SessionCommand;
pub use handle::SessionHandle;
pub use snapshot::TorrentSnapshot;
pub use torrent::TorrentStatus;
