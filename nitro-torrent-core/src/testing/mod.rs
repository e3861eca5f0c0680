//! Test support: deterministic torrents and loopback seeding peers.
//!
//! Available to unit tests and, behind the `test-utils` feature, to the
//! integration tests and downstream crates.

mod fixture;
mod seed;

pub use fixture::TorrentFixture;
pub use seed::{SeedBuilder, SimulatedSeed};
