//! Torrent metadata parsing: `.torrent` files, info dictionaries and magnet links.
//!
//! Typed decoding uses `serde_bencode`; `bencode` adds the raw-span scanning
//! needed to hash info dictionaries byte-exactly.

pub mod bencode;
pub mod magnet;
pub mod parser;
pub mod types;

pub use magnet::MagnetParser;
pub use parser::BencodeTorrentParser;
pub use types::{FileSlice, MagnetLink, MetadataSource, Metainfo, TorrentFile, TorrentInfo};
