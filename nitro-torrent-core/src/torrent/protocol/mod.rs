//! BitTorrent wire protocol: handshake, message codec, extension messages and framing.
//!
//! Byte layouts follow BEP 3 (peer wire), BEP 10 (extension protocol) and
//! BEP 9 (`ut_metadata`).

pub mod connection;
pub mod extension;
pub mod handshake;
pub mod messages;
pub mod types;

pub use connection::{FrameReader, FrameWriter, connect_with_timeout};
pub use extension::{ExtensionHandshake, MetadataMessage};
pub use handshake::{HandshakeCodec, read_handshake, write_handshake};
pub use messages::MessageCodec;
pub use types::{PeerHandshake, PeerId, PeerMessage};
