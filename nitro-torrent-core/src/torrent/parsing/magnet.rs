//! Magnet URI parsing (BEP 9)

use std::net::SocketAddr;

use url::Url;

use super::types::MagnetLink;
use crate::torrent::{InfoHash, TorrentError};

const BTIH_PREFIX: &str = "urn:btih:";

/// Magnet link parsing utilities.
pub struct MagnetParser;

impl MagnetParser {
    /// Parses a magnet URI into its info-hash, name, trackers and peers.
    ///
    /// Accepts hex (40 chars) and base32 (32 chars) `btih` topics. `x.pe`
    /// entries that are not `ip:port` are skipped.
    ///
    /// # Errors
    /// - `TorrentError::InvalidArgument` - Not a magnet URI or no usable `btih` topic
    pub fn parse_magnet_link(magnet_url: &str) -> Result<MagnetLink, TorrentError> {
        let url = Url::parse(magnet_url.trim()).map_err(|e| {
            TorrentError::invalid_argument(format!("Invalid magnet link: {e}"))
        })?;
        if url.scheme() != "magnet" {
            return Err(TorrentError::invalid_argument(format!(
                "Invalid magnet link: unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers: Vec<String> = Vec::new();
        let mut peers: Vec<SocketAddr> = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" if info_hash.is_none() => {
                    if let Some(hash) = value.strip_prefix(BTIH_PREFIX) {
                        info_hash = Some(Self::parse_hash(hash)?);
                    }
                }
                "dn" if !value.is_empty() => display_name = Some(value.into_owned()),
                "tr" if !value.is_empty() => {
                    let tracker = value.into_owned();
                    if !trackers.contains(&tracker) {
                        trackers.push(tracker);
                    }
                }
                "x.pe" => {
                    if let Ok(addr) = value.parse::<SocketAddr>()
                        && !peers.contains(&addr)
                    {
                        peers.push(addr);
                    }
                }
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            TorrentError::invalid_argument("Missing or invalid info hash in magnet link")
        })?;

        Ok(MagnetLink {
            info_hash,
            display_name,
            trackers,
            peers,
        })
    }

    fn parse_hash(text: &str) -> Result<InfoHash, TorrentError> {
        match text.len() {
            40 => InfoHash::from_hex(text).ok_or_else(|| {
                TorrentError::invalid_argument(format!("Invalid hex character in hash: {text}"))
            }),
            32 => decode_base32(text).map(InfoHash::new).ok_or_else(|| {
                TorrentError::invalid_argument(format!("Invalid base32 hash: {text}"))
            }),
            other => Err(TorrentError::invalid_argument(format!(
                "Invalid hash length: {other} (expected 40 hex or 32 base32)"
            ))),
        }
    }
}

/// RFC 4648 base32 without padding, exactly 160 bits.
fn decode_base32(text: &str) -> Option<[u8; 20]> {
    let mut hash = [0u8; 20];
    let mut buffer = 0u64;
    let mut bits = 0u32;
    let mut out = 0usize;

    for ch in text.bytes() {
        let value = match ch.to_ascii_uppercase() {
            c @ b'A'..=b'Z' => c - b'A',
            c @ b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | u64::from(value);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            *hash.get_mut(out)? = (buffer >> bits) as u8;
            out += 1;
        }
    }

    (out == 20).then_some(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnet_link_parsing() {
        let magnet = MagnetParser::parse_magnet_link(
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Test%20Torrent&tr=http://tracker.example.com/announce&tr=http%3A%2F%2Fother.example%2Fannounce",
        )
        .unwrap();

        assert_eq!(
            magnet.info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(magnet.display_name.as_deref(), Some("Test Torrent"));
        assert_eq!(
            magnet.trackers,
            vec![
                "http://tracker.example.com/announce".to_string(),
                "http://other.example/announce".to_string(),
            ]
        );
        assert!(magnet.peers.is_empty());
    }

    #[test]
    fn test_base32_hash() {
        // Base32 of twenty zero bytes followed by the hex equivalent
        let zero = MagnetParser::parse_magnet_link(
            "magnet:?xt=urn:btih:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
        )
        .unwrap();
        assert_eq!(zero.info_hash, InfoHash::new([0u8; 20]));

        let ones = MagnetParser::parse_magnet_link(
            "magnet:?xt=urn:btih:77777777777777777777777777777777",
        )
        .unwrap();
        assert_eq!(ones.info_hash, InfoHash::new([0xFF; 20]));
    }

    #[test]
    fn test_peer_addresses() {
        let magnet = MagnetParser::parse_magnet_link(
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&x.pe=127.0.0.1:6881&x.pe=not-an-addr&x.pe=127.0.0.1:6881",
        )
        .unwrap();
        assert_eq!(magnet.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
        assert_eq!(magnet.name(), "0123456789abcdef0123456789abcdef01234567");
    }

    #[test]
    fn test_invalid_magnet_links() {
        for input in [
            "invalid://not-a-magnet",
            "not a url at all",
            "magnet:?dn=Test%20Torrent&tr=http://tracker.example.com/announce",
            "magnet:?xt=urn:btih:tooshort&dn=Test",
            "magnet:?xt=urn:btih:zz23456789abcdef0123456789abcdef01234567",
            "magnet:?xt=urn:btih:1111111111111111111111111111111!",
        ] {
            let result = MagnetParser::parse_magnet_link(input);
            assert!(
                matches!(result, Err(TorrentError::InvalidArgument { .. })),
                "{input} should be rejected"
            );
        }
    }
}
