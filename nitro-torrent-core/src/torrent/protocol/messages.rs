//! BitTorrent wire protocol message serialization and deserialization

use bytes::{Buf, BufMut, Bytes};

use super::super::{PieceIndex, TorrentError};
use super::types::PeerMessage;

/// Largest frame accepted from a peer (length prefix value).
pub const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

/// Message id of BEP 10 extension messages.
pub const EXTENDED_MESSAGE_ID: u8 = 20;

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes peer message including its 4-byte length prefix
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(0);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(5);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(6);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.reserve(13 + data.len());
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                buf.put_u32(3);
                buf.put_u8(9);
                buf.put_u16(*port);
            }
            PeerMessage::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(EXTENDED_MESSAGE_ID);
                buf.put_u8(*id);
                buf.extend_from_slice(payload);
            }
        }

        buf
    }

    /// Deserializes a complete frame including its length prefix
    ///
    /// # Errors
    /// - `TorrentError::ProtocolMismatch` - Truncated frame or malformed message
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, TorrentError> {
        if data.len() < 4 {
            return Err(TorrentError::protocol("message too short"));
        }
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() != 4 + length {
            return Err(TorrentError::protocol(format!(
                "frame declares {length} bytes but carries {}",
                data.len() - 4
            )));
        }
        Self::decode_payload(Bytes::copy_from_slice(&data[4..]))
    }

    /// Decodes a frame body (message id plus payload, without length prefix).
    ///
    /// An empty body is a keep-alive.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolMismatch` - Unknown id or wrong length for the id
    pub fn decode_payload(mut body: Bytes) -> Result<PeerMessage, TorrentError> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let message_id = body.get_u8();
        let remaining = body.len();
        let expect = |len: usize, name: &str| {
            if remaining == len {
                Ok(())
            } else {
                Err(TorrentError::protocol(format!(
                    "invalid {name} message length {}",
                    remaining + 1
                )))
            }
        };

        match message_id {
            0 => expect(0, "choke").map(|_| PeerMessage::Choke),
            1 => expect(0, "unchoke").map(|_| PeerMessage::Unchoke),
            2 => expect(0, "interested").map(|_| PeerMessage::Interested),
            3 => expect(0, "not interested").map(|_| PeerMessage::NotInterested),
            4 => {
                expect(4, "have")?;
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(body.get_u32()),
                })
            }
            5 => Ok(PeerMessage::Bitfield { bitfield: body }),
            6 | 8 => {
                expect(12, if message_id == 6 { "request" } else { "cancel" })?;
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                let length = body.get_u32();
                Ok(if message_id == 6 {
                    PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    }
                } else {
                    PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    }
                })
            }
            7 => {
                if remaining < 8 {
                    return Err(TorrentError::protocol("invalid piece message length"));
                }
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: body,
                })
            }
            9 => {
                expect(2, "port")?;
                Ok(PeerMessage::Port {
                    port: body.get_u16(),
                })
            }
            EXTENDED_MESSAGE_ID => {
                if remaining < 1 {
                    return Err(TorrentError::protocol("invalid extended message length"));
                }
                let id = body.get_u8();
                Ok(PeerMessage::Extended { id, payload: body })
            }
            _ => Err(TorrentError::protocol(format!(
                "unknown message id {message_id}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let test_cases = vec![
            PeerMessage::KeepAlive,
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have {
                piece_index: PieceIndex::new(42),
            },
            PeerMessage::Request {
                piece_index: PieceIndex::new(10),
                offset: 16384,
                length: 16384,
            },
            PeerMessage::Cancel {
                piece_index: PieceIndex::new(3),
                offset: 0,
                length: 100,
            },
            PeerMessage::Extended {
                id: 0,
                payload: Bytes::from_static(b"d1:md11:ut_metadatai1eee"),
            },
        ];

        for original in test_cases {
            let serialized = MessageCodec::serialize_message(&original);
            let deserialized = MessageCodec::deserialize_message(&serialized).unwrap();
            assert_eq!(original, deserialized);
        }
    }

    #[test]
    fn test_request_wire_bytes() {
        let bytes = MessageCodec::serialize_message(&PeerMessage::Request {
            piece_index: PieceIndex::new(1),
            offset: 0x4000,
            length: 0x4000,
        });
        assert_eq!(
            bytes,
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_piece_message_with_data() {
        let piece_data = Bytes::from(vec![1, 2, 3, 4, 5]);
        let message = PeerMessage::Piece {
            piece_index: PieceIndex::new(0),
            offset: 0,
            data: piece_data.clone(),
        };

        let serialized = MessageCodec::serialize_message(&message);
        assert_eq!(&serialized[..5], &[0, 0, 0, 14, 7]);

        match MessageCodec::deserialize_message(&serialized).unwrap() {
            PeerMessage::Piece { data, offset, .. } => {
                assert_eq!(offset, 0);
                assert_eq!(data, piece_data);
            }
            other => panic!("Expected Piece message, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_messages_rejected() {
        // have with a short body
        assert!(MessageCodec::decode_payload(Bytes::from_static(&[4, 0, 0])).is_err());
        // choke with trailing bytes
        assert!(MessageCodec::decode_payload(Bytes::from_static(&[0, 1])).is_err());
        // unknown id
        assert!(MessageCodec::decode_payload(Bytes::from_static(&[99])).is_err());
        // frame length disagrees with data
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 5, 4, 0]).is_err());
    }
}
