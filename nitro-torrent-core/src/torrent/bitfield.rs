//! Piece availability bitfield in peer-wire layout (MSB first)

use bytes::Bytes;

use super::{PieceIndex, TorrentError};

/// Set of piece indices, one bit per piece.
///
/// Bit layout matches the wire `bitfield` message: piece 0 is the high bit
/// of the first byte. Spare bits in the last byte are always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: u32,
}

impl Bitfield {
    /// Creates an empty bitfield for the given number of pieces.
    pub fn new(piece_count: u32) -> Self {
        Self {
            bits: vec![0u8; piece_count.div_ceil(8) as usize],
            piece_count,
        }
    }

    /// Creates a bitfield with every piece set.
    pub fn full(piece_count: u32) -> Self {
        let mut bitfield = Self::new(piece_count);
        for index in 0..piece_count {
            bitfield.set(PieceIndex::new(index));
        }
        bitfield
    }

    /// Parses a bitfield received from a peer.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolMismatch` - Wrong length or spare bits set
    pub fn from_bytes(data: &[u8], piece_count: u32) -> Result<Self, TorrentError> {
        let expected = piece_count.div_ceil(8) as usize;
        if data.len() != expected {
            return Err(TorrentError::protocol(format!(
                "bitfield has {} bytes, expected {expected} for {piece_count} pieces",
                data.len()
            )));
        }

        let spare_bits = expected as u32 * 8 - piece_count;
        if spare_bits > 0
            && let Some(last) = data.last()
            && last & ((1u8 << spare_bits) - 1) != 0
        {
            return Err(TorrentError::protocol("bitfield has spare bits set"));
        }

        Ok(Self {
            bits: data.to_vec(),
            piece_count,
        })
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Checks whether a piece is set. Out of range indices are never set.
    pub fn has(&self, piece: PieceIndex) -> bool {
        let index = piece.as_u32();
        if index >= self.piece_count {
            return false;
        }
        let mask = 1u8 << (7 - (index % 8));
        self.bits[(index / 8) as usize] & mask != 0
    }

    /// Sets a piece, returning `true` if it was previously unset.
    pub fn set(&mut self, piece: PieceIndex) -> bool {
        let index = piece.as_u32();
        if index >= self.piece_count {
            return false;
        }
        let mask = 1u8 << (7 - (index % 8));
        let byte = &mut self.bits[(index / 8) as usize];
        let newly_set = *byte & mask == 0;
        *byte |= mask;
        newly_set
    }

    pub fn clear(&mut self, piece: PieceIndex) {
        let index = piece.as_u32();
        if index >= self.piece_count {
            return;
        }
        let mask = 1u8 << (7 - (index % 8));
        self.bits[(index / 8) as usize] &= !mask;
    }

    /// Number of pieces set.
    pub fn count(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|byte| *byte == 0)
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Fraction of pieces set, 0.0 for a torrent without pieces.
    pub fn fraction(&self) -> f64 {
        if self.piece_count == 0 {
            return 0.0;
        }
        f64::from(self.count()) / f64::from(self.piece_count)
    }

    /// Iterates over set piece indices in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.piece_count)
            .map(PieceIndex::new)
            .filter(|piece| self.has(*piece))
    }

    /// Checks whether this bitfield holds any piece that `other` lacks.
    pub fn has_any_missing_from(&self, other: &Bitfield) -> bool {
        self.iter_set().any(|piece| !other.has(piece))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }
}
