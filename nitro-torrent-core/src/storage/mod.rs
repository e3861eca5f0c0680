//! Storage layer for torrent data.
//!
//! The piece store maps pieces onto the torrent's files, buffers blocks
//! until a piece verifies, and writes verified pieces to disk. Resume data
//! records which pieces are verified so a restart does not re-download them.

pub mod piece_store;
pub mod resume;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

use std::path::PathBuf;

pub use piece_store::{BlockOutcome, PieceStatus, PieceStore};
pub use resume::{ResumeData, ResumeStore};

use crate::torrent::PieceIndex;

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Block does not fit the piece, or piece index is past the end
    #[error("Block {offset}+{length} out of range for piece {piece}")]
    OutOfRange {
        piece: PieceIndex,
        offset: u32,
        length: u32,
    },

    /// Not enough disk space available for the operation
    #[error("Insufficient disk space: need {needed} bytes, have {available}")]
    InsufficientSpace { needed: u64, available: u64 },

    /// Upload requested for a piece we do not have
    #[error("Piece {index} is not verified")]
    PieceNotVerified { index: PieceIndex },

    /// Persisted state that cannot be decoded
    #[error("Corrupt resume data in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// File system failure on a specific path
    #[error("Cannot access {path}: {source}")]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileAccess {
            path: path.into(),
            source,
        }
    }
}
