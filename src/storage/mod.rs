//! Storage layer for torrent piece data.
//!
//! Defines the piece-store interface plus the file-backed implementation
//! and the storage engine actor that services writes and reads during a
//! session. The storage layer knows nothing about peers or scheduling.

pub mod engine;
pub mod file_store;

use async_trait::async_trait;
use bytes::Bytes;

pub use engine::{StorageEvent, StorageHandle, spawn_storage_engine};
pub use file_store::FileStore;

use crate::torrent::{BlockSpan, PieceIndex};

/// Positional piece I/O against a torrent's backing files.
///
/// Implementations own the file handles and the offset arithmetic that
/// maps pieces and blocks onto one or more files. The storage engine actor
/// drives this trait; tests substitute an in-memory implementation.
#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Reads the whole dataset piece-by-piece and hash-checks each piece.
    ///
    /// Returns one boolean per piece index. Regions that cannot be read
    /// (files missing data) count as a hash mismatch, not an error.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - File system failure other than short data
    async fn verify_all(&self) -> Result<Vec<bool>, StorageError>;

    /// Writes one complete piece at its position, crossing file boundaries.
    ///
    /// # Errors
    ///
    /// - `StorageError::OutOfRange` - Piece index or length outside layout
    /// - `StorageError::Io` - Write failed or was short
    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError>;

    /// Reads one block at its position, crossing file boundaries.
    ///
    /// # Errors
    ///
    /// - `StorageError::OutOfRange` - Span extends past the final file
    /// - `StorageError::Io` - Read failed
    async fn read_block(&self, span: BlockSpan) -> Result<Bytes, StorageError>;
}

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Offset arithmetic left the declared file spans
    #[error("Request for piece {piece} offset {offset} length {length} is out of range")]
    OutOfRange {
        piece: PieceIndex,
        offset: u32,
        length: u32,
    },

    /// Piece payload does not match the size the layout declares
    #[error("Piece {index} has {actual} bytes, layout declares {expected}")]
    WrongPieceSize {
        index: PieceIndex,
        actual: usize,
        expected: u32,
    },

    /// Storage engine actor has already stopped
    #[error("Storage engine is shut down")]
    EngineShutdown,

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
