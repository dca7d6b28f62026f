//! Piece-exchange engine: layout math, peer registry, scheduler, session.

pub mod layout;
pub mod peer_actor;
pub mod peers;
pub mod scheduler;
pub mod session;


use std::fmt;

pub use layout::{BlockSpan, TorrentFileEntry, TorrentLayout};
pub use peer_actor::{PeerCommand, PeerEvent, PeerLink};
pub use peers::PeerRegistry;
pub use scheduler::{PieceState, SchedulerHandle, Stats};
pub use session::Session;

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
///
/// Torrent content is divided into fixed-size pieces for downloading and
/// verification. Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// BitTorrent peer identifier for this client.
///
/// 20-byte identifier exchanged during handshakes. The wire-level handshake
/// itself is a collaborator's job; the session only hands this value out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generate random peer ID for this client.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-EB0001-");
        for byte in &mut id[8..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

/// Errors that can occur during piece-exchange operations.
///
/// Covers metadata validation, peer communication failures, and data
/// verification. Storage failures are wrapped so callers see one error type.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Invalid torrent metadata: {reason}")]
    InvalidMetainfo { reason: String },

    #[error("Scheduler channel closed")]
    SchedulerClosed,

    #[error("Scheduler dropped response")]
    SchedulerResponseDropped,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_piece_index_ordering() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
    }

    #[test]
    fn test_peer_id_prefix() {
        let id = PeerId::generate();
        assert_eq!(&id.as_bytes()[..8], b"-EB0001-");
    }
}
