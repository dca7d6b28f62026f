//! Ebbtide - piece acquisition engine for BitTorrent downloads
//!
//! This crate provides the download core of a BitTorrent client: a
//! rarest-first piece scheduler, a peer registry, and a verifying
//! multi-file storage layer, wired together under a supervised session.
//! Wire-level peer connections are a collaborator's job; they plug in
//! through the message contract in [`torrent::peer_actor`].

pub mod config;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::SessionConfig;
pub use storage::{FileStore, StorageError};
pub use torrent::{Session, Stats, TorrentError};

/// Core errors that can bubble up from any ebbtide subsystem.
#[derive(Debug, thiserror::Error)]
pub enum EbbtideError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type for ebbtide operations.
pub type Result<T> = std::result::Result<T, EbbtideError>;
