//! Download session: wires storage, scheduler, and peer plumbing together.
//!
//! A session owns the component tree for one torrent. Startup is strictly
//! ordered: backing files open and verify first, then the storage engine
//! spawns, then the scheduler. Shutdown walks the same tree in reverse so
//! nothing references a component that has already stopped.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::peer_actor::PeerLink;
use super::scheduler::{self, SchedulerHandle, Stats};
use super::{PeerId, TorrentError, TorrentLayout};
use crate::config::SessionConfig;
use crate::storage::{FileStore, PieceStore, StorageHandle, spawn_storage_engine};

/// A running download session for one torrent.
pub struct Session {
    layout: Arc<TorrentLayout>,
    peer_id: PeerId,
    scheduler: SchedulerHandle,
    storage: StorageHandle,
    peer_link: PeerLink,
}

impl Session {
    /// Opens the backing files, verifies existing data, and spawns the
    /// component tree.
    ///
    /// Pieces already on disk that hash-check are kept; the session resumes
    /// from whatever survives verification.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - Backing files could not be opened or read
    pub async fn start(
        config: SessionConfig,
        layout: TorrentLayout,
        download_root: &Path,
    ) -> Result<Self, TorrentError> {
        let layout = Arc::new(layout);
        let peer_id = PeerId::generate();
        tracing::info!(
            "Starting session for {} ({}, {} pieces, {} bytes)",
            layout.name,
            layout.info_hash,
            layout.piece_count(),
            layout.total_length
        );

        let store = Arc::new(FileStore::open(download_root, layout.clone()).await?);
        let verified = store.verify_all().await?;
        let have = verified.iter().filter(|v| **v).count();
        tracing::info!("Startup verification kept {have}/{} pieces", layout.piece_count());

        let (storage_events_tx, storage_events_rx) =
            mpsc::channel(config.torrent.event_queue_capacity);
        let storage = spawn_storage_engine(
            store,
            layout.clone(),
            storage_events_tx,
            config.storage.disk_workers,
            config.storage.command_queue_capacity,
        );

        let (peer_events_tx, peer_events_rx) = mpsc::channel(config.torrent.event_queue_capacity);
        let peer_command_capacity = config.torrent.peer_command_capacity;
        let scheduler = scheduler::spawn_scheduler(
            layout.clone(),
            config.torrent,
            verified,
            storage.clone(),
            peer_events_rx,
            storage_events_rx,
        );

        let peer_link = PeerLink::new(peer_events_tx, storage.clone(), peer_command_capacity);
        Ok(Self {
            layout,
            peer_id,
            scheduler,
            storage,
            peer_link,
        })
    }

    /// The torrent geometry this session serves.
    pub fn layout(&self) -> &Arc<TorrentLayout> {
        &self.layout
    }

    /// Our identity for wire handshakes.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Handle handed to each wire-level peer actor.
    pub fn peer_link(&self) -> PeerLink {
        self.peer_link.clone()
    }

    /// Snapshot of the session counters.
    ///
    /// # Errors
    ///
    /// - `TorrentError::SchedulerClosed` - Session already stopped
    pub async fn stats(&self) -> Result<Stats, TorrentError> {
        self.scheduler.stats().await
    }

    /// True once every piece is verified on disk.
    ///
    /// # Errors
    ///
    /// - `TorrentError::SchedulerClosed` - Session already stopped
    pub async fn is_complete(&self) -> Result<bool, TorrentError> {
        self.scheduler.is_complete().await
    }

    /// Stops the session: peer actors first, then the scheduler, then the
    /// storage engine once no producer remains.
    ///
    /// Every step waits for an acknowledgement, so when this returns all
    /// in-flight disk work has completed. Idempotent; a second call finds
    /// closed channels and returns immediately.
    pub async fn stop(&self) {
        tracing::info!("Stopping session for {}", self.layout.info_hash);
        self.scheduler.shutdown().await;
        self.storage.shutdown().await;
        tracing::info!("Session for {} stopped", self.layout.info_hash);
    }
}
