//! Storage engine actor.
//!
//! Owns the piece store and services write/read commands from the rest of
//! the session. Each piece write and block read runs as its own task so a
//! slow disk never blocks command intake, but tasks are gated by a
//! fixed-size semaphore so a fast peer cannot spawn unbounded disk work.
//!
//! Piece bytes are hash-checked before anything touches disk; the scheduler
//! only ever learns `PieceVerified` for bytes that matched the recorded
//! digest.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Semaphore, mpsc, oneshot};

use super::{PieceStore, StorageError};
use crate::torrent::{BlockSpan, PieceIndex, TorrentLayout};

/// Commands accepted by the storage engine actor.
enum StorageCommand {
    WritePiece {
        index: PieceIndex,
        data: Bytes,
        source: SocketAddr,
    },
    ReadBlock {
        span: BlockSpan,
        responder: oneshot::Sender<Result<Bytes, StorageError>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Completion events reported to the scheduler.
#[derive(Debug)]
pub enum StorageEvent {
    /// Piece bytes matched the recorded digest and were written.
    PieceVerified { index: PieceIndex, source: SocketAddr },
    /// Piece bytes failed the hash check; nothing was written.
    PieceRejected { index: PieceIndex, source: SocketAddr },
    /// Hash matched but the write itself failed. Fatal for this piece only.
    WriteFailed {
        index: PieceIndex,
        source: SocketAddr,
        error: StorageError,
    },
}

/// Cloneable handle to the storage engine actor.
#[derive(Clone)]
pub struct StorageHandle {
    sender: mpsc::Sender<StorageCommand>,
}

impl StorageHandle {
    /// Submits a received piece for verification and persistence.
    ///
    /// The outcome arrives on the scheduler's storage-event channel, never
    /// as a return value.
    ///
    /// # Errors
    ///
    /// - `StorageError::EngineShutdown` - Engine already stopped
    pub async fn write_piece(
        &self,
        index: PieceIndex,
        data: Bytes,
        source: SocketAddr,
    ) -> Result<(), StorageError> {
        self.sender
            .send(StorageCommand::WritePiece { index, data, source })
            .await
            .map_err(|_| StorageError::EngineShutdown)
    }

    /// Reads a block for upload to a remote peer.
    ///
    /// # Errors
    ///
    /// - `StorageError::OutOfRange` - Span outside the layout
    /// - `StorageError::EngineShutdown` - Engine already stopped
    /// - `StorageError::Io` - Disk read failed
    pub async fn read_block(&self, span: BlockSpan) -> Result<Bytes, StorageError> {
        let (responder, response) = oneshot::channel();
        self.sender
            .send(StorageCommand::ReadBlock { span, responder })
            .await
            .map_err(|_| StorageError::EngineShutdown)?;
        response.await.map_err(|_| StorageError::EngineShutdown)?
    }

    /// Stops the engine after draining in-flight disk work.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(StorageCommand::Shutdown { ack }).await.is_ok() {
            let _ = done.await;
        }
    }
}

/// Spawns the storage engine actor and returns its handle.
///
/// `disk_workers` bounds how many write/read tasks run at once; when the
/// pool is saturated the actor stops draining its command queue, which
/// backpressures senders through the bounded channel.
pub fn spawn_storage_engine<P>(
    store: Arc<P>,
    layout: Arc<TorrentLayout>,
    events: mpsc::Sender<StorageEvent>,
    disk_workers: usize,
    queue_capacity: usize,
) -> StorageHandle
where
    P: PieceStore + 'static,
{
    let (sender, mut receiver) = mpsc::channel(queue_capacity);
    let semaphore = Arc::new(Semaphore::new(disk_workers));

    tokio::spawn(async move {
        while let Some(command) = receiver.recv().await {
            match command {
                StorageCommand::WritePiece { index, data, source } => {
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    let store = store.clone();
                    let layout = layout.clone();
                    let events = events.clone();
                    tokio::spawn(async move {
                        let event = write_and_verify(&*store, &layout, index, data, source).await;
                        let _ = events.send(event).await;
                        drop(permit);
                    });
                }
                StorageCommand::ReadBlock { span, responder } => {
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    let store = store.clone();
                    tokio::spawn(async move {
                        let result = store.read_block(span).await;
                        let _ = responder.send(result);
                        drop(permit);
                    });
                }
                StorageCommand::Shutdown { ack } => {
                    // Taking every permit waits out the in-flight tasks.
                    let _drain = semaphore.acquire_many(disk_workers as u32).await;
                    tracing::debug!("Storage engine drained and stopping");
                    let _ = ack.send(());
                    return;
                }
            }
        }
    });

    StorageHandle { sender }
}

async fn write_and_verify<P: PieceStore>(
    store: &P,
    layout: &TorrentLayout,
    index: PieceIndex,
    data: Bytes,
    source: SocketAddr,
) -> StorageEvent {
    if !layout.piece_hash_matches(index, &data) {
        tracing::warn!("Piece {index} from {source} failed hash check, discarding");
        return StorageEvent::PieceRejected { index, source };
    }

    match store.write_piece(index, &data).await {
        Ok(()) => {
            tracing::debug!("Piece {index} from {source} verified and written");
            StorageEvent::PieceVerified { index, source }
        }
        Err(error) => {
            tracing::error!("Piece {index} from {source} write failed: {error}");
            StorageEvent::WriteFailed { index, source, error }
        }
    }
}
