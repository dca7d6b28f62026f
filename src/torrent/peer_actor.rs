//! Message contract between the core and per-peer wire actors.
//!
//! One actor runs per connected peer. Its wire loop (handshake, framing,
//! keep-alive) is a collaborator's job; the core only sees the two message
//! enums here. Commands for one peer travel a single channel, so a
//! `CancelBlock` is observed before any command sent after it; an actor
//! must stop forwarding data for a block once it has seen its cancel.
//!
//! The scheduler drops a peer's command sender when it removes the peer, so
//! a closed command channel is the actor's signal to terminate.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::{BlockSpan, PieceIndex, TorrentError};
use crate::storage::StorageHandle;

/// Commands from the scheduler to one peer actor.
#[derive(Debug)]
pub enum PeerCommand {
    /// Request one block from the remote peer.
    RequestBlock(BlockSpan),
    /// Withdraw an earlier request; data arriving for it will be discarded
    /// by the scheduler regardless.
    CancelBlock(BlockSpan),
    /// Advertise a newly verified piece to the remote peer.
    AnnounceHave(PieceIndex),
    /// Close the connection and acknowledge once the wire loop has exited.
    Shutdown { ack: oneshot::Sender<()> },
}

/// Events from peer actors to the scheduler.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed; `commands` is the actor's inbound channel.
    Connected {
        address: SocketAddr,
        commands: mpsc::Sender<PeerCommand>,
    },
    /// Remote sent its full bitfield.
    BitfieldReceived {
        address: SocketAddr,
        pieces: Vec<bool>,
    },
    /// Remote announced one newly acquired piece.
    HaveReceived {
        address: SocketAddr,
        index: PieceIndex,
    },
    /// Remote choked (`true`) or unchoked (`false`) us.
    ChokeChanged { address: SocketAddr, choked: bool },
    /// All blocks of a piece arrived and were assembled in order.
    PieceAssembled {
        address: SocketAddr,
        index: PieceIndex,
        data: Bytes,
    },
    /// A block was uploaded to the remote peer.
    BlockServed { address: SocketAddr, length: u32 },
    /// Connection ended, voluntarily or on error.
    Disconnected { address: SocketAddr },
}

/// Handle given to wire-level collaborators for reaching the core.
///
/// Cloned once per peer actor: `events` feeds the scheduler, `storage`
/// answers upload requests from the remote side.
#[derive(Clone)]
pub struct PeerLink {
    events: mpsc::Sender<PeerEvent>,
    storage: StorageHandle,
    command_capacity: usize,
}

impl PeerLink {
    pub(crate) fn new(
        events: mpsc::Sender<PeerEvent>,
        storage: StorageHandle,
        command_capacity: usize,
    ) -> Self {
        Self {
            events,
            storage,
            command_capacity,
        }
    }

    /// Registers a freshly handshaken peer with the scheduler.
    ///
    /// Creates the actor's command channel at the session's configured
    /// capacity and reports `Connected`. The actor owns the returned
    /// receiver for the lifetime of the connection.
    ///
    /// # Errors
    ///
    /// - `TorrentError::SchedulerClosed` - Session already stopped
    pub async fn connect(
        &self,
        address: SocketAddr,
    ) -> Result<mpsc::Receiver<PeerCommand>, TorrentError> {
        let (commands, receiver) = mpsc::channel(self.command_capacity);
        self.report(PeerEvent::Connected { address, commands }).await?;
        Ok(receiver)
    }

    /// Reports a peer event to the scheduler.
    ///
    /// # Errors
    ///
    /// - `TorrentError::SchedulerClosed` - Session already stopped
    pub async fn report(&self, event: PeerEvent) -> Result<(), TorrentError> {
        self.events
            .send(event)
            .await
            .map_err(|_| TorrentError::SchedulerClosed)
    }

    /// Serves a remote peer's block request from storage.
    ///
    /// Reads the block and reports the served bytes so the session's upload
    /// counter stays accurate. The caller puts the returned bytes on the
    /// wire.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - Block out of range or disk read failed
    pub async fn serve_block(
        &self,
        address: SocketAddr,
        span: BlockSpan,
    ) -> Result<Bytes, TorrentError> {
        let data = self.storage.read_block(span).await?;
        self.report(PeerEvent::BlockServed {
            address,
            length: data.len() as u32,
        })
        .await?;
        Ok(data)
    }
}
