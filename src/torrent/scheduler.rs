//! Piece scheduler: the authoritative piece-state table and request driver.
//!
//! Runs as a single actor that owns the piece-state partition, the session
//! stats, and the peer registry. Everything reaches it through channels:
//! peer actors report events, the storage engine reports verification
//! outcomes, and the session handle submits queries. Being the only writer
//! of this state removes any need for locks.
//!
//! Per piece the state machine is
//! `Missing -> Requested -> Downloaded -> Verified`, with back-edges to
//! `Missing` on peer loss, choke, timeout, or hash failure. `Verified` is
//! terminal.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use super::peer_actor::{PeerCommand, PeerEvent};
use super::peers::PeerRegistry;
use super::{PieceIndex, TorrentError, TorrentLayout};
use crate::config::TorrentConfig;
use crate::storage::{StorageEvent, StorageHandle};

/// Download state of one piece. Every index is in exactly one state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceState {
    /// Not on disk and not requested from anyone.
    Missing,
    /// Block requests are outstanding to the owning peers.
    Requested { owners: HashSet<SocketAddr> },
    /// Bytes received and handed to storage; outcome pending. Remaining
    /// owners are peers that were still racing for this piece.
    Downloaded { owners: HashSet<SocketAddr> },
    /// On disk and hash-checked. Terminal.
    Verified,
}

/// Aggregate session counters.
///
/// `left` only decreases; the others only grow. Written solely by the
/// scheduler task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Stats {
    /// Bytes still to download and verify.
    pub left: u64,
    /// Payload bytes received from peers, verified or not.
    pub downloaded: u64,
    /// Payload bytes served to peers.
    pub uploaded: u64,
}

enum SchedulerCommand {
    Stats { responder: oneshot::Sender<Stats> },
    IsComplete { responder: oneshot::Sender<bool> },
    Shutdown { ack: oneshot::Sender<()> },
}

/// Cloneable handle for querying and stopping the scheduler actor.
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Returns a snapshot of the session counters.
    ///
    /// # Errors
    ///
    /// - `TorrentError::SchedulerClosed` - Scheduler already stopped
    pub async fn stats(&self) -> Result<Stats, TorrentError> {
        let (responder, response) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::Stats { responder })
            .await
            .map_err(|_| TorrentError::SchedulerClosed)?;
        response.await.map_err(|_| TorrentError::SchedulerResponseDropped)
    }

    /// True once every piece is verified.
    ///
    /// # Errors
    ///
    /// - `TorrentError::SchedulerClosed` - Scheduler already stopped
    pub async fn is_complete(&self) -> Result<bool, TorrentError> {
        let (responder, response) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::IsComplete { responder })
            .await
            .map_err(|_| TorrentError::SchedulerClosed)?;
        response.await.map_err(|_| TorrentError::SchedulerResponseDropped)
    }

    /// Stops the scheduler after it has shut down every peer actor.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self
            .sender
            .send(SchedulerCommand::Shutdown { ack })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }
}

/// Spawns the scheduler actor.
///
/// `verified` is the startup verification result; `true` entries seed
/// `Verified`, the rest `Missing`, and `Stats::left` starts as the sum of
/// the unverified piece sizes.
pub fn spawn_scheduler(
    layout: Arc<TorrentLayout>,
    config: TorrentConfig,
    verified: Vec<bool>,
    storage: StorageHandle,
    peer_events: mpsc::Receiver<PeerEvent>,
    storage_events: mpsc::Receiver<StorageEvent>,
) -> SchedulerHandle {
    let (sender, commands) = mpsc::channel(config.event_queue_capacity);
    let scheduler = PieceScheduler::new(layout, config, verified, storage);
    tokio::spawn(scheduler.run(commands, peer_events, storage_events));
    SchedulerHandle { sender }
}

struct PieceScheduler {
    layout: Arc<TorrentLayout>,
    config: TorrentConfig,
    pieces: Vec<PieceState>,
    stats: Stats,
    registry: PeerRegistry,
    storage: StorageHandle,
}

impl PieceScheduler {
    fn new(
        layout: Arc<TorrentLayout>,
        config: TorrentConfig,
        verified: Vec<bool>,
        storage: StorageHandle,
    ) -> Self {
        let pieces: Vec<PieceState> = verified
            .iter()
            .map(|done| {
                if *done {
                    PieceState::Verified
                } else {
                    PieceState::Missing
                }
            })
            .collect();

        let left = pieces
            .iter()
            .enumerate()
            .filter(|(_, state)| **state != PieceState::Verified)
            .map(|(index, _)| u64::from(layout.piece_size(PieceIndex::new(index as u32))))
            .sum();

        let registry = PeerRegistry::new(layout.piece_count());
        Self {
            layout,
            config,
            pieces,
            stats: Stats {
                left,
                ..Stats::default()
            },
            registry,
            storage,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SchedulerCommand>,
        mut peer_events: mpsc::Receiver<PeerEvent>,
        mut storage_events: mpsc::Receiver<StorageEvent>,
    ) {
        let mut sweep = tokio::time::interval(self.config.request_timeout / 2);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(command) = commands.recv() => match command {
                    SchedulerCommand::Stats { responder } => {
                        let _ = responder.send(self.stats);
                    }
                    SchedulerCommand::IsComplete { responder } => {
                        let _ = responder.send(self.is_complete());
                    }
                    SchedulerCommand::Shutdown { ack } => {
                        self.shutdown_peers().await;
                        let _ = ack.send(());
                        return;
                    }
                },
                Some(event) = peer_events.recv() => self.on_peer_event(event).await,
                Some(event) = storage_events.recv() => self.on_storage_event(event),
                _ = sweep.tick() => self.reap_stalled(),
                else => return,
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.pieces.iter().all(|state| *state == PieceState::Verified)
    }

    /// True per index while the piece is not yet verified.
    fn needed_mask(&self) -> Vec<bool> {
        self.pieces
            .iter()
            .map(|state| *state != PieceState::Verified)
            .collect()
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { address, commands } => {
                self.registry.register(address, commands);
            }
            PeerEvent::BitfieldReceived { address, pieces } => {
                let needed = self.needed_mask();
                self.registry.apply_bitfield(address, pieces, &needed);
                self.assign_next_requests();
            }
            PeerEvent::HaveReceived { address, index } => {
                let still_needed = self
                    .pieces
                    .get(index.as_u32() as usize)
                    .is_some_and(|state| *state != PieceState::Verified);
                self.registry.apply_have(address, index, still_needed);
                self.assign_next_requests();
            }
            PeerEvent::ChokeChanged { address, choked } => {
                let previous = self.registry.set_choked(address, choked);
                if previous == Some(false) && choked {
                    // Our request queue at that peer is gone; free its
                    // pieces for other sources.
                    tracing::debug!("Peer {address} choked us, reclaiming its assignments");
                    self.registry.clear_outstanding(address);
                    self.strip_owner(address);
                }
                self.assign_next_requests();
            }
            PeerEvent::PieceAssembled { address, index, data } => {
                self.on_piece_assembled(address, index, data).await;
            }
            PeerEvent::BlockServed { address: _, length } => {
                self.stats.uploaded += u64::from(length);
            }
            PeerEvent::Disconnected { address } => {
                tracing::info!("Peer {address} disconnected");
                self.reclaim_lost_peer(address);
                self.assign_next_requests();
            }
        }
    }

    async fn on_piece_assembled(&mut self, address: SocketAddr, index: PieceIndex, data: bytes::Bytes) {
        let Some(state) = self.pieces.get(index.as_u32() as usize).cloned() else {
            tracing::warn!("Peer {address} delivered out-of-range piece {index}");
            return;
        };
        // Whatever happens to the data, the blocks are no longer in flight.
        self.registry.take_piece_outstanding(address, index);

        match state {
            PieceState::Requested { mut owners } => {
                owners.remove(&address);
                self.stats.downloaded += data.len() as u64;
                self.pieces[index.as_u32() as usize] = PieceState::Downloaded { owners };
                if let Err(error) = self.storage.write_piece(index, data, address).await {
                    tracing::error!("Could not submit piece {index} to storage: {error}");
                }
            }
            PieceState::Downloaded { mut owners } => {
                // A racing source delivered the same piece first.
                owners.remove(&address);
                self.pieces[index.as_u32() as usize] = PieceState::Downloaded { owners };
                tracing::debug!("Discarding duplicate data for piece {index} from {address}");
            }
            PieceState::Missing | PieceState::Verified => {
                tracing::debug!("Discarding late data for piece {index} from {address}");
            }
        }
    }

    fn on_storage_event(&mut self, event: StorageEvent) {
        match event {
            StorageEvent::PieceVerified { index, source } => self.on_piece_verified(index, source),
            StorageEvent::PieceRejected { index, source } => {
                tracing::warn!("Piece {index} from {source} failed verification, re-requesting");
                self.revert_to_missing(index);
                self.assign_next_requests();
            }
            StorageEvent::WriteFailed { index, source, error } => {
                tracing::error!("Writing piece {index} from {source} failed: {error}");
                self.revert_to_missing(index);
                self.assign_next_requests();
            }
        }
    }

    fn on_piece_verified(&mut self, index: PieceIndex, source: SocketAddr) {
        let slot = index.as_u32() as usize;
        let Some(state) = self.pieces.get(slot).cloned() else {
            return;
        };
        if state == PieceState::Verified {
            return;
        }
        self.pieces[slot] = PieceState::Verified;

        // Anyone still racing for this piece gets a cancel for its blocks.
        if let PieceState::Requested { owners } | PieceState::Downloaded { owners } = state {
            self.cancel_owner_blocks(index, &owners);
        }

        self.stats.left = self
            .stats
            .left
            .saturating_sub(u64::from(self.layout.piece_size(index)));
        self.registry.mark_verified(index);
        self.broadcast_have(index);

        tracing::info!(
            "Piece {index} verified (from {source}), {} bytes left",
            self.stats.left
        );
        if self.is_complete() {
            tracing::info!("All pieces verified, download complete");
        }
        self.assign_next_requests();
    }

    /// Hash failure or failed write: discard and make re-requestable.
    fn revert_to_missing(&mut self, index: PieceIndex) {
        let slot = index.as_u32() as usize;
        let Some(state) = self.pieces.get(slot).cloned() else {
            return;
        };
        match state {
            PieceState::Requested { owners } | PieceState::Downloaded { owners } => {
                self.cancel_owner_blocks(index, &owners);
                self.pieces[slot] = PieceState::Missing;
            }
            PieceState::Missing => {}
            PieceState::Verified => {
                // Never un-verify; a stale failure report loses the race.
                tracing::debug!("Ignoring failure report for verified piece {index}");
            }
        }
    }

    fn cancel_owner_blocks(&mut self, index: PieceIndex, owners: &HashSet<SocketAddr>) {
        for owner in owners {
            let spans = self.registry.take_piece_outstanding(*owner, index);
            let Some(peer) = self.registry.get(*owner) else {
                continue;
            };
            for span in spans {
                if peer.commands.try_send(PeerCommand::CancelBlock(span)).is_err() {
                    // Late data gets discarded either way.
                    tracing::debug!("Could not deliver cancel to {owner} for piece {index}");
                }
            }
        }
    }

    fn broadcast_have(&self, index: PieceIndex) {
        for peer in self.registry.iter() {
            let _ = peer.commands.try_send(PeerCommand::AnnounceHave(index));
        }
    }

    /// Removes a peer and returns its solely-owned pieces to `Missing`.
    fn reclaim_lost_peer(&mut self, address: SocketAddr) {
        if self.registry.remove(address).is_some() {
            self.strip_owner(address);
        }
    }

    /// Removes a peer from every owner set; `Requested` pieces left with no
    /// owner revert to `Missing`.
    fn strip_owner(&mut self, address: SocketAddr) {
        for state in &mut self.pieces {
            match state {
                PieceState::Requested { owners } => {
                    owners.remove(&address);
                    if owners.is_empty() {
                        *state = PieceState::Missing;
                    }
                }
                PieceState::Downloaded { owners } => {
                    // Data is already with storage; only the racer is gone.
                    owners.remove(&address);
                }
                PieceState::Missing | PieceState::Verified => {}
            }
        }
    }

    /// Issues block requests, scarcest peers first.
    ///
    /// For each unchoked peer in scarcity order, every `Missing` piece the
    /// peer claims is split into block spans and requested whole, as long
    /// as the peer's outstanding budget fits the entire piece. The
    /// piece-to-peer mapping is recorded for later cancellation.
    fn assign_next_requests(&mut self) {
        loop {
            let lost = self.try_assign();
            if lost.is_empty() {
                return;
            }
            for address in lost {
                tracing::warn!("Peer {address} channel closed, dropping peer");
                self.reclaim_lost_peer(address);
            }
        }
    }

    fn try_assign(&mut self) -> Vec<SocketAddr> {
        let now = Instant::now();
        let mut lost = Vec::new();

        for address in self.registry.rank_by_scarcity() {
            let Some(peer) = self.registry.get(address) else {
                continue;
            };
            if peer.choked_us {
                continue;
            }
            let mut budget = self
                .config
                .max_outstanding_per_peer
                .saturating_sub(peer.outstanding.len());
            if budget == 0 {
                continue;
            }
            let commands = peer.commands.clone();
            let bitfield = peer.bitfield.clone();

            let candidates: Vec<u32> = (0..self.layout.piece_count())
                .filter(|index| {
                    bitfield[*index as usize]
                        && self.pieces[*index as usize] == PieceState::Missing
                })
                .collect();

            'pieces: for index in candidates {
                let index = PieceIndex::new(index);
                let spans = self.layout.blocks(index, self.config.block_size);
                if spans.len() > budget {
                    continue;
                }
                // A piece goes out whole or not at all; a partially
                // requested piece would never be completed.
                if commands.capacity() < spans.len() {
                    tracing::debug!("Peer {address} command queue full, deferring");
                    break;
                }

                let mut sent = Vec::with_capacity(spans.len());
                for span in &spans {
                    match commands.try_send(PeerCommand::RequestBlock(*span)) {
                        Ok(()) => sent.push(*span),
                        Err(TrySendError::Full(_)) => {
                            // Queue filled under us; withdraw the partial
                            // piece and leave it Missing for the next pass.
                            for sent_span in &sent {
                                let _ = commands
                                    .try_send(PeerCommand::CancelBlock(*sent_span));
                            }
                            sent.clear();
                            break;
                        }
                        Err(TrySendError::Closed(_)) => {
                            lost.push(address);
                            break 'pieces;
                        }
                    }
                }
                if sent.is_empty() {
                    break;
                }
                for span in &sent {
                    self.registry.add_outstanding(address, *span, now);
                }
                self.pieces[index.as_u32() as usize] = PieceState::Requested {
                    owners: HashSet::from([address]),
                };
                budget -= sent.len();
                if budget == 0 {
                    break;
                }
            }
        }
        lost
    }

    /// Treats peers with timed-out requests as lost.
    fn reap_stalled(&mut self) {
        let stalled = self
            .registry
            .stalled(Instant::now(), self.config.request_timeout);
        if stalled.is_empty() {
            return;
        }
        for address in stalled {
            tracing::warn!("Peer {address} timed out, dropping");
            self.reclaim_lost_peer(address);
        }
        self.assign_next_requests();
    }

    /// Asks every peer actor to shut down and waits for their acks.
    async fn shutdown_peers(&mut self) {
        let mut pending = Vec::new();
        for peer in self.registry.iter() {
            let (ack, done) = oneshot::channel();
            if peer
                .commands
                .try_send(PeerCommand::Shutdown { ack })
                .is_ok()
            {
                pending.push(done);
            }
        }
        tracing::info!("Waiting for {} peer actor(s) to stop", pending.len());
        // Acks may error if an actor already exited; both count as stopped.
        join_all(pending).await;
    }
}
