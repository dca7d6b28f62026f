//! Peer registry: connection state, availability, and scarcity ranking.
//!
//! The registry is owned by the scheduler task and mutated only there; no
//! other component holds a reference to it. Each entry tracks what one peer
//! claims to have, what we have outstanding to it, and the derived count of
//! pieces it holds that we still need, which drives request assignment
//! order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::peer_actor::PeerCommand;
use super::{BlockSpan, PieceIndex};

/// Registry entry for one connected peer.
#[derive(Debug)]
pub struct RegisteredPeer {
    pub address: SocketAddr,
    pub commands: mpsc::Sender<PeerCommand>,
    /// Peers start choked; no requests go out until an unchoke arrives.
    pub choked_us: bool,
    /// Pieces the peer claims to have. All-false until a bitfield or have
    /// message arrives.
    pub bitfield: Vec<bool>,
    /// Block requests currently outstanding to this peer, with send time.
    pub outstanding: HashMap<BlockSpan, Instant>,
    /// Pieces this peer has that we still need. The scarcity ranking key.
    pub pieces_needed: u32,
    /// Insertion order, the stable tie-break for equal need counts.
    ordinal: u64,
}

/// The set of connected peers, keyed by socket address.
pub struct PeerRegistry {
    peers: HashMap<SocketAddr, RegisteredPeer>,
    piece_count: u32,
    next_ordinal: u64,
}

impl PeerRegistry {
    /// Creates an empty registry for a torrent with the given piece count.
    pub fn new(piece_count: u32) -> Self {
        Self {
            peers: HashMap::new(),
            piece_count,
            next_ordinal: 0,
        }
    }

    /// Registers a connected peer. Idempotent: a duplicate identity is
    /// logged and left untouched.
    ///
    /// Returns true if the peer was new.
    pub fn register(&mut self, address: SocketAddr, commands: mpsc::Sender<PeerCommand>) -> bool {
        if self.peers.contains_key(&address) {
            tracing::warn!("Peer {address} already registered, ignoring duplicate");
            return false;
        }
        self.peers.insert(
            address,
            RegisteredPeer {
                address,
                commands,
                choked_us: true,
                bitfield: vec![false; self.piece_count as usize],
                outstanding: HashMap::new(),
                pieces_needed: 0,
                ordinal: self.next_ordinal,
            },
        );
        self.next_ordinal += 1;
        tracing::info!("Registered peer {address} ({} connected)", self.peers.len());
        true
    }

    /// Removes a peer, returning its entry so the scheduler can reclaim its
    /// outstanding requests. Dropping the entry closes the actor's command
    /// channel.
    pub fn remove(&mut self, address: SocketAddr) -> Option<RegisteredPeer> {
        let removed = self.peers.remove(&address);
        if removed.is_some() {
            tracing::info!("Removed peer {address} ({} connected)", self.peers.len());
        }
        removed
    }

    pub fn get(&self, address: SocketAddr) -> Option<&RegisteredPeer> {
        self.peers.get(&address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Iterates all registered peers in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredPeer> {
        self.peers.values()
    }

    /// Replaces a peer's claimed-have set and recomputes its need count.
    ///
    /// `needed[i]` is true while piece `i` is not yet verified. A bitfield
    /// of the wrong length is a protocol violation from the remote; it is
    /// logged and dropped rather than trusted.
    pub fn apply_bitfield(&mut self, address: SocketAddr, pieces: Vec<bool>, needed: &[bool]) {
        let Some(peer) = self.peers.get_mut(&address) else {
            return;
        };
        if pieces.len() != self.piece_count as usize {
            tracing::warn!(
                "Peer {address} sent bitfield of {} pieces, expected {}",
                pieces.len(),
                self.piece_count
            );
            return;
        }
        peer.bitfield = pieces;
        peer.pieces_needed = peer
            .bitfield
            .iter()
            .zip(needed)
            .filter(|(have, need)| **have && **need)
            .count() as u32;
    }

    /// Records a single have announcement and updates the need count.
    pub fn apply_have(&mut self, address: SocketAddr, index: PieceIndex, still_needed: bool) {
        let Some(peer) = self.peers.get_mut(&address) else {
            return;
        };
        let Some(slot) = peer.bitfield.get_mut(index.as_u32() as usize) else {
            tracing::warn!("Peer {address} announced out-of-range piece {index}");
            return;
        };
        if !*slot {
            *slot = true;
            if still_needed {
                peer.pieces_needed += 1;
            }
        }
    }

    /// Drops a newly verified piece from every peer's need count.
    pub fn mark_verified(&mut self, index: PieceIndex) {
        let slot = index.as_u32() as usize;
        for peer in self.peers.values_mut() {
            if peer.bitfield.get(slot).copied().unwrap_or(false) {
                peer.pieces_needed = peer.pieces_needed.saturating_sub(1);
            }
        }
    }

    /// Updates a peer's choke flag. Returns the previous value.
    pub fn set_choked(&mut self, address: SocketAddr, choked: bool) -> Option<bool> {
        let peer = self.peers.get_mut(&address)?;
        let previous = peer.choked_us;
        peer.choked_us = choked;
        Some(previous)
    }

    /// Orders peers for request assignment, scarcest source first.
    ///
    /// Ascending by need count: a peer holding few pieces we still need is
    /// the only plausible source for them, while widely held pieces stay
    /// obtainable later. The comparator is strict and total, with insertion
    /// order breaking ties, so equal peers never starve each other
    /// nondeterministically.
    pub fn rank_by_scarcity(&self) -> Vec<SocketAddr> {
        let mut ranked: Vec<&RegisteredPeer> = self.peers.values().collect();
        ranked.sort_by_key(|peer| (peer.pieces_needed, peer.ordinal));
        ranked.iter().map(|peer| peer.address).collect()
    }

    /// Records a block request sent to a peer.
    pub fn add_outstanding(&mut self, address: SocketAddr, span: BlockSpan, sent_at: Instant) {
        if let Some(peer) = self.peers.get_mut(&address) {
            peer.outstanding.insert(span, sent_at);
        }
    }

    /// Drops every outstanding request for one piece, returning the spans.
    pub fn take_piece_outstanding(
        &mut self,
        address: SocketAddr,
        index: PieceIndex,
    ) -> Vec<BlockSpan> {
        let Some(peer) = self.peers.get_mut(&address) else {
            return Vec::new();
        };
        let spans: Vec<BlockSpan> = peer
            .outstanding
            .keys()
            .filter(|span| span.piece == index)
            .copied()
            .collect();
        for span in &spans {
            peer.outstanding.remove(span);
        }
        spans
    }

    /// Drops all outstanding requests for a peer, returning the spans.
    pub fn clear_outstanding(&mut self, address: SocketAddr) -> Vec<BlockSpan> {
        match self.peers.get_mut(&address) {
            Some(peer) => peer.outstanding.drain().map(|(span, _)| span).collect(),
            None => Vec::new(),
        }
    }

    /// Number of block requests currently outstanding to a peer.
    pub fn outstanding_len(&self, address: SocketAddr) -> usize {
        self.peers
            .get(&address)
            .map(|peer| peer.outstanding.len())
            .unwrap_or(0)
    }

    /// Peers with any request older than the timeout.
    pub fn stalled(&self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
        self.peers
            .values()
            .filter(|peer| {
                peer.outstanding
                    .values()
                    .any(|sent_at| now.duration_since(*sent_at) > timeout)
            })
            .map(|peer| peer.address)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn registry_with_peers(piece_count: u32, ports: &[u16]) -> PeerRegistry {
        let mut registry = PeerRegistry::new(piece_count);
        for port in ports {
            let (tx, _rx) = mpsc::channel(8);
            assert!(registry.register(addr(*port), tx));
        }
        registry
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = PeerRegistry::new(4);
        let (tx, _rx) = mpsc::channel(8);
        assert!(registry.register(addr(1), tx.clone()));
        assert!(!registry.register(addr(1), tx));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_new_peer_starts_choked_with_empty_bitfield() {
        let registry = registry_with_peers(4, &[1]);
        let peer = registry.get(addr(1)).unwrap();
        assert!(peer.choked_us);
        assert_eq!(peer.bitfield, vec![false; 4]);
        assert_eq!(peer.pieces_needed, 0);
    }

    #[test]
    fn test_scarcity_ranking_is_strict_and_stable() {
        // Need counts [3, 1, 1, 2] in insertion order: both 1s first in
        // their original order, then the 2, then the 3.
        let mut registry = registry_with_peers(4, &[1, 2, 3, 4]);
        let needed = [true; 4];
        registry.apply_bitfield(addr(1), vec![true, true, true, false], &needed);
        registry.apply_bitfield(addr(2), vec![true, false, false, false], &needed);
        registry.apply_bitfield(addr(3), vec![false, true, false, false], &needed);
        registry.apply_bitfield(addr(4), vec![false, true, true, false], &needed);

        assert_eq!(
            registry.rank_by_scarcity(),
            vec![addr(2), addr(3), addr(4), addr(1)]
        );
    }

    #[test]
    fn test_need_count_tracks_verified_pieces() {
        let mut registry = registry_with_peers(4, &[1]);
        let needed = [true, true, false, true]; // piece 2 already verified
        registry.apply_bitfield(addr(1), vec![true, true, true, true], &needed);
        assert_eq!(registry.get(addr(1)).unwrap().pieces_needed, 3);

        registry.mark_verified(PieceIndex::new(0));
        assert_eq!(registry.get(addr(1)).unwrap().pieces_needed, 2);

        // A have for a piece we no longer need does not bump the count.
        let mut registry = registry_with_peers(4, &[2]);
        registry.apply_have(addr(2), PieceIndex::new(2), false);
        registry.apply_have(addr(2), PieceIndex::new(1), true);
        assert_eq!(registry.get(addr(2)).unwrap().pieces_needed, 1);
    }

    #[test]
    fn test_wrong_length_bitfield_is_dropped() {
        let mut registry = registry_with_peers(4, &[1]);
        registry.apply_bitfield(addr(1), vec![true; 7], &[true; 4]);
        assert_eq!(registry.get(addr(1)).unwrap().bitfield, vec![false; 4]);
    }

    #[test]
    fn test_outstanding_bookkeeping() {
        let mut registry = registry_with_peers(4, &[1]);
        let now = Instant::now();
        let span_a = BlockSpan {
            piece: PieceIndex::new(0),
            offset: 0,
            length: 16,
        };
        let span_b = BlockSpan {
            piece: PieceIndex::new(0),
            offset: 16,
            length: 16,
        };
        let span_c = BlockSpan {
            piece: PieceIndex::new(1),
            offset: 0,
            length: 16,
        };
        registry.add_outstanding(addr(1), span_a, now);
        registry.add_outstanding(addr(1), span_b, now);
        registry.add_outstanding(addr(1), span_c, now);
        assert_eq!(registry.outstanding_len(addr(1)), 3);

        let mut taken = registry.take_piece_outstanding(addr(1), PieceIndex::new(0));
        taken.sort_by_key(|span| span.offset);
        assert_eq!(taken, vec![span_a, span_b]);
        assert_eq!(registry.outstanding_len(addr(1)), 1);
    }

    #[test]
    fn test_stalled_detection() {
        let mut registry = registry_with_peers(4, &[1, 2]);
        let past = Instant::now() - Duration::from_secs(60);
        let span = BlockSpan {
            piece: PieceIndex::new(0),
            offset: 0,
            length: 16,
        };
        registry.add_outstanding(addr(1), span, past);
        registry.add_outstanding(addr(2), span, Instant::now());

        let stalled = registry.stalled(Instant::now(), Duration::from_secs(30));
        assert_eq!(stalled, vec![addr(1)]);
    }
}
