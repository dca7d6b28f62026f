//! Centralized configuration for ebbtide.
//!
//! All tunable parameters live here to avoid hard-coded values scattered
//! throughout the codebase.

use std::time::Duration;

/// Central configuration for a download session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub torrent: TorrentConfig,
    pub storage: StorageConfig,
}

/// Piece-exchange behavior: request sizing, pipelining, and timeouts.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Wire-level request size. 16 KiB is the size every mainstream client
    /// accepts.
    pub block_size: u32,
    /// Cap on block requests in flight to a single peer.
    pub max_outstanding_per_peer: usize,
    /// A peer with any request older than this is treated as lost.
    pub request_timeout: Duration,
    /// Capacity of the scheduler's inbound event channels.
    pub event_queue_capacity: usize,
    /// Capacity of each peer actor's command channel.
    pub peer_command_capacity: usize,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            block_size: 16_384,
            max_outstanding_per_peer: 32,
            request_timeout: Duration::from_secs(30),
            event_queue_capacity: 256,
            peer_command_capacity: 64,
        }
    }
}

/// Disk I/O configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Concurrent disk write/read tasks. Bounds resource growth when peers
    /// outpace the disk.
    pub disk_workers: usize,
    /// Capacity of the storage engine's command queue.
    pub command_queue_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            disk_workers: num_cpus::get().min(4),
            command_queue_capacity: 64,
        }
    }
}
