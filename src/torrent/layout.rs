//! Immutable torrent geometry: piece sizes, block spans, file list.
//!
//! Built once from parsed metadata and shared read-only by the storage
//! engine and the scheduler. All offset arithmetic for pieces and blocks
//! lives here so the rest of the crate never recomputes it.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use super::{InfoHash, PieceIndex, TorrentError};

/// One entry of the declared on-disk file list.
///
/// Paths are relative: the torrent name for single-file mode, or paths
/// under the torrent-named root directory for multi-file mode.
#[derive(Debug, Clone)]
pub struct TorrentFileEntry {
    pub path: PathBuf,
    pub length: u64,
}

/// A sub-range of a single piece, the unit requested over the wire.
///
/// Always contained within one piece; crossing into the next piece is a
/// construction error, not a runtime case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockSpan {
    pub piece: PieceIndex,
    pub offset: u32,
    pub length: u32,
}

/// Immutable layout of a torrent's content.
///
/// Owns the piece geometry, the ordered file list, and the recorded SHA-1
/// digest per piece. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct TorrentLayout {
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub files: Vec<TorrentFileEntry>,
    pub piece_hashes: Vec<[u8; 20]>,
    pub info_hash: InfoHash,
}

impl TorrentLayout {
    /// Validates and builds a layout from parsed metadata.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidMetainfo` - Zero piece length, file lengths
    ///   not summing to the total, or a piece-hash count that does not match
    ///   the geometry. All fatal at startup, before any component spawns.
    pub fn new(
        name: String,
        piece_length: u32,
        files: Vec<TorrentFileEntry>,
        piece_hashes: Vec<[u8; 20]>,
        info_hash: InfoHash,
    ) -> Result<Self, TorrentError> {
        if piece_length == 0 {
            return Err(TorrentError::InvalidMetainfo {
                reason: "piece length is zero".to_string(),
            });
        }
        if files.is_empty() {
            return Err(TorrentError::InvalidMetainfo {
                reason: "torrent declares no files".to_string(),
            });
        }

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let expected_pieces = total_length.div_ceil(piece_length as u64);
        if piece_hashes.len() as u64 != expected_pieces {
            return Err(TorrentError::InvalidMetainfo {
                reason: format!(
                    "expected {expected_pieces} piece hashes for {total_length} bytes, got {}",
                    piece_hashes.len()
                ),
            });
        }

        Ok(Self {
            name,
            piece_length,
            total_length,
            files,
            piece_hashes,
            info_hash,
        })
    }

    /// Convenience constructor for a single-file torrent named after itself.
    pub fn single_file(
        name: String,
        piece_length: u32,
        length: u64,
        piece_hashes: Vec<[u8; 20]>,
        info_hash: InfoHash,
    ) -> Result<Self, TorrentError> {
        let file = TorrentFileEntry {
            path: PathBuf::from(&name),
            length,
        };
        Self::new(name, piece_length, vec![file], piece_hashes, info_hash)
    }

    /// Returns the number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Returns the content size of a piece (the final piece may be short).
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        let start = self.piece_offset(index);
        if start >= self.total_length {
            return 0;
        }
        (self.total_length - start).min(self.piece_length as u64) as u32
    }

    /// Returns the absolute byte offset where a piece begins.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index.as_u32() as u64 * self.piece_length as u64
    }

    /// Splits a piece into block-sized request spans.
    ///
    /// The final block of the piece may be short, mirroring the final piece
    /// of the torrent.
    pub fn blocks(&self, index: PieceIndex, block_size: u32) -> Vec<BlockSpan> {
        let piece_size = self.piece_size(index);
        let mut spans = Vec::new();
        let mut offset = 0u32;
        while offset < piece_size {
            let length = block_size.min(piece_size - offset);
            spans.push(BlockSpan {
                piece: index,
                offset,
                length,
            });
            offset += length;
        }
        spans
    }

    /// Checks piece bytes against the recorded SHA-1 digest.
    ///
    /// Returns false for an out-of-range index rather than panicking, so a
    /// hostile piece index from a peer degrades to a rejected piece.
    pub fn piece_hash_matches(&self, index: PieceIndex, bytes: &[u8]) -> bool {
        let Some(expected) = self.piece_hashes.get(index.as_u32() as usize) else {
            return false;
        };
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        hasher.finalize().as_slice() == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        hasher.finalize().into()
    }

    fn two_file_layout() -> TorrentLayout {
        // 32 bytes across two files, two 16-byte pieces.
        let files = vec![
            TorrentFileEntry {
                path: PathBuf::from("a.bin"),
                length: 10,
            },
            TorrentFileEntry {
                path: PathBuf::from("b.bin"),
                length: 22,
            },
        ];
        let hashes = vec![hash_of(&[0u8; 16]), hash_of(&[0u8; 16])];
        TorrentLayout::new(
            "two-files".to_string(),
            16,
            files,
            hashes,
            InfoHash::new([7u8; 20]),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_zero_piece_length() {
        let result = TorrentLayout::single_file(
            "x".to_string(),
            0,
            10,
            vec![],
            InfoHash::new([0u8; 20]),
        );
        assert!(matches!(
            result,
            Err(TorrentError::InvalidMetainfo { .. })
        ));
    }

    #[test]
    fn test_rejects_hash_count_mismatch() {
        let result = TorrentLayout::single_file(
            "x".to_string(),
            16,
            40,
            vec![[0u8; 20]; 2], // 40 bytes over 16-byte pieces needs 3 hashes
            InfoHash::new([0u8; 20]),
        );
        assert!(matches!(
            result,
            Err(TorrentError::InvalidMetainfo { .. })
        ));
    }

    #[test]
    fn test_final_piece_is_short() {
        let layout = TorrentLayout::single_file(
            "x".to_string(),
            16,
            40,
            vec![[0u8; 20]; 3],
            InfoHash::new([0u8; 20]),
        )
        .unwrap();
        assert_eq!(layout.piece_count(), 3);
        assert_eq!(layout.piece_size(PieceIndex::new(0)), 16);
        assert_eq!(layout.piece_size(PieceIndex::new(1)), 16);
        assert_eq!(layout.piece_size(PieceIndex::new(2)), 8);
        assert_eq!(layout.piece_size(PieceIndex::new(3)), 0);
    }

    #[test]
    fn test_blocks_split_with_short_tail() {
        let layout = two_file_layout();
        let spans = layout.blocks(PieceIndex::new(0), 6);
        assert_eq!(
            spans,
            vec![
                BlockSpan {
                    piece: PieceIndex::new(0),
                    offset: 0,
                    length: 6
                },
                BlockSpan {
                    piece: PieceIndex::new(0),
                    offset: 6,
                    length: 6
                },
                BlockSpan {
                    piece: PieceIndex::new(0),
                    offset: 12,
                    length: 4
                },
            ]
        );
    }

    #[test]
    fn test_piece_hash_matches_detects_corruption() {
        let layout = two_file_layout();
        let good = [0u8; 16];
        assert!(layout.piece_hash_matches(PieceIndex::new(0), &good));

        let mut corrupt = good;
        corrupt[7] ^= 0x01;
        assert!(!layout.piece_hash_matches(PieceIndex::new(0), &corrupt));

        // Out-of-range index is a mismatch, not a panic.
        assert!(!layout.piece_hash_matches(PieceIndex::new(9), &good));
    }
}
