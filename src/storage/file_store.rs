//! File-backed piece store.
//!
//! Owns one handle per declared file and maps piece/block offsets onto
//! file spans, so a piece that straddles a file boundary is scattered and
//! gathered transparently. I/O against the same file is serialized by a
//! per-file lock; different files proceed in parallel.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{PieceStore, StorageError};
use crate::torrent::{BlockSpan, PieceIndex, TorrentLayout};

struct BackingFile {
    length: u64,
    handle: Mutex<File>,
}

/// A contiguous run of bytes inside one backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSpan {
    file: usize,
    offset: u64,
    length: u64,
}

/// Piece store over the torrent's declared file tree.
///
/// Single-file mode opens one file named after the torrent directly under
/// the root; multi-file mode creates a torrent-named directory holding the
/// declared subtree. Files are created empty up front, so partial content
/// before completion is expected and valid.
pub struct FileStore {
    layout: Arc<TorrentLayout>,
    files: Vec<BackingFile>,
}

impl FileStore {
    /// Opens or creates every backing file under the given root directory.
    ///
    /// Failure here is an unrecoverable setup error and aborts session
    /// startup.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Directory or file creation failed
    pub async fn open(root: &Path, layout: Arc<TorrentLayout>) -> Result<Self, StorageError> {
        let base: PathBuf = if layout.files.len() == 1 {
            root.to_path_buf()
        } else {
            root.join(&layout.name)
        };

        let mut files = Vec::with_capacity(layout.files.len());
        for entry in &layout.files {
            let path = base.join(&entry.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await?;
            tracing::debug!("Opened backing file {} ({} bytes)", path.display(), entry.length);
            files.push(BackingFile {
                length: entry.length,
                handle: Mutex::new(handle),
            });
        }

        Ok(Self { layout, files })
    }

    /// Maps an absolute content range onto per-file spans.
    ///
    /// Walks the file list consuming each file's remaining length until the
    /// range is exhausted. A range extending past the final file is out of
    /// range for the caller's span.
    fn file_spans(&self, start: u64, length: u64) -> Option<Vec<FileSpan>> {
        let mut offset = start;
        let mut remaining = length;
        let mut spans = Vec::new();

        for (index, file) in self.files.iter().enumerate() {
            if offset >= file.length {
                offset -= file.length;
                continue;
            }
            let take = remaining.min(file.length - offset);
            spans.push(FileSpan {
                file: index,
                offset,
                length: take,
            });
            remaining -= take;
            offset = 0;
            if remaining == 0 {
                break;
            }
        }

        if remaining > 0 { None } else { Some(spans) }
    }

    /// Reads as many bytes of the range as the files currently hold.
    ///
    /// Returns the number of bytes actually read into `buf`; short data is
    /// not an error so the verification pass can tolerate files that are
    /// still empty or shorter than declared.
    async fn read_available(&self, start: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let Some(spans) = self.file_spans(start, buf.len() as u64) else {
            return Ok(0);
        };

        let mut total = 0usize;
        for span in spans {
            let chunk = &mut buf[total..total + span.length as usize];
            let mut handle = self.files[span.file].handle.lock().await;
            handle.seek(SeekFrom::Start(span.offset)).await?;

            let mut filled = 0usize;
            while filled < chunk.len() {
                let n = handle.read(&mut chunk[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            total += filled;
            if filled < chunk.len() {
                break;
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl PieceStore for FileStore {
    async fn verify_all(&self) -> Result<Vec<bool>, StorageError> {
        tracing::info!(
            "Verifying {} pieces across {} file(s)",
            self.layout.piece_count(),
            self.files.len()
        );

        let mut buf = vec![0u8; self.layout.piece_length as usize];
        let mut finished = Vec::with_capacity(self.layout.piece_count() as usize);

        for index in 0..self.layout.piece_count() {
            let index = PieceIndex::new(index);
            let size = self.layout.piece_size(index) as usize;
            let read = self
                .read_available(self.layout.piece_offset(index), &mut buf[..size])
                .await?;
            let ok = read == size && self.layout.piece_hash_matches(index, &buf[..size]);
            finished.push(ok);
        }

        let have = finished.iter().filter(|ok| **ok).count();
        tracing::info!("Verification complete: {have}/{} pieces on disk", finished.len());
        Ok(finished)
    }

    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError> {
        let expected = self.layout.piece_size(index);
        if data.len() != expected as usize {
            return Err(StorageError::WrongPieceSize {
                index,
                actual: data.len(),
                expected,
            });
        }

        let start = self.layout.piece_offset(index);
        let spans = self
            .file_spans(start, data.len() as u64)
            .ok_or(StorageError::OutOfRange {
                piece: index,
                offset: 0,
                length: expected,
            })?;

        let mut written = 0usize;
        for span in spans {
            let chunk = &data[written..written + span.length as usize];
            let mut handle = self.files[span.file].handle.lock().await;
            handle.seek(SeekFrom::Start(span.offset)).await?;
            handle.write_all(chunk).await?;
            handle.flush().await?;
            written += chunk.len();
            tracing::trace!(
                "Wrote {} bytes of piece {index} to file {} at offset {}",
                chunk.len(),
                span.file,
                span.offset
            );
        }
        Ok(())
    }

    async fn read_block(&self, span: BlockSpan) -> Result<Bytes, StorageError> {
        let piece_size = self.layout.piece_size(span.piece);
        let end = span.offset as u64 + span.length as u64;
        if end > piece_size as u64 {
            return Err(StorageError::OutOfRange {
                piece: span.piece,
                offset: span.offset,
                length: span.length,
            });
        }

        let start = self.layout.piece_offset(span.piece) + span.offset as u64;
        let mut buf = vec![0u8; span.length as usize];
        let read = self.read_available(start, &mut buf).await?;
        if read != buf.len() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("block {:?} short read: {read} of {}", span, buf.len()),
            )));
        }
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use sha1::{Digest, Sha1};
    use tempfile::tempdir;

    use super::*;
    use crate::torrent::{InfoHash, TorrentFileEntry};

    fn hash_of(bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        hasher.finalize().into()
    }

    /// Piece length 16 over files of 10 and 22 bytes: piece 0 straddles the
    /// file boundary.
    fn straddling_layout(content: &[u8; 32]) -> Arc<TorrentLayout> {
        let files = vec![
            TorrentFileEntry {
                path: PathBuf::from("a.bin"),
                length: 10,
            },
            TorrentFileEntry {
                path: PathBuf::from("sub").join("b.bin"),
                length: 22,
            },
        ];
        let hashes = vec![hash_of(&content[..16]), hash_of(&content[16..])];
        Arc::new(
            TorrentLayout::new(
                "straddle".to_string(),
                16,
                files,
                hashes,
                InfoHash::new([1u8; 20]),
            )
            .unwrap(),
        )
    }

    fn test_content() -> [u8; 32] {
        let mut content = [0u8; 32];
        for (i, byte) in content.iter_mut().enumerate() {
            *byte = i as u8;
        }
        content
    }

    #[tokio::test]
    async fn test_write_then_read_across_file_boundary() {
        let dir = tempdir().unwrap();
        let content = test_content();
        let layout = straddling_layout(&content);
        let store = FileStore::open(dir.path(), layout.clone()).await.unwrap();

        store
            .write_piece(PieceIndex::new(0), &content[..16])
            .await
            .unwrap();

        // Bytes [0:10) land in file a, [10:16) in file b.
        let file_a = std::fs::read(dir.path().join("straddle").join("a.bin")).unwrap();
        assert_eq!(&file_a[..], &content[..10]);
        let file_b = std::fs::read(dir.path().join("straddle").join("sub").join("b.bin")).unwrap();
        assert_eq!(&file_b[..6], &content[10..16]);

        let block = store
            .read_block(BlockSpan {
                piece: PieceIndex::new(0),
                offset: 4,
                length: 12,
            })
            .await
            .unwrap();
        assert_eq!(&block[..], &content[4..16]);
    }

    #[tokio::test]
    async fn test_verify_all_on_empty_files_is_all_false() {
        let dir = tempdir().unwrap();
        let layout = straddling_layout(&test_content());
        let store = FileStore::open(dir.path(), layout).await.unwrap();

        let finished = store.verify_all().await.unwrap();
        assert_eq!(finished, vec![false, false]);
    }

    #[tokio::test]
    async fn test_verify_all_is_idempotent() {
        let dir = tempdir().unwrap();
        let content = test_content();
        let layout = straddling_layout(&content);
        let store = FileStore::open(dir.path(), layout).await.unwrap();

        store
            .write_piece(PieceIndex::new(0), &content[..16])
            .await
            .unwrap();

        let first = store.verify_all().await.unwrap();
        let second = store.verify_all().await.unwrap();
        assert_eq!(first, vec![true, false]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_verify_detects_short_final_piece() {
        // 24 bytes over 16-byte pieces: final piece is 8 bytes and still
        // hash-checked.
        let dir = tempdir().unwrap();
        let content: Vec<u8> = (0..24u8).collect();
        let hashes = vec![hash_of(&content[..16]), hash_of(&content[16..])];
        let layout = Arc::new(
            TorrentLayout::single_file(
                "short.bin".to_string(),
                16,
                24,
                hashes,
                InfoHash::new([2u8; 20]),
            )
            .unwrap(),
        );
        let store = FileStore::open(dir.path(), layout).await.unwrap();

        store.write_piece(PieceIndex::new(0), &content[..16]).await.unwrap();
        store.write_piece(PieceIndex::new(1), &content[16..]).await.unwrap();

        let finished = store.verify_all().await.unwrap();
        assert_eq!(finished, vec![true, true]);
    }

    #[tokio::test]
    async fn test_read_block_out_of_range_fails_cleanly() {
        let dir = tempdir().unwrap();
        let layout = straddling_layout(&test_content());
        let store = FileStore::open(dir.path(), layout).await.unwrap();

        let result = store
            .read_block(BlockSpan {
                piece: PieceIndex::new(1),
                offset: 12,
                length: 8,
            })
            .await;
        assert!(matches!(result, Err(StorageError::OutOfRange { .. })));
    }

    #[tokio::test]
    async fn test_write_rejects_wrong_piece_size() {
        let dir = tempdir().unwrap();
        let layout = straddling_layout(&test_content());
        let store = FileStore::open(dir.path(), layout).await.unwrap();

        let result = store.write_piece(PieceIndex::new(0), &[0u8; 4]).await;
        assert!(matches!(result, Err(StorageError::WrongPieceSize { .. })));
    }

    #[tokio::test]
    async fn test_single_file_mode_creates_file_named_after_torrent() {
        let dir = tempdir().unwrap();
        let layout = Arc::new(
            TorrentLayout::single_file(
                "solo.bin".to_string(),
                16,
                16,
                vec![hash_of(&[9u8; 16])],
                InfoHash::new([3u8; 20]),
            )
            .unwrap(),
        );
        let store = FileStore::open(dir.path(), layout).await.unwrap();
        store.write_piece(PieceIndex::new(0), &[9u8; 16]).await.unwrap();

        let on_disk = std::fs::read(dir.path().join("solo.bin")).unwrap();
        assert_eq!(on_disk, vec![9u8; 16]);
    }
}
