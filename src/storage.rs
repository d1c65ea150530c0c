//! Storage sink for verified pieces
//!
//! The core hands every verified piece to a [`PieceSink`] exactly once.
//! Durable placement is the sink's problem; [`FileSink`] covers the
//! single-file case and [`MemorySink`] backs tests.

use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece index {0} out of range")]
    PieceOutOfRange(u32),
}

/// Destination for verified piece data.
///
/// The caller guarantees that `write_piece` is invoked at most once per
/// piece index, and only after the piece's SHA-1 digest has been checked.
#[async_trait]
pub trait PieceSink: Send + Sync {
    async fn write_piece(&self, piece: u32, data: Bytes) -> Result<(), StorageError>;
}

/// Writes pieces into a single file at `piece * piece_length`.
pub struct FileSink {
    file: TokioMutex<File>,
    piece_length: u64,
    piece_count: u32,
}

impl FileSink {
    /// Creates (or truncates) the destination file.
    pub async fn create(
        path: impl AsRef<Path>,
        piece_length: u64,
        piece_count: u32,
    ) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;

        Ok(Self {
            file: TokioMutex::new(file),
            piece_length,
            piece_count,
        })
    }
}

#[async_trait]
impl PieceSink for FileSink {
    async fn write_piece(&self, piece: u32, data: Bytes) -> Result<(), StorageError> {
        if piece >= self.piece_count {
            return Err(StorageError::PieceOutOfRange(piece));
        }

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(piece as u64 * self.piece_length))
            .await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Collects pieces in memory. Intended for tests.
#[derive(Default)]
pub struct MemorySink {
    writes: Mutex<Vec<(u32, Bytes)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every `(piece, data)` write in arrival order.
    pub fn writes(&self) -> Vec<(u32, Bytes)> {
        self.writes.lock().clone()
    }

    /// Reassembles the written pieces in index order.
    pub fn assembled(&self) -> Vec<u8> {
        let mut writes = self.writes.lock().clone();
        writes.sort_by_key(|(piece, _)| *piece);
        writes.iter().flat_map(|(_, data)| data.to_vec()).collect()
    }
}

#[async_trait]
impl PieceSink for MemorySink {
    async fn write_piece(&self, piece: u32, data: Bytes) -> Result<(), StorageError> {
        self.writes.lock().push((piece, data));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_sink_places_pieces_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let sink = FileSink::create(&path, 4, 3).await.unwrap();
        sink.write_piece(2, Bytes::from_static(b"cccc"))
            .await
            .unwrap();
        sink.write_piece(0, Bytes::from_static(b"aaaa"))
            .await
            .unwrap();
        sink.write_piece(1, Bytes::from_static(b"bbbb"))
            .await
            .unwrap();

        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, b"aaaabbbbcccc");
    }

    #[tokio::test]
    async fn test_file_sink_rejects_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::create(dir.path().join("out.bin"), 4, 1)
            .await
            .unwrap();

        let result = sink.write_piece(1, Bytes::from_static(b"xxxx")).await;
        assert!(matches!(result, Err(StorageError::PieceOutOfRange(1))));
    }

    #[tokio::test]
    async fn test_memory_sink_assembles_in_index_order() {
        let sink = MemorySink::new();
        sink.write_piece(1, Bytes::from_static(b"world"))
            .await
            .unwrap();
        sink.write_piece(0, Bytes::from_static(b"hello "))
            .await
            .unwrap();

        assert_eq!(sink.writes().len(), 2);
        assert_eq!(sink.assembled(), b"hello world");
    }
}
