use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, warn};

use super::{Block, BlockRequest, BLOCK_SIZE};
use crate::metadata::TorrentMetadata;
use crate::peer::Bitfield;
use crate::storage::{PieceSink, StorageError};

/// Errors from submitting a block to the [`PieceManager`].
#[derive(Debug, Error)]
pub enum PieceError {
    /// The assembled piece's SHA-1 digest did not match the metadata. The
    /// piece has been reset and will be re-requested.
    #[error("piece {piece} failed hash verification")]
    HashMismatch { piece: u32 },

    #[error("block out of bounds: piece {piece}, offset {offset}")]
    BlockOutOfBounds { piece: u32, offset: u32 },

    #[error("bad block length for piece {piece}, offset {offset}: {length}")]
    BadBlockLength { piece: u32, offset: u32, length: u32 },

    /// The sink rejected a verified piece. The piece stays verified; the
    /// data was good, the destination was not.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Lifecycle of a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Missing,
    InProgress,
    Verifying,
    Verified,
}

/// Result of a successful block submission.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Block stored; the piece is still incomplete.
    Accepted,
    /// Duplicate or unsolicited block; dropped.
    Ignored,
    /// The block completed its piece, the digest matched, and the piece was
    /// handed to the storage sink.
    PieceVerified(u32),
}

struct PieceSlot {
    status: PieceStatus,
    requested: Vec<bool>,
    received: Vec<bool>,
    buf: Option<Vec<u8>>,
}

impl PieceSlot {
    fn new(block_count: u32) -> Self {
        Self {
            status: PieceStatus::Missing,
            requested: vec![false; block_count as usize],
            received: vec![false; block_count as usize],
            buf: None,
        }
    }

    fn reset(&mut self) {
        self.status = PieceStatus::Missing;
        self.requested.fill(false);
        self.received.fill(false);
        self.buf = None;
    }
}

/// Shared authority over what remains to be downloaded.
///
/// All mutation goes through a single mutex, so no two connections can mark
/// the same block assigned. Verification is piece-granular: a block is never
/// trusted individually, only as part of a piece whose SHA-1 digest matches
/// the metadata. Verified bytes are handed to the [`PieceSink`] exactly once
/// per index, after the lock is released.
pub struct PieceManager {
    metadata: TorrentMetadata,
    sink: Arc<dyn PieceSink>,
    table: Mutex<Vec<PieceSlot>>,
}

impl PieceManager {
    pub fn new(metadata: TorrentMetadata, sink: Arc<dyn PieceSink>) -> Self {
        let table = (0..metadata.piece_count() as u32)
            .map(|index| PieceSlot::new(metadata.block_count(index)))
            .collect();

        Self {
            metadata,
            sink,
            table: Mutex::new(table),
        }
    }

    /// Picks the next block to request from a peer owning `peer_has`.
    ///
    /// Selection is lowest piece index first, lowest offset within the
    /// piece; the chosen block is marked outstanding so no other connection
    /// is handed the same `(piece, offset)`. Returns `None` when the peer
    /// has nothing we still need unrequested.
    pub fn assign_block(&self, peer_has: &Bitfield) -> Option<BlockRequest> {
        let mut table = self.table.lock();

        for (index, slot) in table.iter_mut().enumerate() {
            let piece = index as u32;
            if slot.status == PieceStatus::Verified || slot.status == PieceStatus::Verifying {
                continue;
            }
            if !peer_has.has(index) {
                continue;
            }

            for block in 0..slot.requested.len() {
                if slot.requested[block] || slot.received[block] {
                    continue;
                }

                slot.requested[block] = true;
                slot.status = PieceStatus::InProgress;

                let offset = block as u32 * BLOCK_SIZE;
                return Some(BlockRequest::new(
                    piece,
                    offset,
                    self.metadata.block_size(piece, offset),
                ));
            }
        }

        None
    }

    /// Returns an unfulfilled assignment to the pool.
    ///
    /// Called when a connection dies or is choked with requests in flight;
    /// the block becomes eligible for assignment to any peer again.
    pub fn release(&self, request: &BlockRequest) {
        let mut table = self.table.lock();

        let Some(slot) = table.get_mut(request.piece as usize) else {
            return;
        };
        let block = (request.offset / BLOCK_SIZE) as usize;
        let Some(received) = slot.received.get(block).copied() else {
            return;
        };

        if !received && slot.status == PieceStatus::InProgress {
            slot.requested[block] = false;
            if !slot.requested.iter().any(|&r| r) && !slot.received.iter().any(|&r| r) {
                slot.status = PieceStatus::Missing;
            }
        }
    }

    /// Stores a block received from a peer.
    ///
    /// When the last block of a piece lands, the piece is verified against
    /// its recorded hash: a match hands the bytes to the sink and yields
    /// [`BlockOutcome::PieceVerified`]; a mismatch discards every block of
    /// the piece, resets it to missing, and returns
    /// [`PieceError::HashMismatch`].
    pub async fn submit_block(&self, block: Block) -> Result<BlockOutcome, PieceError> {
        let piece = block.piece;
        let verified = {
            let mut table = self.table.lock();

            let slot = table
                .get_mut(piece as usize)
                .ok_or(PieceError::BlockOutOfBounds {
                    piece,
                    offset: block.offset,
                })?;

            if block.offset % BLOCK_SIZE != 0 {
                return Err(PieceError::BlockOutOfBounds {
                    piece,
                    offset: block.offset,
                });
            }
            let index = (block.offset / BLOCK_SIZE) as usize;
            if index >= slot.received.len() {
                return Err(PieceError::BlockOutOfBounds {
                    piece,
                    offset: block.offset,
                });
            }
            let expected = self.metadata.block_size(piece, block.offset);
            if block.data.len() as u32 != expected {
                return Err(PieceError::BadBlockLength {
                    piece,
                    offset: block.offset,
                    length: block.data.len() as u32,
                });
            }

            if slot.status == PieceStatus::Verified
                || slot.status == PieceStatus::Verifying
                || slot.received[index]
            {
                return Ok(BlockOutcome::Ignored);
            }

            let piece_size = self.metadata.piece_size(piece) as usize;
            {
                let buf = slot.buf.get_or_insert_with(|| vec![0u8; piece_size]);
                let start = block.offset as usize;
                buf[start..start + block.data.len()].copy_from_slice(&block.data);
            }
            slot.received[index] = true;
            slot.requested[index] = true;

            if !slot.received.iter().all(|&r| r) {
                return Ok(BlockOutcome::Accepted);
            }

            slot.status = PieceStatus::Verifying;
            let buf = slot.buf.take().unwrap_or_default();
            let digest: [u8; 20] = Sha1::digest(&buf).into();

            if digest != self.metadata.piece_hashes[piece as usize] {
                warn!(piece, "piece failed verification, discarding blocks");
                slot.reset();
                return Err(PieceError::HashMismatch { piece });
            }

            slot.status = PieceStatus::Verified;
            Bytes::from(buf)
        };

        debug!(piece, "piece verified");
        self.sink.write_piece(piece, verified).await?;
        Ok(BlockOutcome::PieceVerified(piece))
    }

    /// Returns the status of the piece at `index`.
    pub fn status(&self, index: u32) -> Option<PieceStatus> {
        self.table.lock().get(index as usize).map(|s| s.status)
    }

    /// True once every piece is verified.
    pub fn is_complete(&self) -> bool {
        self.table
            .lock()
            .iter()
            .all(|slot| slot.status == PieceStatus::Verified)
    }

    /// Number of verified pieces.
    pub fn verified_count(&self) -> usize {
        self.table
            .lock()
            .iter()
            .filter(|slot| slot.status == PieceStatus::Verified)
            .count()
    }

    /// Total number of pieces.
    pub fn piece_count(&self) -> usize {
        self.metadata.piece_count()
    }

    /// Bytes not yet covered by a verified piece. Drives the tracker's
    /// `left` counter.
    pub fn bytes_remaining(&self) -> u64 {
        self.table
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.status != PieceStatus::Verified)
            .map(|(index, _)| self.metadata.piece_size(index as u32))
            .sum()
    }

    /// True if the peer owning `peer_has` claims any piece we still need.
    pub fn needs_any(&self, peer_has: &Bitfield) -> bool {
        self.table
            .lock()
            .iter()
            .enumerate()
            .any(|(index, slot)| slot.status != PieceStatus::Verified && peer_has.has(index))
    }
}
