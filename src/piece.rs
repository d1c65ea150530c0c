//! Piece and block bookkeeping
//!
//! This module owns the download state: which blocks are outstanding, which
//! pieces are assembled, and SHA-1 verification of completed pieces.

mod manager;

pub use manager::{BlockOutcome, PieceError, PieceManager, PieceStatus};

use bytes::Bytes;

/// Standard transfer block size (16 KiB).
pub const BLOCK_SIZE: u32 = 16384;

/// A request for one block of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }
}

/// A block of raw piece data received from a peer.
#[derive(Debug, Clone)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub data: Bytes,
}

impl Block {
    pub fn new(piece: u32, offset: u32, data: Bytes) -> Self {
        Self {
            piece,
            offset,
            data,
        }
    }
}
