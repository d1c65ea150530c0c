use thiserror::Error;

use crate::piece::BLOCK_SIZE;

/// Errors produced when constructing a [`TorrentMetadata`].
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("piece length must be non-zero")]
    ZeroPieceLength,

    #[error("total length must be non-zero")]
    ZeroTotalLength,

    #[error("expected {expected} piece hashes, got {actual}")]
    PieceHashCount { expected: usize, actual: usize },

    #[error("invalid announce url: {0}")]
    InvalidAnnounce(String),
}

/// Immutable description of a torrent swarm.
///
/// Produced by an external metainfo parser and treated as read-only for the
/// lifetime of a download session. The geometry helpers (`piece_size`,
/// `block_count`, `block_size`) account for the shorter final piece and
/// final block.
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    /// SHA-1 digest of the torrent's info dictionary.
    pub info_hash: [u8; 20],
    /// Nominal piece length in bytes; the last piece may be shorter.
    pub piece_length: u64,
    /// One SHA-1 digest per piece, indexed by piece index.
    pub piece_hashes: Vec<[u8; 20]>,
    /// Total content length in bytes.
    pub total_length: u64,
    /// The tracker announce endpoint, e.g. `udp://tracker.example.org:1337`.
    pub announce: String,
}

impl TorrentMetadata {
    pub fn new(
        info_hash: [u8; 20],
        piece_length: u64,
        piece_hashes: Vec<[u8; 20]>,
        total_length: u64,
        announce: String,
    ) -> Result<Self, MetadataError> {
        if piece_length == 0 {
            return Err(MetadataError::ZeroPieceLength);
        }
        if total_length == 0 {
            return Err(MetadataError::ZeroTotalLength);
        }

        let expected = total_length.div_ceil(piece_length) as usize;
        if piece_hashes.len() != expected {
            return Err(MetadataError::PieceHashCount {
                expected,
                actual: piece_hashes.len(),
            });
        }

        if !announce.starts_with("udp://") {
            return Err(MetadataError::InvalidAnnounce(announce));
        }

        Ok(Self {
            info_hash,
            piece_length,
            piece_hashes,
            total_length,
            announce,
        })
    }

    /// Returns the number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Returns the byte length of the piece at `index`.
    pub fn piece_size(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length;
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(self.piece_length)
    }

    /// Returns the number of blocks in the piece at `index`.
    pub fn block_count(&self, index: u32) -> u32 {
        self.piece_size(index).div_ceil(BLOCK_SIZE as u64) as u32
    }

    /// Returns the byte length of the block at `offset` within piece `index`.
    pub fn block_size(&self, index: u32, offset: u32) -> u32 {
        let remaining = self.piece_size(index).saturating_sub(offset as u64);
        remaining.min(BLOCK_SIZE as u64) as u32
    }
}
