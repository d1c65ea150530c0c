//! brine - a BitTorrent download client core
//!
//! This library implements the downloading half of the BitTorrent protocol:
//! peer discovery through a UDP tracker (BEP-15), the peer wire protocol
//! (BEP-3), and piece-level orchestration that assembles a verified file
//! from untrusted peer data.
//!
//! # Modules
//!
//! - [`metadata`] - Torrent metadata input value (info hash, piece hashes, geometry)
//! - [`config`] - Session tuning knobs (connection cap, pipeline depth, timeouts)
//! - [`tracker`] - BEP-15 UDP tracker client
//! - [`peer`] - BEP-3 peer wire protocol and per-peer connection state machine
//! - [`piece`] - Block bookkeeping, selection, and SHA-1 piece verification
//! - [`storage`] - Sink interface for verified pieces plus file/memory sinks
//! - [`session`] - The orchestrator driving a download to completion

pub mod config;
pub mod metadata;
pub mod peer;
pub mod piece;
pub mod session;
pub mod storage;
pub mod tracker;

pub use config::{RetryPolicy, SessionConfig};
pub use metadata::{MetadataError, TorrentMetadata};
pub use peer::{Bitfield, Handshake, Message, PeerConnection, PeerError, PeerId, PeerState};
pub use piece::{Block, BlockOutcome, BlockRequest, PieceError, PieceManager, PieceStatus};
pub use session::{Session, SessionError, SessionEvent};
pub use storage::{FileSink, MemorySink, PieceSink, StorageError};
pub use tracker::{AnnounceResponse, TrackerError, TrackerEvent, UdpTracker};
