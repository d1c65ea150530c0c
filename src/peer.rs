//! Peer wire protocol (BEP-3)
//!
//! This module implements the base BitTorrent peer wire protocol: the
//! 68-byte handshake, length-prefixed message framing, and the per-peer
//! connection state machine that downloads blocks.

mod bitfield;
mod connection;
mod error;
mod message;
mod peer_id;
mod transport;

pub use bitfield::Bitfield;
pub use connection::{PeerConnection, PeerState};
pub use error::PeerError;
pub use message::{Handshake, Message, MessageId};
pub use peer_id::PeerId;
pub use transport::PeerTransport;

#[cfg(test)]
mod tests;
