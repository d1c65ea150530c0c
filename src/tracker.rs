//! Tracker protocol (BEP-15)
//!
//! This module implements the UDP tracker protocol for peer discovery:
//! the connect/announce exchange, transaction-id matching, and the
//! exponential-backoff retransmit schedule.

mod error;
mod response;
mod udp;

pub use error::TrackerError;
pub use response::{parse_compact_peers, AnnounceResponse, TrackerEvent};
pub use udp::UdpTracker;
