use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use super::transport::PeerTransport;
use crate::config::SessionConfig;
use crate::piece::{Block, BlockOutcome, BlockRequest, PieceError, PieceManager};
use crate::session::SessionEvent;

/// The connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// TCP connection in progress.
    Connecting,
    /// Connected, performing the BitTorrent handshake.
    Handshaking,
    /// Handshake verified, message loop running.
    Live,
    /// Connection has been closed.
    Closed,
}

/// A connection to one BitTorrent peer.
///
/// Owns the TCP socket and all per-peer protocol state: the remote
/// bitfield, choke/interest flags, and the set of block requests in
/// flight. [`PeerConnection::connect`] takes the connection through
/// `Connecting` and `Handshaking`; [`PeerConnection::run`] is the `Live`
/// message loop, which pulls block assignments from the shared
/// [`PieceManager`] and keeps at most `request_pipeline_depth` requests
/// outstanding.
pub struct PeerConnection {
    /// The peer's socket address.
    pub addr: SocketAddr,
    /// Current connection state.
    pub state: PeerState,
    /// The peer's ID as returned in its handshake.
    pub peer_id: PeerId,
    transport: PeerTransport,
    bitfield: Bitfield,
    am_interested: bool,
    peer_choking: bool,
    in_flight: Vec<BlockRequest>,
    last_received: Instant,
}

impl PeerConnection {
    /// Dials the peer and performs the handshake.
    ///
    /// The connect timeout bounds both the TCP connect and the handshake
    /// exchange. A handshake whose info hash differs from ours is a hard
    /// rejection; no wire messages are exchanged past it.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        piece_count: usize,
        config: &SessionConfig,
    ) -> Result<Self, PeerError> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        let mut transport = PeerTransport::new(stream);

        let handshake = Handshake::new(info_hash, our_peer_id);
        transport.send_handshake(&handshake).await?;

        let their_handshake = timeout(config.connect_timeout, transport.receive_handshake())
            .await
            .map_err(|_| PeerError::Timeout)??;

        if their_handshake.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }

        Ok(Self {
            addr,
            state: PeerState::Live,
            peer_id: PeerId(their_handshake.peer_id),
            transport,
            bitfield: Bitfield::new(piece_count),
            am_interested: false,
            peer_choking: true,
            in_flight: Vec::new(),
            last_received: Instant::now(),
        })
    }

    /// Number of block requests currently in flight.
    pub fn outstanding_requests(&self) -> usize {
        self.in_flight.len()
    }

    /// Runs the message loop until the download completes, the shutdown
    /// signal fires, or the connection fails.
    ///
    /// Every exit path releases the in-flight assignments back to the
    /// manager, so a dying peer never strands a block.
    pub async fn run(
        mut self,
        manager: Arc<PieceManager>,
        events: mpsc::Sender<SessionEvent>,
        mut shutdown: watch::Receiver<bool>,
        config: SessionConfig,
    ) -> Result<(), PeerError> {
        let result = self.drive(&manager, &events, &mut shutdown, &config).await;

        self.state = PeerState::Closed;
        for request in self.in_flight.drain(..) {
            manager.release(&request);
        }

        result
    }

    async fn drive(
        &mut self,
        manager: &PieceManager,
        events: &mpsc::Sender<SessionEvent>,
        shutdown: &mut watch::Receiver<bool>,
        config: &SessionConfig,
    ) -> Result<(), PeerError> {
        loop {
            let received = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                received = timeout(config.keep_alive_interval, self.transport.receive_message()) => received,
            };

            // Outgoing writes also race the shutdown watch, so a peer
            // with a wedged receive buffer cannot hold up teardown.
            match received {
                // Nothing received for a keep-alive interval. Dead if the
                // longer idle deadline has also passed.
                Err(_) => {
                    if self.last_received.elapsed() >= config.idle_timeout {
                        return Err(PeerError::Timeout);
                    }
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        sent = self.transport.send_message(&Message::KeepAlive) => sent?,
                    }
                }
                Ok(Ok(message)) => {
                    self.last_received = Instant::now();
                    let done = tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        done = self.handle_message(message, manager, events, config) => done?,
                    };
                    if done {
                        return Ok(());
                    }
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Processes one incoming message. Returns `Ok(true)` once the whole
    /// download is complete.
    async fn handle_message(
        &mut self,
        message: Message,
        manager: &PieceManager,
        events: &mpsc::Sender<SessionEvent>,
        config: &SessionConfig,
    ) -> Result<bool, PeerError> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                // The peer will not answer what is in flight; hand the
                // blocks back so other connections can pick them up.
                for request in self.in_flight.drain(..) {
                    manager.release(&request);
                }
            }
            Message::Unchoke => {
                self.peer_choking = false;
                self.update_interest(manager).await?;
                self.fill_pipeline(manager, config).await?;
            }
            Message::Interested | Message::NotInterested => {}
            Message::Have { piece } => {
                self.bitfield.set(piece as usize);
                self.update_interest(manager).await?;
                if !self.peer_choking {
                    self.fill_pipeline(manager, config).await?;
                }
            }
            Message::Bitfield(bits) => {
                self.bitfield = Bitfield::from_bytes(bits, self.bitfield.piece_count());
                self.update_interest(manager).await?;
                // The remote may have unchoked us before announcing its
                // pieces; requests must start either way.
                if !self.peer_choking {
                    self.fill_pipeline(manager, config).await?;
                }
            }
            Message::Request { index, begin, .. } | Message::Cancel { index, begin, .. } => {
                trace!(peer = %self.addr, index, begin, "ignoring upload-side message");
            }
            Message::Piece { index, begin, data } => {
                let position = self
                    .in_flight
                    .iter()
                    .position(|r| r.piece == index && r.offset == begin);

                let Some(position) = position else {
                    debug!(peer = %self.addr, index, begin, "dropping unsolicited block");
                    return Ok(false);
                };
                self.in_flight.swap_remove(position);

                match manager.submit_block(Block::new(index, begin, data)).await {
                    Ok(BlockOutcome::PieceVerified(piece)) => {
                        let _ = events
                            .send(SessionEvent::PieceVerified {
                                piece,
                                verified: manager.verified_count(),
                                total: manager.piece_count(),
                            })
                            .await;
                        if manager.is_complete() {
                            return Ok(true);
                        }
                    }
                    Ok(_) => {}
                    Err(PieceError::HashMismatch { piece }) => {
                        let _ = events
                            .send(SessionEvent::PieceFailed {
                                piece,
                                addr: self.addr,
                            })
                            .await;
                    }
                    Err(PieceError::Storage(e)) => {
                        warn!(piece = index, error = %e, "storage sink rejected verified piece");
                        let _ = events.send(SessionEvent::StorageFailed { piece: index }).await;
                    }
                    // Bad geometry means the peer is violating the
                    // protocol; close the connection.
                    Err(e) => return Err(PeerError::InvalidMessage(e.to_string())),
                }

                if !self.peer_choking {
                    self.fill_pipeline(manager, config).await?;
                }
            }
        }

        Ok(false)
    }

    async fn update_interest(&mut self, manager: &PieceManager) -> Result<(), PeerError> {
        if !self.am_interested && manager.needs_any(&self.bitfield) {
            self.transport.send_message(&Message::Interested).await?;
            self.am_interested = true;
        }
        Ok(())
    }

    /// Tops the request pipeline up to the configured depth.
    async fn fill_pipeline(
        &mut self,
        manager: &PieceManager,
        config: &SessionConfig,
    ) -> Result<(), PeerError> {
        while self.in_flight.len() < config.request_pipeline_depth {
            let Some(request) = manager.assign_block(&self.bitfield) else {
                break;
            };

            // Track before sending so a failed send still releases the
            // assignment on teardown.
            self.in_flight.push(request);
            self.transport
                .send_message(&Message::Request {
                    index: request.piece,
                    begin: request.offset,
                    length: request.length,
                })
                .await?;
        }
        Ok(())
    }
}
