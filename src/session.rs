//! Download session orchestration
//!
//! A [`Session`] drives one torrent to completion: it announces to the
//! tracker, keeps a bounded set of peer connections running against the
//! shared [`PieceManager`], replaces connections as they churn, and shuts
//! everything down once the last piece verifies.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::metadata::TorrentMetadata;
use crate::peer::{PeerConnection, PeerId};
use crate::piece::PieceManager;
use crate::storage::PieceSink;
use crate::tracker::{TrackerError, TrackerEvent, UdpTracker};

/// Terminal session failures.
///
/// Per-peer and per-piece failures never appear here; they are recovered
/// internally and reported as [`SessionEvent`]s.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("tracker returned no peers")]
    NoPeers,

    #[error("all known peers exhausted before completion")]
    PeersExhausted,
}

/// Observable session events.
///
/// Every non-fatal error in the session surfaces here; the consuming
/// layer decides what to log.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An announce exchange completed.
    TrackerAnnounced { peers: usize },
    /// A peer handshake succeeded.
    PeerConnected { addr: SocketAddr },
    /// A peer connection ended (error, timeout, or orderly close).
    PeerDisconnected { addr: SocketAddr, reason: String },
    /// A piece was assembled, verified, and written to the sink.
    PieceVerified {
        piece: u32,
        verified: usize,
        total: usize,
    },
    /// A completed piece failed hash verification and was re-queued.
    PieceFailed { piece: u32, addr: SocketAddr },
    /// The sink rejected a verified piece.
    StorageFailed { piece: u32 },
    /// Every piece is verified and written.
    Completed,
}

/// One torrent download session.
pub struct Session {
    metadata: TorrentMetadata,
    config: SessionConfig,
    manager: Arc<PieceManager>,
    peer_id: PeerId,
    events_tx: broadcast::Sender<SessionEvent>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Session {
    pub fn new(metadata: TorrentMetadata, config: SessionConfig, sink: Arc<dyn PieceSink>) -> Self {
        let manager = Arc::new(PieceManager::new(metadata.clone(), sink));
        let (events_tx, _) = broadcast::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            metadata,
            config,
            manager,
            peer_id: PeerId::generate(),
            events_tx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Subscribes to the session's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Requests shutdown: unblocks every in-flight socket operation and
    /// tracker wait.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// The shared piece state authority.
    pub fn piece_manager(&self) -> &Arc<PieceManager> {
        &self.manager
    }

    pub fn is_complete(&self) -> bool {
        self.manager.is_complete()
    }

    /// Runs the download to completion.
    ///
    /// Returns `Ok(())` once every piece is verified and written, or on
    /// explicit [`shutdown`](Self::shutdown). Fails only when the tracker
    /// is unreachable or the swarm runs out of connectable peers.
    pub async fn run(&self) -> Result<(), SessionError> {
        let mut shutdown = self.shutdown_rx.clone();

        let mut tracker = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            t = UdpTracker::connect(&self.metadata.announce, self.config.tracker_retry) => t?,
        };

        let response = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            r = self.announce(&mut tracker, TrackerEvent::Started) => r?,
        };

        self.emit(SessionEvent::TrackerAnnounced {
            peers: response.peers.len(),
        });
        info!(
            tracker = %tracker.addr(),
            peers = response.peers.len(),
            seeders = response.seeders,
            leechers = response.leechers,
            "announced"
        );

        let mut known: HashSet<SocketAddr> = HashSet::new();
        let mut pending: VecDeque<SocketAddr> = VecDeque::new();
        for addr in response.peers {
            if known.insert(addr) {
                pending.push_back(addr);
            }
        }

        if pending.is_empty() {
            return Err(SessionError::NoPeers);
        }

        let (peer_tx, mut peer_rx) = mpsc::channel::<SessionEvent>(64);
        let mut active: HashSet<SocketAddr> = HashSet::new();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut connected_since_announce = false;

        let result = loop {
            while active.len() < self.config.max_peer_connections {
                let Some(addr) = pending.pop_front() else {
                    break;
                };
                active.insert(addr);
                handles.push(self.spawn_peer(addr, peer_tx.clone()));
            }

            if active.is_empty() {
                if self.manager.is_complete() {
                    break Ok(());
                }

                // Peer pool ran dry mid-download; ask the tracker again.
                let response = tokio::select! {
                    _ = shutdown.changed() => break Ok(()),
                    r = self.announce(&mut tracker, TrackerEvent::None) => r?,
                };
                self.emit(SessionEvent::TrackerAnnounced {
                    peers: response.peers.len(),
                });

                let mut fresh = 0;
                for addr in response.peers {
                    if known.insert(addr) {
                        pending.push_back(addr);
                        fresh += 1;
                    } else if connected_since_announce && !pending.contains(&addr) {
                        // A known peer that dropped out is retryable again
                        // while connections keep succeeding; only a swarm
                        // that never connects stays terminal.
                        pending.push_back(addr);
                        fresh += 1;
                    }
                }
                connected_since_announce = false;
                if fresh == 0 {
                    warn!("tracker yielded no usable peers, giving up");
                    break Err(SessionError::PeersExhausted);
                }
                continue;
            }

            tokio::select! {
                _ = shutdown.changed() => break Ok(()),
                event = peer_rx.recv() => {
                    // Our own sender clone keeps the channel open.
                    let Some(event) = event else { break Ok(()) };
                    self.emit(event.clone());

                    match event {
                        SessionEvent::PeerConnected { .. } => {
                            connected_since_announce = true;
                        }
                        SessionEvent::PeerDisconnected { addr, ref reason } => {
                            debug!(peer = %addr, reason, "peer connection ended");
                            active.remove(&addr);
                        }
                        SessionEvent::PieceVerified { verified, total, .. } => {
                            info!(verified, total, "piece verified");
                            if self.manager.is_complete() {
                                break Ok(());
                            }
                        }
                        _ => {}
                    }
                }
            }
        };

        // Wind down: stop every peer task, discard their late events.
        let _ = self.shutdown_tx.send(true);
        peer_rx.close();
        for handle in handles {
            let _ = handle.await;
        }

        if result.is_ok() && self.manager.is_complete() {
            self.emit(SessionEvent::Completed);
            info!("download complete");
        }

        result
    }

    async fn announce(
        &self,
        tracker: &mut UdpTracker,
        event: TrackerEvent,
    ) -> Result<crate::tracker::AnnounceResponse, TrackerError> {
        let left = self.manager.bytes_remaining();
        let downloaded = self.metadata.total_length - left;
        tracker
            .announce(
                &self.metadata.info_hash,
                self.peer_id.as_bytes(),
                downloaded,
                left,
                0,
                event,
                self.config.listen_port,
            )
            .await
    }

    fn spawn_peer(&self, addr: SocketAddr, events: mpsc::Sender<SessionEvent>) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let config = self.config.clone();
        let info_hash = self.metadata.info_hash;
        let our_peer_id = *self.peer_id.as_bytes();
        let piece_count = self.metadata.piece_count();
        let shutdown = self.shutdown_rx.clone();

        tokio::spawn(async move {
            match PeerConnection::connect(addr, info_hash, our_peer_id, piece_count, &config).await
            {
                Ok(connection) => {
                    let _ = events.send(SessionEvent::PeerConnected { addr }).await;

                    let reason = match connection.run(manager, events.clone(), shutdown, config).await
                    {
                        Ok(()) => "closed".to_string(),
                        Err(e) => e.to_string(),
                    };
                    let _ = events
                        .send(SessionEvent::PeerDisconnected { addr, reason })
                        .await;
                }
                Err(e) => {
                    debug!(peer = %addr, error = %e, "connect failed");
                    let _ = events
                        .send(SessionEvent::PeerDisconnected {
                            addr,
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        })
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }
}
