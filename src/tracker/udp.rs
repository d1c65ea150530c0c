use std::net::SocketAddr;

use rand::Rng as _;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceResponse, TrackerEvent};
use crate::config::RetryPolicy;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const CONNECT_RESPONSE_LEN: usize = 16;
const ANNOUNCE_HEADER_LEN: usize = 20;

/// A BEP-15 UDP tracker client bound to one announce endpoint.
///
/// Each exchange resends on a backoff schedule and only accepts a
/// datagram whose action and transaction id echo the outstanding request;
/// stale, short, or mismatched packets are discarded as if nothing
/// arrived. The tracker is considered unreachable only once every
/// retransmit attempt has gone unanswered.
pub struct UdpTracker {
    socket: UdpSocket,
    addr: SocketAddr,
    retry: RetryPolicy,
    connection_id: Option<u64>,
}

impl UdpTracker {
    /// Resolves a `udp://host:port` announce URL and performs the connect
    /// exchange, capturing the session connection id.
    pub async fn connect(url: &str, retry: RetryPolicy) -> Result<Self, TrackerError> {
        let addr = resolve_udp_url(url).await?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        let mut tracker = Self {
            socket,
            addr,
            retry,
            connection_id: None,
        };

        tracker.do_connect().await?;

        Ok(tracker)
    }

    async fn do_connect(&mut self) -> Result<(), TrackerError> {
        let transaction_id: u32 = rand::rng().random();

        let mut request = Vec::with_capacity(16);
        request.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());

        let response = self
            .exchange(&request, ACTION_CONNECT, transaction_id, CONNECT_RESPONSE_LEN)
            .await?;

        self.connection_id = Some(u64::from_be_bytes([
            response[8],
            response[9],
            response[10],
            response[11],
            response[12],
            response[13],
            response[14],
            response[15],
        ]));

        Ok(())
    }

    /// Performs the announce exchange and returns the tracker's peer list.
    #[allow(clippy::too_many_arguments)]
    pub async fn announce(
        &mut self,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
        downloaded: u64,
        left: u64,
        uploaded: u64,
        event: TrackerEvent,
        port: u16,
    ) -> Result<AnnounceResponse, TrackerError> {
        let connection_id = self
            .connection_id
            .ok_or_else(|| TrackerError::InvalidResponse("not connected".into()))?;

        let transaction_id: u32 = rand::rng().random();
        let key: u32 = rand::rng().random();

        let mut request = Vec::with_capacity(98);
        request.extend_from_slice(&connection_id.to_be_bytes());
        request.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());
        request.extend_from_slice(info_hash);
        request.extend_from_slice(peer_id);
        request.extend_from_slice(&downloaded.to_be_bytes());
        request.extend_from_slice(&left.to_be_bytes());
        request.extend_from_slice(&uploaded.to_be_bytes());
        request.extend_from_slice(&event.as_udp_id().to_be_bytes());
        request.extend_from_slice(&0u32.to_be_bytes()); // IP address (0 = default)
        request.extend_from_slice(&key.to_be_bytes());
        request.extend_from_slice(&(-1i32).to_be_bytes()); // num_want (-1 = default)
        request.extend_from_slice(&port.to_be_bytes());

        let response = self
            .exchange(&request, ACTION_ANNOUNCE, transaction_id, ANNOUNCE_HEADER_LEN)
            .await?;

        let interval = u32::from_be_bytes([response[8], response[9], response[10], response[11]]);
        let leechers = u32::from_be_bytes([response[12], response[13], response[14], response[15]]);
        let seeders = u32::from_be_bytes([response[16], response[17], response[18], response[19]]);

        let peers = if response.len() > ANNOUNCE_HEADER_LEN {
            parse_compact_peers(&response[ANNOUNCE_HEADER_LEN..])
        } else {
            Vec::new()
        };

        Ok(AnnounceResponse {
            interval,
            leechers,
            seeders,
            peers,
        })
    }

    /// Sends `request` and waits for a matching response, retransmitting
    /// on the retry policy's backoff ladder.
    ///
    /// Within one attempt's deadline, every received datagram is checked:
    /// a mismatched transaction id, an unexpected action, or a body
    /// shorter than `min_response_len` discards the datagram and keeps
    /// waiting. A tracker error (action 3) with a matching transaction id
    /// is returned verbatim.
    async fn exchange(
        &self,
        request: &[u8],
        expected_action: u32,
        transaction_id: u32,
        min_response_len: usize,
    ) -> Result<Vec<u8>, TrackerError> {
        let mut buf = vec![0u8; 4096];

        for attempt in 0..self.retry.max_attempts {
            self.socket.send(request).await?;

            let deadline = Instant::now() + self.retry.timeout_for(attempt);

            loop {
                let n = match timeout_at(deadline, self.socket.recv(&mut buf)).await {
                    Err(_) => break,
                    Ok(Err(e)) => return Err(TrackerError::Io(e)),
                    Ok(Ok(n)) => n,
                };

                if n < 8 {
                    debug!(tracker = %self.addr, len = n, "discarding short datagram");
                    continue;
                }

                let action = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                let resp_tid = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

                if resp_tid != transaction_id {
                    debug!(tracker = %self.addr, "discarding stale transaction id");
                    continue;
                }

                if action == ACTION_ERROR {
                    let message = String::from_utf8_lossy(&buf[8..n]).to_string();
                    return Err(TrackerError::Failure(message));
                }

                if action != expected_action || n < min_response_len {
                    debug!(
                        tracker = %self.addr,
                        action,
                        len = n,
                        "discarding malformed response"
                    );
                    continue;
                }

                return Ok(buf[..n].to_vec());
            }

            debug!(
                tracker = %self.addr,
                attempt = attempt + 1,
                "no tracker response, backing off"
            );
        }

        Err(TrackerError::Timeout)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

async fn resolve_udp_url(url: &str) -> Result<SocketAddr, TrackerError> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))?;

    let host_port = rest.split('/').next().unwrap_or(rest);

    lookup_host(host_port)
        .await
        .map_err(|_| TrackerError::InvalidUrl(url.to_string()))?
        .next()
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))
}
