use std::time::Duration;

/// Retry schedule for UDP tracker exchanges.
///
/// Attempt `n` waits `min(base_timeout << n, max_timeout)` for a matching
/// response before resending, per the BEP-15 backoff ladder (15s, 30s, 60s,
/// capped).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_timeout: Duration,
    pub max_timeout: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Returns the response wait for the given zero-based attempt.
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        let shifted = self
            .base_timeout
            .checked_mul(1u32 << attempt.min(16))
            .unwrap_or(self.max_timeout);
        shifted.min(self.max_timeout)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_timeout: Duration::from_secs(15),
            max_timeout: Duration::from_secs(60),
            max_attempts: 4,
        }
    }
}

/// Tuning knobs for a download session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// TCP port advertised to the tracker.
    pub listen_port: u16,
    /// Cap on simultaneously open peer connections.
    pub max_peer_connections: usize,
    /// Cap on outstanding block requests per connection.
    pub request_pipeline_depth: usize,
    /// Timeout for establishing the TCP connection to a peer.
    pub connect_timeout: Duration,
    /// Send a keep-alive frame after this much send/receive silence.
    pub keep_alive_interval: Duration,
    /// Declare a peer dead after this much receive silence.
    pub idle_timeout: Duration,
    /// Tracker retry schedule.
    pub tracker_retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            max_peer_connections: 30,
            request_pipeline_depth: 5,
            connect_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(90),
            idle_timeout: Duration::from_secs(120),
            tracker_retry: RetryPolicy::default(),
        }
    }
}
