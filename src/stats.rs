//! Round-trip time estimation and per-connection traffic counters.
//!
//! Not named by spec.md directly, but every figure here (RTT, sent/received
//! counts, drop counts) is implied by the retry/timeout behavior spec.md
//! §4 describes, exposed so the application can surface connection health
//! without reaching into protocol internals.

use std::time::Duration;

/// Smoothing factor for the RTT EWMA: `rtt = rtt*(1-a) + sample*a`.
const RTT_ALPHA: f64 = 1.0 / 8.0;

/// A round-trip time estimate that updates as acks come in.
pub trait Rtt {
    /// Current smoothed round-trip time estimate, or `None` if no sample has
    /// been observed yet.
    fn rtt(&self) -> Option<Duration>;
}

/// Exponentially-weighted moving average RTT estimator, updated once per
/// acked packet with the time between its send and its ack.
#[derive(Debug, Clone, Copy, Default)]
pub struct RttEstimator {
    estimate: Option<Duration>,
}

impl RttEstimator {
    /// Creates an estimator with no samples yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a new round-trip sample into the estimate.
    pub fn update(&mut self, sample: Duration) {
        self.estimate = Some(match self.estimate {
            None => sample,
            Some(prev) => {
                let prev_secs = prev.as_secs_f64();
                let sample_secs = sample.as_secs_f64();
                let next = prev_secs + RTT_ALPHA * (sample_secs - prev_secs);
                Duration::from_secs_f64(next.max(0.0))
            }
        });
    }
}

impl Rtt for RttEstimator {
    fn rtt(&self) -> Option<Duration> {
        self.estimate
    }
}

/// Message- and byte-level counters for one connection, split by direction.
///
/// Cumulative across the connection's lifetime; the application samples it
/// whenever it wants a point-in-time view (e.g. once per second) rather than
/// this type doing its own windowing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Total messages handed to the connection for sending.
    pub messages_sent: u64,
    /// Total messages delivered to the application.
    pub messages_received: u64,
    /// Total bytes sent, including protocol overhead.
    pub bytes_sent: u64,
    /// Total bytes received, including protocol overhead.
    pub bytes_received: u64,
    /// Packets dropped for being duplicates or older than the ack window.
    pub packets_dropped_stale: u64,
    /// Packets dropped for failing AEAD authentication.
    pub packets_dropped_corrupt: u64,
    /// Messages that hit the connection timeout while still unacked.
    pub messages_timed_out: u64,
}

impl Stats {
    /// A zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outgoing packet of `len` bytes carrying `message_count`
    /// application messages.
    pub fn record_sent(&mut self, len: usize, message_count: u64) {
        self.bytes_sent += len as u64;
        self.messages_sent += message_count;
    }

    /// Records a successfully decrypted and accepted incoming packet of
    /// `len` bytes carrying `message_count` application messages.
    pub fn record_received(&mut self, len: usize, message_count: u64) {
        self.bytes_received += len as u64;
        self.messages_received += message_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_taken_as_is() {
        let mut est = RttEstimator::new();
        est.update(Duration::from_millis(100));
        assert_eq!(est.rtt(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn converges_toward_repeated_samples() {
        let mut est = RttEstimator::new();
        est.update(Duration::from_millis(200));
        for _ in 0..50 {
            est.update(Duration::from_millis(50));
        }
        let rtt = est.rtt().unwrap();
        assert!(rtt.as_millis() < 55, "expected convergence near 50ms, got {rtt:?}");
    }

    #[test]
    fn stats_accumulate() {
        let mut stats = Stats::new();
        stats.record_sent(100, 2);
        stats.record_sent(50, 1);
        assert_eq!(stats.bytes_sent, 150);
        assert_eq!(stats.messages_sent, 3);
    }
}
