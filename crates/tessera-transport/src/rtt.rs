//! # RTT Statistics
//!
//! Smoothed RTT and RTT variation fed by the loss-detection layer. The
//! congestion controller only reads from here.

use std::time::Duration;

/// RFC 6298-style RTT estimator.
#[derive(Debug, Clone, Default)]
pub struct RttStats {
    /// Most recent sample, ack delay removed.
    latest_rtt: Duration,
    /// Minimum raw sample observed.
    min_rtt: Duration,
    /// Smoothed RTT (SRTT).
    smoothed_rtt: Duration,
    /// RTT variation (RTTVAR).
    mean_deviation: Duration,
    /// Number of samples taken.
    sample_count: u64,
}

impl RttStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an RTT sample. `send_delta` is the time between sending a
    /// packet and receiving its ACK; `ack_delay` is the peer's reported delay.
    pub fn update_rtt(&mut self, send_delta: Duration, ack_delay: Duration) {
        if send_delta.is_zero() {
            return;
        }

        if self.min_rtt.is_zero() || send_delta < self.min_rtt {
            self.min_rtt = send_delta;
        }

        // Only strip the ack delay when the sample can absorb it.
        let sample = if send_delta > ack_delay {
            send_delta - ack_delay
        } else {
            send_delta
        };
        self.latest_rtt = sample;
        self.sample_count += 1;

        if self.sample_count == 1 {
            self.smoothed_rtt = sample;
            self.mean_deviation = sample / 2;
        } else {
            // α = 1/8, β = 1/4
            let deviation = self.smoothed_rtt.abs_diff(sample);
            self.mean_deviation = self.mean_deviation * 3 / 4 + deviation / 4;
            self.smoothed_rtt = self.smoothed_rtt * 7 / 8 + sample / 8;
        }
    }

    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    pub fn mean_deviation(&self) -> Duration {
        self.mean_deviation
    }

    pub fn has_samples(&self) -> bool {
        self.sample_count > 0
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }
}
