//! # Hybrid Slow Start
//!
//! Leaves slow start before the first loss when either signal shows up
//! within a round:
//!
//! - **ACK train**: closely spaced ACKs keep arriving for longer than
//!   `min_rtt >> ack_train_factor_exp`, meaning packets are being spread out
//!   by a bottleneck.
//! - **Delay increase**: the minimum RTT over the first `min_samples` ACKs of
//!   the round exceeds the connection's min RTT by more than a clamped
//!   fraction of it, meaning a queue is building.
//!
//! A round ends once the packet that was last sent when the round started is
//! acknowledged. All boundaries are configurable.

use std::time::Duration;

use quanta::Instant;

use crate::config::HybridSlowStartConfig;

/// Which heuristic, if any, fired in the current slow-start episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HystartFound {
    NotFound,
    AckTrain,
    Delay,
}

#[derive(Debug, Clone)]
pub struct HybridSlowStart {
    config: HybridSlowStartConfig,
    /// Whether a measurement round is in progress.
    started: bool,
    found: HystartFound,
    /// Highest sequence number handed to the network.
    last_sent_sequence: u64,
    /// Round ends when this sequence number is acknowledged.
    end_sequence: u64,
    round_start: Option<Instant>,
    last_close_ack_time: Option<Instant>,
    /// Minimum RTT over the first samples of the round.
    current_min_rtt: Duration,
    rtt_sample_count: u32,
}

impl HybridSlowStart {
    pub fn new(config: HybridSlowStartConfig) -> Self {
        HybridSlowStart {
            config,
            started: false,
            found: HystartFound::NotFound,
            last_sent_sequence: 0,
            end_sequence: 0,
            round_start: None,
            last_close_ack_time: None,
            current_min_rtt: Duration::ZERO,
            rtt_sample_count: 0,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn found(&self) -> HystartFound {
        self.found
    }

    pub fn on_packet_sent(&mut self, sequence: u64) {
        self.last_sent_sequence = sequence;
    }

    pub fn on_packet_acked(&mut self, acked_sequence: u64, in_slow_start: bool) {
        if in_slow_start && self.is_end_of_round(acked_sequence) {
            self.started = false;
        }
    }

    /// Forget everything; the next RTT sample opens a fresh round.
    pub fn restart(&mut self) {
        self.started = false;
        self.found = HystartFound::NotFound;
    }

    fn start_round(&mut self, now: Instant) {
        self.round_start = Some(now);
        self.last_close_ack_time = Some(now);
        self.end_sequence = self.last_sent_sequence;
        self.current_min_rtt = Duration::ZERO;
        self.rtt_sample_count = 0;
        self.started = true;
    }

    fn is_end_of_round(&self, acked_sequence: u64) -> bool {
        self.end_sequence <= acked_sequence
    }

    /// Feed an RTT sample taken while in slow start. Returns true when slow
    /// start should end at the current window.
    pub fn should_exit_slow_start(
        &mut self,
        now: Instant,
        latest_rtt: Duration,
        min_rtt: Duration,
        congestion_window_packets: u64,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        if !self.started {
            self.start_round(now);
        }
        if self.found != HystartFound::NotFound {
            return congestion_window_packets >= self.config.low_window_packets;
        }

        // ACK train detection.
        let (round_start, last_close) = match (self.round_start, self.last_close_ack_time) {
            (Some(r), Some(l)) => (r, l),
            _ => (now, now),
        };
        if now.saturating_duration_since(last_close) <= self.config.close_ack_threshold {
            self.last_close_ack_time = Some(now);
            let train = now.saturating_duration_since(round_start);
            if train >= min_rtt / 2u32.pow(self.config.ack_train_factor_exp) {
                self.found = HystartFound::AckTrain;
            }
        } else if last_close == round_start {
            // The first ACK of the round was not close; restart the train here.
            self.round_start = Some(now);
            self.last_close_ack_time = Some(now);
        }

        // Delay increase detection.
        self.rtt_sample_count += 1;
        if self.rtt_sample_count <= self.config.min_samples
            && (self.current_min_rtt.is_zero() || latest_rtt < self.current_min_rtt)
        {
            self.current_min_rtt = latest_rtt;
        }
        if self.rtt_sample_count == self.config.min_samples {
            let variance = (min_rtt / 2u32.pow(self.config.delay_factor_exp))
                .clamp(self.config.delay_min_threshold, self.config.delay_max_threshold);
            if self.current_min_rtt > min_rtt + variance {
                self.found = HystartFound::Delay;
            }
        }

        congestion_window_packets >= self.config.low_window_packets
            && self.found != HystartFound::NotFound
    }
}
