//! # Congestion Control
//!
//! Window-based sender congestion control in bytes.
//!
//! ## State Machine
//!
//! ```text
//!              ack (window-limited)            hybrid slow start exit
//!            ┌───────────────────┐          ┌───────────────────────┐
//!            │                   ▼          │                       ▼
//!        ┌───┴────────┐   ssthresh = cwnd   │            ┌──────────────────────┐
//!  RTO ─▶│ SLOW START ├─────────────────────┘            │ CONGESTION AVOIDANCE │
//!        └─────┬──────┘                                  └──────────┬───────────┘
//!              │ loss                                          loss │
//!              │           ┌──────────────────────────┐             │
//!              └──────────▶│ RECOVERY (PRR pacing)    │◀────────────┘
//!                          │ exit: ack > cutback seq  │
//!                          └────────────┬─────────────┘
//!                                       └──▶ CONGESTION AVOIDANCE
//! ```
//!
//! Slow start adds every acknowledged byte to the window. Congestion
//! avoidance grows by the injected [`GrowthStrategy`]: Reno adds one segment
//! per window of acknowledged bytes, cubic follows [`Cubic`]. A loss backs the
//! window off once per recovery episode; while recovering, sends are paced by
//! proportional rate reduction instead of the bare window.

use std::collections::BTreeMap;
use std::time::Duration;

use quanta::Instant;
use tracing::{debug, trace};

use crate::config::{CongestionConfig, GrowthMode};
use crate::cubic::Cubic;
use crate::hystart::HybridSlowStart;
use crate::rtt::RttStats;
use crate::stats::CongestionStats;

/// Segments of headroom under which the sender still counts as window-limited.
const MAX_BURST_PACKETS: u64 = 3;

/// Returned by [`CongestionController::time_until_send`] when only an ack
/// can unblock the sender.
pub const INFINITE_DELAY: Duration = Duration::MAX;

// ─── Event Inputs ───────────────────────────────────────────────────────────

/// Metadata of a packet handed to the congestion controller in a
/// congestion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentPacket {
    /// Bytes the packet occupied in flight.
    pub bytes: u64,
    pub sent_time: Instant,
}

/// Packets keyed by sequence number, in ascending order.
pub type PacketMap = BTreeMap<u64, SentPacket>;

// ─── Growth Strategy ────────────────────────────────────────────────────────

/// How the window grows in congestion avoidance and backs off on loss.
#[derive(Debug, Clone)]
pub enum GrowthStrategy {
    /// One segment per window of acknowledged bytes; halves on loss.
    Reno {
        /// Bytes acknowledged since the last one-segment increase.
        acked_bytes: u64,
    },
    /// Cubic growth of time since the last loss.
    Cubic(Cubic),
}

impl GrowthStrategy {
    pub fn from_config(config: &CongestionConfig) -> Self {
        match config.growth {
            GrowthMode::Reno => GrowthStrategy::Reno { acked_bytes: 0 },
            GrowthMode::Cubic => GrowthStrategy::Cubic(Cubic::new(
                config.max_segment_size,
                config.num_connections,
                config.reno_friendly,
            )),
        }
    }

    pub fn mode(&self) -> GrowthMode {
        match self {
            GrowthStrategy::Reno { .. } => GrowthMode::Reno,
            GrowthStrategy::Cubic(_) => GrowthMode::Cubic,
        }
    }

    fn reset(&mut self) {
        match self {
            GrowthStrategy::Reno { acked_bytes } => *acked_bytes = 0,
            GrowthStrategy::Cubic(cubic) => cubic.reset(),
        }
    }
}

// ─── Proportional Rate Reduction ────────────────────────────────────────────

/// PRR bookkeeping for one recovery episode (RFC 6937).
#[derive(Debug, Clone, Default)]
struct PrrState {
    /// Bytes sent since entering recovery.
    prr_out: u64,
    /// Bytes acknowledged since entering recovery.
    prr_delivered: u64,
    /// Acks received since entering recovery.
    ack_count_since_loss: u64,
    /// Bytes in flight when the loss was detected.
    bytes_in_flight_before_loss: u64,
}

impl PrrState {
    fn on_loss(&mut self, prior_in_flight: u64) {
        *self = PrrState {
            bytes_in_flight_before_loss: prior_in_flight,
            ..PrrState::default()
        };
    }

    fn time_until_send(
        &self,
        congestion_window: u64,
        bytes_in_flight: u64,
        slow_start_threshold: u64,
        mss: u64,
    ) -> Duration {
        // Always allow one send right after the loss, or when the pipe is
        // nearly empty.
        if self.prr_out == 0 || bytes_in_flight < mss {
            return Duration::ZERO;
        }
        if congestion_window > bytes_in_flight {
            // Slow start reduction bound: at most one extra segment per ack
            // beyond what was delivered.
            if self.prr_delivered + self.ack_count_since_loss * mss <= self.prr_out {
                return INFINITE_DELAY;
            }
            return Duration::ZERO;
        }
        // Proportional part: prr_out / prr_delivered tracks ssthresh / pipe.
        if self.prr_delivered as u128 * slow_start_threshold as u128
            > self.prr_out as u128 * self.bytes_in_flight_before_loss as u128
        {
            return Duration::ZERO;
        }
        INFINITE_DELAY
    }
}

// ─── Controller ─────────────────────────────────────────────────────────────

/// Congestion controller for one connection.
pub struct CongestionController {
    config: CongestionConfig,
    growth: GrowthStrategy,
    hybrid_slow_start: HybridSlowStart,
    prr: PrrState,

    /// Congestion window in bytes.
    congestion_window: u64,
    /// Slow start threshold in bytes.
    slow_start_threshold: u64,

    largest_sent: Option<u64>,
    largest_acked: Option<u64>,
    /// Largest sequence sent when the window was last cut back. Losses at or
    /// below it belong to the same episode.
    largest_sent_at_last_cutback: Option<u64>,
    in_recovery: bool,
    /// Cubic only: bytes still to be acknowledged after recovery before
    /// the window may grow again.
    post_recovery_hold: u64,

    stats: CongestionStats,
}

impl CongestionController {
    pub fn new(config: CongestionConfig) -> Self {
        let initial = config.initial_window();
        let ssthresh = config.max_window();
        Self::with_state(config, initial, ssthresh)
    }

    /// Build a controller with an injected window and threshold. Both are
    /// clamped into the configured window range.
    pub fn with_state(config: CongestionConfig, congestion_window: u64, slow_start_threshold: u64) -> Self {
        let congestion_window = congestion_window.clamp(config.min_window(), config.max_window());
        CongestionController {
            growth: GrowthStrategy::from_config(&config),
            hybrid_slow_start: HybridSlowStart::new(config.hybrid_slow_start.clone()),
            prr: PrrState::default(),
            congestion_window,
            slow_start_threshold: slow_start_threshold.max(config.min_window()),
            largest_sent: None,
            largest_acked: None,
            largest_sent_at_last_cutback: None,
            in_recovery: false,
            post_recovery_hold: 0,
            stats: CongestionStats {
                max_congestion_window: congestion_window,
                ..CongestionStats::default()
            },
            config,
        }
    }

    // ─── Getters ────────────────────────────────────────────────────────

    /// Congestion window in bytes.
    pub fn congestion_window(&self) -> u64 {
        self.congestion_window
    }

    /// Slow start threshold in bytes.
    pub fn slow_start_threshold(&self) -> u64 {
        self.slow_start_threshold
    }

    pub fn in_slow_start(&self) -> bool {
        self.congestion_window < self.slow_start_threshold
    }

    pub fn in_recovery(&self) -> bool {
        self.in_recovery
    }

    pub fn growth(&self) -> &GrowthStrategy {
        &self.growth
    }

    pub fn hybrid_slow_start(&self) -> &HybridSlowStart {
        &self.hybrid_slow_start
    }

    pub fn max_segment_size(&self) -> u64 {
        self.config.max_segment_size
    }

    /// Window divided by smoothed RTT in bytes/sec; zero without samples.
    pub fn bandwidth_estimate(&self, rtt: &RttStats) -> u64 {
        let srtt_us = rtt.smoothed_rtt().as_micros() as u64;
        if !rtt.has_samples() || srtt_us == 0 {
            return 0;
        }
        (self.congestion_window as u128 * 1_000_000 / srtt_us as u128) as u64
    }

    pub fn stats(&self) -> CongestionStats {
        CongestionStats {
            congestion_window: self.congestion_window,
            slow_start_threshold: self.slow_start_threshold,
            ..self.stats.clone()
        }
    }

    // ─── Send Gate ──────────────────────────────────────────────────────

    /// Zero when a packet may go out now, [`INFINITE_DELAY`] otherwise.
    pub fn time_until_send(&self, _now: Instant, bytes_in_flight: u64) -> Duration {
        if self.in_recovery {
            return self.prr.time_until_send(
                self.congestion_window,
                bytes_in_flight,
                self.slow_start_threshold,
                self.config.max_segment_size,
            );
        }
        if self.congestion_window > bytes_in_flight {
            Duration::ZERO
        } else {
            INFINITE_DELAY
        }
    }

    pub fn can_send(&self, now: Instant, bytes_in_flight: u64) -> bool {
        self.time_until_send(now, bytes_in_flight).is_zero()
    }

    /// Record a sent packet. Returns whether the packet counts toward bytes
    /// in flight; pure acks do not.
    pub fn on_packet_sent(
        &mut self,
        _now: Instant,
        _bytes_in_flight: u64,
        sequence: u64,
        bytes: u64,
        retransmittable: bool,
    ) -> bool {
        if !retransmittable {
            return false;
        }
        if self.in_recovery {
            self.prr.prr_out += bytes;
        }
        debug_assert!(self.largest_sent.map_or(true, |s| s < sequence));
        self.largest_sent = Some(self.largest_sent.map_or(sequence, |s| s.max(sequence)));
        self.hybrid_slow_start.on_packet_sent(sequence);
        true
    }

    // ─── Congestion Events ──────────────────────────────────────────────

    /// Apply one batch of acknowledgements and losses. Losses are processed
    /// first so a loss and an ack in the same batch see the cut-back window.
    pub fn on_congestion_event(
        &mut self,
        now: Instant,
        rtt_updated: bool,
        prior_in_flight: u64,
        acked: &PacketMap,
        lost: &PacketMap,
        rtt: &RttStats,
    ) {
        if rtt_updated && self.in_slow_start() && rtt.has_samples() {
            let window_packets = self.congestion_window / self.config.max_segment_size;
            if self.hybrid_slow_start.should_exit_slow_start(
                now,
                rtt.latest_rtt(),
                rtt.min_rtt(),
                window_packets,
            ) {
                self.slow_start_threshold = self.congestion_window;
                self.stats.hybrid_slow_start_exits += 1;
                debug!(
                    cwnd = self.congestion_window,
                    found = ?self.hybrid_slow_start.found(),
                    "hybrid slow start exit"
                );
            }
        }

        for (&sequence, packet) in lost {
            self.on_packet_lost(sequence, packet.bytes, prior_in_flight);
        }
        for (&sequence, packet) in acked {
            self.on_packet_acked(now, sequence, packet.bytes, prior_in_flight, rtt);
        }
    }

    fn on_packet_lost(&mut self, sequence: u64, bytes: u64, prior_in_flight: u64) {
        if self
            .largest_sent_at_last_cutback
            .is_some_and(|cutback| sequence <= cutback)
        {
            trace!(sequence, "loss inside current recovery episode");
            return;
        }

        if self.in_slow_start() {
            self.stats.slow_start_packets_lost += 1;
        }
        self.prr.on_loss(prior_in_flight);

        let reduced = match &mut self.growth {
            GrowthStrategy::Reno { acked_bytes } => {
                *acked_bytes = 0;
                self.congestion_window / 2
            }
            GrowthStrategy::Cubic(cubic) => cubic.congestion_window_after_loss(self.congestion_window),
        };
        let previous = self.congestion_window;
        self.congestion_window = reduced.max(self.config.min_window());
        self.slow_start_threshold = self.congestion_window;
        self.largest_sent_at_last_cutback = self.largest_sent;
        self.in_recovery = true;
        self.post_recovery_hold = 0;
        self.stats.cutbacks += 1;

        debug!(
            sequence,
            bytes,
            previous_cwnd = previous,
            cwnd = self.congestion_window,
            recovery_point = ?self.largest_sent_at_last_cutback,
            "congestion cutback"
        );
    }

    fn on_packet_acked(
        &mut self,
        now: Instant,
        sequence: u64,
        bytes: u64,
        prior_in_flight: u64,
        rtt: &RttStats,
    ) {
        self.largest_acked = Some(self.largest_acked.map_or(sequence, |a| a.max(sequence)));

        if self.in_recovery {
            let recovered = match (self.largest_acked, self.largest_sent_at_last_cutback) {
                (Some(acked), Some(cutback)) => acked > cutback,
                _ => true,
            };
            if !recovered {
                self.prr.prr_delivered += bytes;
                self.prr.ack_count_since_loss += 1;
                return;
            }
            self.in_recovery = false;
            if matches!(self.growth, GrowthStrategy::Cubic(_)) {
                self.post_recovery_hold = self.congestion_window;
            }
            debug!(cwnd = self.congestion_window, sequence, "recovery complete");
        }

        self.maybe_increase_window(now, bytes, prior_in_flight, rtt);
        let in_slow_start = self.in_slow_start();
        self.hybrid_slow_start.on_packet_acked(sequence, in_slow_start);
    }

    /// Whether the sender was using the window it had.
    fn is_window_limited(&self, bytes_in_flight: u64) -> bool {
        if bytes_in_flight >= self.congestion_window {
            return true;
        }
        let available = self.congestion_window - bytes_in_flight;
        let slow_start_limited = self.in_slow_start() && bytes_in_flight > self.congestion_window / 2;
        slow_start_limited || available <= MAX_BURST_PACKETS * self.config.max_segment_size
    }

    fn maybe_increase_window(&mut self, now: Instant, acked: u64, prior_in_flight: u64, rtt: &RttStats) {
        if !self.is_window_limited(prior_in_flight) {
            if let GrowthStrategy::Cubic(cubic) = &mut self.growth {
                cubic.on_application_limited();
            }
            return;
        }
        let max_window = self.config.max_window();
        if self.congestion_window >= max_window {
            return;
        }

        if self.in_slow_start() {
            self.congestion_window = (self.congestion_window + acked).min(max_window);
            self.record_window();
            trace!(cwnd = self.congestion_window, ssthresh = self.slow_start_threshold, "slow start growth");
            return;
        }

        let mss = self.config.max_segment_size;
        match &mut self.growth {
            GrowthStrategy::Reno { acked_bytes } => {
                *acked_bytes += acked;
                if *acked_bytes >= self.congestion_window {
                    self.congestion_window = (self.congestion_window + mss).min(max_window);
                    *acked_bytes = 0;
                }
            }
            GrowthStrategy::Cubic(cubic) => {
                if self.post_recovery_hold > 0 {
                    self.post_recovery_hold = self.post_recovery_hold.saturating_sub(acked);
                    return;
                }
                let next = cubic.congestion_window_after_ack(
                    acked,
                    self.congestion_window,
                    rtt.min_rtt(),
                    now,
                );
                self.congestion_window = next.clamp(self.config.min_window(), max_window);
            }
        }
        self.record_window();
    }

    fn record_window(&mut self) {
        self.stats.max_congestion_window = self.stats.max_congestion_window.max(self.congestion_window);
    }

    // ─── Timeouts ───────────────────────────────────────────────────────

    /// A retransmission timeout fired. With `packets_retransmitted` false the
    /// timeout was spurious and nothing changes.
    pub fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        if !packets_retransmitted {
            trace!("spurious retransmission timeout");
            return;
        }
        self.largest_sent_at_last_cutback = None;
        self.in_recovery = false;
        self.post_recovery_hold = 0;
        self.growth.reset();
        self.hybrid_slow_start.restart();
        self.slow_start_threshold = (self.congestion_window / 2).max(self.config.min_window());
        self.congestion_window = self.config.min_window();
        self.stats.retransmission_timeouts += 1;
        debug!(
            cwnd = self.congestion_window,
            ssthresh = self.slow_start_threshold,
            "retransmission timeout"
        );
    }

    /// `srtt + 4·rttvar`, or the configured default before any RTT sample.
    pub fn retransmission_delay(&self, rtt: &RttStats) -> Duration {
        if !rtt.has_samples() {
            return self.config.default_retransmission_delay;
        }
        rtt.smoothed_rtt() + rtt.mean_deviation() * 4
    }
}
