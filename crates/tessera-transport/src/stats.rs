//! # Transport Statistics
//!
//! Counters kept by the congestion controller and the session. Everything
//! here serialises to JSON for the simulation harness and for whatever the
//! embedding application exports.

use serde::Serialize;

// ─── Congestion Stats ───────────────────────────────────────────────────────

/// Congestion controller counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CongestionStats {
    /// Window reductions triggered by loss.
    pub cutbacks: u64,
    /// Retransmission timeouts that reset the window.
    pub retransmission_timeouts: u64,
    /// Times hybrid slow start ended slow start before a loss.
    pub hybrid_slow_start_exits: u64,
    /// Losses observed while still in slow start.
    pub slow_start_packets_lost: u64,
    /// Largest congestion window reached, in bytes.
    pub max_congestion_window: u64,
    /// Congestion window at snapshot time, in bytes.
    pub congestion_window: u64,
    /// Slow start threshold at snapshot time, in bytes.
    pub slow_start_threshold: u64,
}

// ─── Session Stats ──────────────────────────────────────────────────────────

/// Session-wide stream and flow-control counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Stream payload bytes accepted by the transport.
    pub stream_bytes_written: u64,
    /// Stream payload bytes delivered to the application.
    pub stream_bytes_read: u64,
    pub streams_opened: u64,
    pub streams_closed: u64,
    /// Blocked signals queued for the peer.
    pub blocked_signals: u64,
    /// Window updates queued for the peer.
    pub window_updates: u64,
    pub resets_sent: u64,
    pub resets_received: u64,
    /// Packets the congestion controller chose to track.
    pub packets_sent: u64,
    pub packets_acked: u64,
    pub packets_lost: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of tracked packets reported lost.
    pub fn loss_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_lost as f64 / self.packets_sent as f64
        }
    }
}

/// Combined snapshot returned by [`crate::session::Session::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub congestion: CongestionStats,
    pub session: SessionStats,
    /// Smoothed RTT in µs, zero before the first sample.
    pub srtt_us: u64,
    /// Window divided by smoothed RTT, in bytes/sec.
    pub bandwidth_estimate_bps: u64,
    pub open_streams: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_rate_zero_when_idle() {
        assert_eq!(SessionStats::new().loss_rate(), 0.0);
    }

    #[test]
    fn loss_rate_ratio() {
        let stats = SessionStats {
            packets_sent: 200,
            packets_lost: 5,
            ..SessionStats::default()
        };
        assert!((stats.loss_rate() - 0.025).abs() < 1e-12);
    }

    #[test]
    fn stats_serialize_to_json() {
        let stats = TransportStats {
            congestion: CongestionStats {
                cutbacks: 3,
                congestion_window: 14_600,
                ..CongestionStats::default()
            },
            session: SessionStats {
                streams_opened: 2,
                ..SessionStats::default()
            },
            srtt_us: 60_000,
            bandwidth_estimate_bps: 243_333,
            open_streams: 2,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["congestion"]["cutbacks"], 3);
        assert_eq!(json["congestion"]["congestion_window"], 14_600);
        assert_eq!(json["session"]["streams_opened"], 2);
        assert_eq!(json["srtt_us"], 60_000);
    }
}
