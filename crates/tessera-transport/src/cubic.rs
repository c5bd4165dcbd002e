//! # Cubic Window Growth
//!
//! Byte-based cubic growth emulating `num_connections` Reno flows. The window
//! follows `W(t) = C·(t − K)³ + W_max` from the last loss epoch; when Reno
//! friendliness is on, a parallel Reno estimate is tracked and the larger of
//! the two wins, so cubic never grows slower than Reno would.
//!
//! Time is kept in 2^10 fractions of a second so the cube can be scaled with
//! shifts.

use std::time::Duration;

use quanta::Instant;

/// 1024 · 1024³: the first 1024 comes from 0.100³ (100 ms scaling RTT).
const CUBE_SCALE: u32 = 40;
const CUBE_CONGESTION_WINDOW_SCALE: u64 = 410;

/// Per-flow multiplicative decrease.
const BACKOFF_FACTOR: f64 = 0.7;

/// Extra backoff when a loss happens before regaining the previous maximum.
const BETA_LAST_MAX: f64 = 0.85;

#[derive(Debug, Clone)]
pub struct Cubic {
    mss: u64,
    num_connections: u32,
    reno_friendly: bool,
    /// Start of the current growth cycle, after the last loss.
    epoch: Option<Instant>,
    /// Window just before the last loss, possibly backed off further.
    last_max_congestion_window: u64,
    /// Bytes acknowledged since the last update.
    acked_bytes_count: u64,
    /// Reno-equivalent window in bytes.
    estimated_tcp_congestion_window: u64,
    /// Window at the origin (plateau) of the cubic function.
    origin_point_congestion_window: u64,
    /// Time to the origin point in 2^10 fractions of a second.
    time_to_origin_point: u64,
}

impl Cubic {
    pub fn new(mss: u64, num_connections: u32, reno_friendly: bool) -> Self {
        Cubic {
            mss,
            num_connections: num_connections.max(1),
            reno_friendly,
            epoch: None,
            last_max_congestion_window: 0,
            acked_bytes_count: 0,
            estimated_tcp_congestion_window: 0,
            origin_point_congestion_window: 0,
            time_to_origin_point: 0,
        }
    }

    /// Effective multiplicative decrease of an N-flow ensemble.
    pub fn beta(&self) -> f64 {
        let n = self.num_connections as f64;
        (n - 1.0 + BACKOFF_FACTOR) / n
    }

    fn beta_last_max(&self) -> f64 {
        let n = self.num_connections as f64;
        (n - 1.0 + BETA_LAST_MAX) / n
    }

    /// Reno-friendly additive increase for the N-flow ensemble.
    pub fn alpha(&self) -> f64 {
        let n = self.num_connections as f64;
        let beta = self.beta();
        3.0 * n * n * (1.0 - beta) / (1.0 + beta)
    }

    fn cube_factor(&self) -> u64 {
        (1u64 << CUBE_SCALE) / CUBE_CONGESTION_WINDOW_SCALE / self.mss
    }

    pub fn reset(&mut self) {
        *self = Cubic::new(self.mss, self.num_connections, self.reno_friendly);
    }

    /// Sender stopped being window-limited; restart the growth epoch.
    pub fn on_application_limited(&mut self) {
        self.epoch = None;
    }

    pub fn last_max_congestion_window(&self) -> u64 {
        self.last_max_congestion_window
    }

    /// Window to use after a loss.
    pub fn congestion_window_after_loss(&mut self, current: u64) -> u64 {
        // A slight under-estimate of the old max is not competing traffic.
        if current + self.mss < self.last_max_congestion_window {
            self.last_max_congestion_window = (self.beta_last_max() * current as f64) as u64;
        } else {
            self.last_max_congestion_window = current;
        }
        self.epoch = None;
        (current as f64 * self.beta()) as u64
    }

    /// Window to use after `acked_bytes` were acknowledged at `now`.
    pub fn congestion_window_after_ack(
        &mut self,
        acked_bytes: u64,
        current: u64,
        delay_min: Duration,
        now: Instant,
    ) -> u64 {
        self.acked_bytes_count += acked_bytes;

        let epoch = match self.epoch {
            Some(epoch) => epoch,
            None => {
                self.epoch = Some(now);
                self.acked_bytes_count = acked_bytes;
                self.estimated_tcp_congestion_window = current;
                if self.last_max_congestion_window <= current {
                    self.time_to_origin_point = 0;
                    self.origin_point_congestion_window = current;
                } else {
                    let distance = self.last_max_congestion_window - current;
                    self.time_to_origin_point =
                        ((self.cube_factor() * distance) as f64).cbrt() as u64;
                    self.origin_point_congestion_window = self.last_max_congestion_window;
                }
                now
            }
        };

        let since_epoch = (now + delay_min).saturating_duration_since(epoch);
        let elapsed_time = ((since_epoch.as_micros() as u64) << 10) / 1_000_000;

        let offset = self.time_to_origin_point.abs_diff(elapsed_time);
        let delta = ((CUBE_CONGESTION_WINDOW_SCALE as u128
            * offset as u128
            * offset as u128
            * offset as u128
            * self.mss as u128)
            >> CUBE_SCALE) as u64;

        let mut target = if elapsed_time > self.time_to_origin_point {
            self.origin_point_congestion_window.saturating_add(delta)
        } else {
            self.origin_point_congestion_window.saturating_sub(delta)
        };
        // Never more than half the acknowledged bytes per update.
        target = target.min(current + self.acked_bytes_count / 2);

        if self.estimated_tcp_congestion_window > 0 {
            let inc = self.acked_bytes_count as f64 * self.alpha() * self.mss as f64
                / self.estimated_tcp_congestion_window as f64;
            self.estimated_tcp_congestion_window += inc as u64;
        }
        self.acked_bytes_count = 0;

        if self.reno_friendly {
            target.max(self.estimated_tcp_congestion_window)
        } else {
            target
        }
    }
}
