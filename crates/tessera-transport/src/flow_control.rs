//! # Flow Control
//!
//! Byte-offset flow control, one instance per stream plus one for the whole
//! connection. Both scopes share this type; the session decides which
//! scopes are enabled for the negotiated version.
//!
//! Receive side: the window is re-granted once less than half of
//! `max_receive_window` remains unconsumed, so the peer never stalls and
//! grants are amortised over many reads. Send side: offsets only move when
//! the peer grants more window, and a blocked signal is raised once per
//! distinct send-window offset.

use tracing::{error, trace};

use crate::error::{ConnectionError, ErrorCode};
use crate::stream::StreamId;

/// Which level of the connection a controller guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowScope {
    Stream,
    Connection,
}

/// Signal a controller asks the session to send to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    /// Receive window was enlarged to `offset`.
    WindowUpdate { offset: u64 },
    /// Send window is exhausted.
    Blocked,
}

#[derive(Debug, Clone)]
pub struct FlowController {
    scope: FlowScope,
    /// Stream id, or [`StreamId::CONNECTION`]. Used for logging only.
    id: StreamId,
    enabled: bool,

    // ─── Send side ───
    /// Bytes handed to the transport so far.
    bytes_sent: u64,
    /// Peer-granted limit on `bytes_sent`.
    send_window_offset: u64,
    /// Send-window offset at which a blocked signal was last raised.
    last_blocked_send_offset: Option<u64>,

    // ─── Receive side ───
    /// Bytes the application has consumed.
    bytes_consumed: u64,
    /// Highest byte offset seen from the peer.
    highest_received_offset: u64,
    /// Limit granted to the peer.
    receive_window_offset: u64,
    /// Receive window size and grant increment.
    max_receive_window: u64,
}

impl FlowController {
    pub fn new(scope: FlowScope, id: StreamId, send_window_offset: u64, max_receive_window: u64) -> Self {
        FlowController {
            scope,
            id,
            enabled: true,
            bytes_sent: 0,
            send_window_offset,
            last_blocked_send_offset: None,
            bytes_consumed: 0,
            highest_received_offset: 0,
            receive_window_offset: max_receive_window,
            max_receive_window,
        }
    }

    // ─── Getters ────────────────────────────────────────────────────────

    pub fn scope(&self) -> FlowScope {
        self.scope
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn send_window_offset(&self) -> u64 {
        self.send_window_offset
    }

    /// Bytes that may still be sent before blocking.
    pub fn send_window_size(&self) -> u64 {
        self.send_window_offset.saturating_sub(self.bytes_sent)
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    pub fn highest_received_offset(&self) -> u64 {
        self.highest_received_offset
    }

    pub fn receive_window_offset(&self) -> u64 {
        self.receive_window_offset
    }

    pub fn max_receive_window(&self) -> u64 {
        self.max_receive_window
    }

    // ─── Enablement ─────────────────────────────────────────────────────

    /// Turn the controller into a no-op. There is no way back.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    // ─── Receive side ───────────────────────────────────────────────────

    /// Account for bytes the application consumed; may grant more window.
    pub fn add_bytes_consumed(&mut self, bytes: u64) -> Option<FlowSignal> {
        if !self.enabled {
            return None;
        }
        self.bytes_consumed += bytes;
        self.maybe_send_window_update()
    }

    fn maybe_send_window_update(&mut self) -> Option<FlowSignal> {
        let available = self.receive_window_offset.saturating_sub(self.bytes_consumed);
        if available >= self.max_receive_window / 2 {
            return None;
        }
        self.receive_window_offset += self.max_receive_window - available;
        trace!(
            scope = ?self.scope,
            id = %self.id,
            consumed = self.bytes_consumed,
            offset = self.receive_window_offset,
            "window update"
        );
        Some(FlowSignal::WindowUpdate {
            offset: self.receive_window_offset,
        })
    }

    /// Ratchet the highest offset received from the peer. Returns whether it
    /// moved.
    pub fn update_highest_received_offset(&mut self, offset: u64) -> bool {
        if !self.enabled || offset <= self.highest_received_offset {
            return false;
        }
        self.highest_received_offset = offset;
        true
    }

    /// Peer sent past the window we granted.
    pub fn flow_control_violation(&self) -> bool {
        self.highest_received_offset > self.receive_window_offset
    }

    // ─── Send side ──────────────────────────────────────────────────────

    /// Account for bytes handed to the transport. Overshooting the send
    /// window is a local bug: `bytes_sent` is clamped to the window and the
    /// caller must close the connection.
    pub fn add_bytes_sent(&mut self, bytes: u64) -> Result<(), ConnectionError> {
        if !self.enabled {
            return Ok(());
        }
        if self.bytes_sent + bytes > self.send_window_offset {
            error!(
                scope = ?self.scope,
                id = %self.id,
                bytes_sent = self.bytes_sent,
                bytes,
                send_window_offset = self.send_window_offset,
                "sent past the flow control window"
            );
            self.bytes_sent = self.send_window_offset;
            return Err(ConnectionError::new(
                ErrorCode::FlowControlSentTooMuchData,
                format!(
                    "{:?} {} sent {} bytes beyond offset {}",
                    self.scope, self.id, bytes, self.send_window_offset
                ),
            ));
        }
        self.bytes_sent += bytes;
        Ok(())
    }

    /// Apply a peer grant. Returns whether the offset moved.
    pub fn update_send_window_offset(&mut self, offset: u64) -> bool {
        if !self.enabled || offset <= self.send_window_offset {
            return false;
        }
        trace!(scope = ?self.scope, id = %self.id, offset, "send window raised");
        self.send_window_offset = offset;
        true
    }

    pub fn is_blocked(&self) -> bool {
        self.enabled && self.send_window_size() == 0
    }

    /// Blocked signal, raised at most once per send-window offset.
    pub fn maybe_send_blocked(&mut self) -> Option<FlowSignal> {
        if !self.is_blocked() || self.last_blocked_send_offset == Some(self.send_window_offset) {
            return None;
        }
        self.last_blocked_send_offset = Some(self.send_window_offset);
        trace!(scope = ?self.scope, id = %self.id, offset = self.send_window_offset, "blocked");
        Some(FlowSignal::Blocked)
    }
}
