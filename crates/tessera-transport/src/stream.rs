//! # Streams
//!
//! One reliable byte stream multiplexed on the connection. A stream owns
//! its flow controller, its outbound queue and its receive sequencer. It
//! never points back at the session: everything it needs from the
//! connection (the connection-level flow controller, the transport, the
//! write scheduler and the action queue) is lent to it per call through a
//! [`StreamContext`].
//!
//! ## Lifecycle
//!
//! ```text
//!  open ──fin sent / reset sent──▶ write side closed ─┐
//!   │                                                 ├──▶ closed (removed)
//!   └──fin read / reset received──▶ read side closed ─┘
//! ```
//!
//! Exactly one of fin or reset is sent before a stream is removed; closing
//! early synthesises a reset so the peer learns the final byte offset.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::Perspective;
use crate::error::{ConnectionError, ErrorCode, RstStreamCode};
use crate::flow_control::{FlowController, FlowSignal};
use crate::scheduler::{StreamPriority, WriteBlockedList};
use crate::session::{queue_signal, ConsumedData, SessionAction, StreamTransport};
use crate::stats::SessionStats;

// ─── Stream Id ──────────────────────────────────────────────────────────────

/// Stream identifier. Odd ids are client-initiated, even ids
/// server-initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Addresses the connection itself in blocked and window update signals.
    pub const CONNECTION: StreamId = StreamId(0);
    /// Handshake and control stream. Exists for the life of the session.
    pub const CONTROL: StreamId = StreamId(1);

    /// Which endpoint opens streams with this id.
    pub fn initiator(self) -> Perspective {
        if self.0 % 2 == 1 {
            Perspective::Client
        } else {
            Perspective::Server
        }
    }

    pub fn is_client_initiated(self) -> bool {
        self.initiator() == Perspective::Client
    }

    pub fn is_server_initiated(self) -> bool {
        self.0 != 0 && self.initiator() == Perspective::Server
    }

    /// First data stream id opened by `perspective`.
    pub fn first_data_stream(perspective: Perspective) -> StreamId {
        match perspective {
            Perspective::Client => StreamId(3),
            Perspective::Server => StreamId(2),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Sequencer ──────────────────────────────────────────────────────────────

/// Reassembles out-of-order stream frames into an in-order byte stream.
#[derive(Debug, Clone, Default)]
pub struct StreamSequencer {
    /// Frames waiting for the gap before them to fill, keyed by offset.
    frames: BTreeMap<u64, Bytes>,
    /// Next offset the application will read.
    read_offset: u64,
}

impl StreamSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes delivered to the application so far.
    pub fn bytes_read(&self) -> u64 {
        self.read_offset
    }

    /// Buffer a frame. Bytes already read are dropped; a duplicate offset
    /// keeps the longer frame.
    pub fn on_frame(&mut self, offset: u64, data: Bytes) {
        let end = offset + data.len() as u64;
        if end <= self.read_offset {
            return;
        }
        let (offset, data) = if offset < self.read_offset {
            let skip = (self.read_offset - offset) as usize;
            (self.read_offset, data.slice(skip..))
        } else {
            (offset, data)
        };
        match self.frames.get(&offset) {
            Some(existing) if existing.len() >= data.len() => {}
            _ => {
                self.frames.insert(offset, data);
            }
        }
    }

    /// Contiguous bytes available from the read offset.
    pub fn readable_bytes(&self) -> u64 {
        let mut cursor = self.read_offset;
        for (&offset, data) in &self.frames {
            if offset > cursor {
                break;
            }
            cursor = cursor.max(offset + data.len() as u64);
        }
        cursor - self.read_offset
    }

    /// Take up to `max` contiguous bytes.
    pub fn read(&mut self, max: usize) -> Bytes {
        let mut out = BytesMut::new();
        while out.len() < max {
            let Some(entry) = self.frames.first_entry() else {
                break;
            };
            let offset = *entry.key();
            if offset > self.read_offset {
                break;
            }
            let data = entry.get();
            let end = offset + data.len() as u64;
            if end <= self.read_offset {
                entry.remove();
                continue;
            }
            let skip = (self.read_offset - offset) as usize;
            let available = data.len() - skip;
            let take = available.min(max - out.len());
            out.extend_from_slice(&data[skip..skip + take]);
            self.read_offset += take as u64;
            if take == available {
                entry.remove();
            }
        }
        out.freeze()
    }

    /// Drop everything buffered; used when the stream is reset.
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn buffered_frames(&self) -> usize {
        self.frames.len()
    }
}

/// Offset one past the last byte of a frame. A peer offset that cannot
/// hold the data lies beyond any window.
pub(crate) fn frame_end(id: StreamId, offset: u64, len: usize) -> Result<u64, ConnectionError> {
    offset.checked_add(len as u64).ok_or_else(|| {
        ConnectionError::new(
            ErrorCode::FlowControlReceivedTooMuchData,
            format!("stream {id} frame at offset {offset} with {len} bytes overflows"),
        )
    })
}

// ─── Stream Context ─────────────────────────────────────────────────────────

/// Connection state lent to a stream for the duration of one call.
pub struct StreamContext<'a> {
    pub connection_flow: &'a mut FlowController,
    pub transport: &'a mut dyn StreamTransport,
    pub scheduler: &'a mut WriteBlockedList,
    pub actions: &'a mut VecDeque<SessionAction>,
    pub stats: &'a mut SessionStats,
    /// Bytes congestion control lets through during this call.
    pub congestion_budget: u64,
    /// Bytes the transport accepted during this call.
    pub written: u64,
}

impl StreamContext<'_> {
    pub(crate) fn mark_write_blocked(&mut self, id: StreamId, priority: StreamPriority) {
        if !self.scheduler.contains(id) {
            self.scheduler.push_back(id, priority);
        }
    }

    pub(crate) fn push_signal(&mut self, id: StreamId, signal: FlowSignal) {
        queue_signal(self.actions, self.stats, id, signal);
    }
}

// ─── Stream ─────────────────────────────────────────────────────────────────

pub struct Stream {
    id: StreamId,
    priority: StreamPriority,
    flow_controller: FlowController,
    /// Whether this stream's bytes count against the connection window.
    contributes_to_connection: bool,

    // ─── Write side ───
    /// Data accepted from the application but not yet consumed by the
    /// transport.
    queued: VecDeque<Bytes>,
    /// Offset of the next byte handed to the transport.
    stream_bytes_written: u64,
    /// Application asked for a fin after the queued data.
    fin_buffered: bool,
    fin_sent: bool,
    rst_sent: bool,

    // ─── Read side ───
    sequencer: StreamSequencer,
    /// Highest offset received, independent of flow control enablement.
    highest_received_offset: u64,
    /// Final offset learned from a fin or a reset.
    final_offset: Option<u64>,
    rst_received: bool,
    read_side_closed: bool,
}

impl Stream {
    pub fn new(
        id: StreamId,
        priority: StreamPriority,
        flow_controller: FlowController,
        contributes_to_connection: bool,
    ) -> Self {
        Stream {
            id,
            priority,
            flow_controller,
            contributes_to_connection,
            queued: VecDeque::new(),
            stream_bytes_written: 0,
            fin_buffered: false,
            fin_sent: false,
            rst_sent: false,
            sequencer: StreamSequencer::new(),
            highest_received_offset: 0,
            final_offset: None,
            rst_received: false,
            read_side_closed: false,
        }
    }

    // ─── Getters ────────────────────────────────────────────────────────

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn priority(&self) -> StreamPriority {
        self.priority
    }

    pub fn flow_controller(&self) -> &FlowController {
        &self.flow_controller
    }

    pub(crate) fn flow_controller_mut(&mut self) -> &mut FlowController {
        &mut self.flow_controller
    }

    pub fn contributes_to_connection(&self) -> bool {
        self.contributes_to_connection
    }

    pub fn stream_bytes_written(&self) -> u64 {
        self.stream_bytes_written
    }

    /// Bytes the application has read.
    pub fn stream_bytes_read(&self) -> u64 {
        self.sequencer.bytes_read()
    }

    /// Bytes queued for writing.
    pub fn queued_bytes(&self) -> u64 {
        self.queued.iter().map(|chunk| chunk.len() as u64).sum()
    }

    /// Queued data, or a fin that has not gone out yet.
    pub fn has_buffered_data(&self) -> bool {
        !self.queued.is_empty() || (self.fin_buffered && !self.fin_sent)
    }

    pub fn fin_sent(&self) -> bool {
        self.fin_sent
    }

    pub fn rst_sent(&self) -> bool {
        self.rst_sent
    }

    pub fn rst_received(&self) -> bool {
        self.rst_received
    }

    pub fn final_offset(&self) -> Option<u64> {
        self.final_offset
    }

    pub fn highest_received_offset(&self) -> u64 {
        self.highest_received_offset
    }

    pub fn readable_bytes(&self) -> u64 {
        self.sequencer.readable_bytes()
    }

    pub fn write_side_closed(&self) -> bool {
        self.fin_sent || self.rst_sent
    }

    pub fn read_side_closed(&self) -> bool {
        self.read_side_closed
    }

    /// Both directions are done; the session may drop the stream.
    pub fn is_finished(&self) -> bool {
        self.read_side_closed && self.write_side_closed()
    }

    // ─── Write path ─────────────────────────────────────────────────────

    /// Queue `data` (and optionally a fin) and try to send right away.
    /// Whatever the transport does not take waits in the queue; the stream
    /// registers with the scheduler when it needs another write attempt.
    pub fn write_or_buffer(
        &mut self,
        data: Bytes,
        fin: bool,
        ctx: &mut StreamContext<'_>,
    ) -> Result<(), ConnectionError> {
        if data.is_empty() && !fin {
            warn!(stream_id = %self.id, "empty write without fin ignored");
            return Ok(());
        }
        if self.fin_buffered || self.write_side_closed() {
            warn!(stream_id = %self.id, "write after fin or reset ignored");
            return Ok(());
        }
        self.fin_buffered = fin;
        let idle = self.queued.is_empty();
        if !data.is_empty() {
            self.queued.push_back(data);
        }
        if idle {
            self.write_buffered(ctx)?;
        }
        Ok(())
    }

    /// Write side readiness: retry queued data.
    pub fn on_can_write(&mut self, ctx: &mut StreamContext<'_>) -> Result<(), ConnectionError> {
        self.write_buffered(ctx)
    }

    fn write_buffered(&mut self, ctx: &mut StreamContext<'_>) -> Result<(), ConnectionError> {
        while let Some(chunk) = self.queued.front().cloned() {
            let fin = self.fin_buffered && self.queued.len() == 1;
            let consumed = self.writev_data(&chunk, fin, ctx)?;
            let done = consumed.bytes_consumed as usize == chunk.len();
            if done {
                self.queued.pop_front();
            } else if let Some(front) = self.queued.front_mut() {
                front.advance(consumed.bytes_consumed as usize);
            }
            if !done || (fin && !consumed.fin_consumed) {
                return Ok(());
            }
        }
        if self.fin_buffered && !self.fin_sent {
            self.writev_data(&[], true, ctx)?;
        }
        Ok(())
    }

    /// Hand as much of `data` to the transport as both flow-control scopes
    /// and the congestion budget allow.
    fn writev_data(
        &mut self,
        data: &[u8],
        fin: bool,
        ctx: &mut StreamContext<'_>,
    ) -> Result<ConsumedData, ConnectionError> {
        let fin_with_zero_data = fin && data.is_empty();

        let mut send_window = self.send_window();
        if self.contributes_to_connection && ctx.connection_flow.is_enabled() {
            send_window = send_window.min(ctx.connection_flow.send_window_size());
        }
        if send_window == 0 && !fin_with_zero_data {
            self.maybe_send_blocked(ctx);
            return Ok(ConsumedData::default());
        }

        let mut fin = fin;
        let mut flow_length = data.len() as u64;
        if flow_length > send_window {
            // No fin unless everything goes out.
            fin = false;
            flow_length = send_window;
        }
        let write_length = flow_length.min(ctx.congestion_budget);
        let write_fin = fin && write_length == flow_length;
        if write_length == 0 && !fin_with_zero_data {
            ctx.mark_write_blocked(self.id, self.priority);
            return Ok(ConsumedData::default());
        }

        let mut consumed = ctx.transport.writev_data(
            self.id,
            &data[..write_length as usize],
            self.stream_bytes_written,
            write_fin,
        );
        consumed.bytes_consumed = consumed.bytes_consumed.min(write_length);
        consumed.fin_consumed &= write_fin;

        let bytes = consumed.bytes_consumed;
        self.stream_bytes_written += bytes;
        ctx.congestion_budget = ctx.congestion_budget.saturating_sub(bytes);
        ctx.written += bytes;
        ctx.stats.stream_bytes_written += bytes;
        self.add_bytes_sent(bytes, ctx)?;
        trace!(stream_id = %self.id, bytes, fin = consumed.fin_consumed, "stream data written");

        if bytes == flow_length {
            if !fin_with_zero_data {
                self.maybe_send_blocked(ctx);
            }
            if fin && consumed.fin_consumed {
                self.fin_sent = true;
                debug!(stream_id = %self.id, offset = self.stream_bytes_written, "fin sent");
            } else if fin {
                ctx.mark_write_blocked(self.id, self.priority);
            }
        } else {
            ctx.mark_write_blocked(self.id, self.priority);
        }
        Ok(consumed)
    }

    fn send_window(&self) -> u64 {
        if self.flow_controller.is_enabled() {
            self.flow_controller.send_window_size()
        } else {
            u64::MAX
        }
    }

    fn add_bytes_sent(&mut self, bytes: u64, ctx: &mut StreamContext<'_>) -> Result<(), ConnectionError> {
        self.flow_controller.add_bytes_sent(bytes)?;
        if self.contributes_to_connection {
            ctx.connection_flow.add_bytes_sent(bytes)?;
        }
        Ok(())
    }

    fn maybe_send_blocked(&mut self, ctx: &mut StreamContext<'_>) {
        if let Some(signal) = self.flow_controller.maybe_send_blocked() {
            ctx.push_signal(self.id, signal);
        }
        if !self.contributes_to_connection {
            return;
        }
        if let Some(signal) = ctx.connection_flow.maybe_send_blocked() {
            ctx.push_signal(StreamId::CONNECTION, signal);
        }
        // Blocked only at the connection: a connection window update will
        // come through the scheduler.
        if ctx.connection_flow.is_blocked() && !self.flow_controller.is_blocked() && self.has_buffered_data() {
            ctx.mark_write_blocked(self.id, self.priority);
        }
    }

    /// Apply a peer grant for this stream. Returns whether the stream now
    /// wants a write attempt.
    pub fn on_window_update(&mut self, offset: u64) -> bool {
        self.flow_controller.update_send_window_offset(offset) && self.has_buffered_data()
    }

    // ─── Read path ──────────────────────────────────────────────────────

    /// Frame from the peer. Updates both flow-control scopes and buffers
    /// the data for the application.
    pub fn on_stream_frame(
        &mut self,
        offset: u64,
        data: Bytes,
        fin: bool,
        ctx: &mut StreamContext<'_>,
    ) -> Result<(), ConnectionError> {
        let end = frame_end(self.id, offset, data.len())?;
        if let Some(final_offset) = self.final_offset {
            if end > final_offset || (fin && end != final_offset) {
                return Err(ConnectionError::new(
                    ErrorCode::StreamFinalOffsetMismatch,
                    format!("stream {} data ends at {} past final offset {}", self.id, end, final_offset),
                ));
            }
        }
        if fin {
            if end < self.highest_received_offset {
                return Err(ConnectionError::new(
                    ErrorCode::StreamFinalOffsetMismatch,
                    format!(
                        "stream {} fin at {} below received offset {}",
                        self.id, end, self.highest_received_offset
                    ),
                ));
            }
            self.final_offset = Some(end);
        }

        self.maybe_increase_highest_received_offset(end, ctx);
        self.check_flow_control(ctx)?;

        if self.read_side_closed {
            trace!(stream_id = %self.id, "frame after read side closed dropped");
            return Ok(());
        }
        if !data.is_empty() {
            self.sequencer.on_frame(offset, data);
        }
        Ok(())
    }

    /// Peer reset. Counts like a fin for flow control but discards
    /// everything buffered.
    pub fn on_stream_reset(
        &mut self,
        code: RstStreamCode,
        final_offset: u64,
        ctx: &mut StreamContext<'_>,
    ) -> Result<(), ConnectionError> {
        let known = self.final_offset.is_some_and(|f| f != final_offset);
        if known || final_offset < self.highest_received_offset {
            return Err(ConnectionError::new(
                ErrorCode::StreamFinalOffsetMismatch,
                format!(
                    "stream {} reset at {} disagrees with received offset {}",
                    self.id,
                    final_offset,
                    self.final_offset.unwrap_or(self.highest_received_offset)
                ),
            ));
        }
        self.final_offset = Some(final_offset);
        self.maybe_increase_highest_received_offset(final_offset, ctx);
        self.check_flow_control(ctx)?;

        debug!(stream_id = %self.id, ?code, final_offset, "stream reset by peer");
        self.rst_received = true;
        self.sequencer.clear();
        self.queued.clear();
        self.read_side_closed = true;
        ctx.scheduler.remove(self.id);
        Ok(())
    }

    fn maybe_increase_highest_received_offset(&mut self, offset: u64, ctx: &mut StreamContext<'_>) {
        if offset <= self.highest_received_offset {
            return;
        }
        let increment = offset - self.highest_received_offset;
        self.highest_received_offset = offset;
        self.flow_controller.update_highest_received_offset(offset);
        if self.contributes_to_connection {
            let connection_offset = ctx
                .connection_flow
                .highest_received_offset()
                .saturating_add(increment);
            ctx.connection_flow.update_highest_received_offset(connection_offset);
        }
    }

    fn check_flow_control(&self, ctx: &StreamContext<'_>) -> Result<(), ConnectionError> {
        if self.flow_controller.flow_control_violation() {
            return Err(ConnectionError::new(
                ErrorCode::FlowControlReceivedTooMuchData,
                format!(
                    "stream {} received offset {} beyond window {}",
                    self.id,
                    self.flow_controller.highest_received_offset(),
                    self.flow_controller.receive_window_offset()
                ),
            ));
        }
        if self.contributes_to_connection && ctx.connection_flow.flow_control_violation() {
            return Err(ConnectionError::new(
                ErrorCode::FlowControlReceivedTooMuchData,
                format!(
                    "connection received offset {} beyond window {}",
                    ctx.connection_flow.highest_received_offset(),
                    ctx.connection_flow.receive_window_offset()
                ),
            ));
        }
        Ok(())
    }

    /// Application read. Consumption may grant window at either scope.
    pub fn read(&mut self, max: usize, ctx: &mut StreamContext<'_>) -> Bytes {
        if self.read_side_closed {
            return Bytes::new();
        }
        let data = self.sequencer.read(max);
        let bytes = data.len() as u64;
        if bytes > 0 {
            ctx.stats.stream_bytes_read += bytes;
            self.add_bytes_consumed(bytes, ctx);
        }
        if self.final_offset == Some(self.sequencer.bytes_read()) {
            debug!(stream_id = %self.id, "fin read");
            self.read_side_closed = true;
        }
        data
    }

    fn add_bytes_consumed(&mut self, bytes: u64, ctx: &mut StreamContext<'_>) {
        if let Some(signal) = self.flow_controller.add_bytes_consumed(bytes) {
            ctx.push_signal(self.id, signal);
        }
        if self.contributes_to_connection {
            if let Some(signal) = ctx.connection_flow.add_bytes_consumed(bytes) {
                ctx.push_signal(StreamId::CONNECTION, signal);
            }
        }
    }

    // ─── Close ──────────────────────────────────────────────────────────

    /// Send a reset and give up on the write side.
    pub fn reset(&mut self, code: RstStreamCode, ctx: &mut StreamContext<'_>) {
        if self.write_side_closed() {
            return;
        }
        self.rst_sent = true;
        self.queued.clear();
        ctx.scheduler.remove(self.id);
        ctx.stats.resets_sent += 1;
        ctx.actions.push_back(SessionAction::RstStream {
            stream_id: self.id,
            code,
            bytes_written: self.stream_bytes_written,
        });
    }

    /// Tear the stream down. Sends a reset if neither fin nor reset went
    /// out, and treats every received-but-unread byte as consumed at the
    /// connection so both ends agree on connection-level accounting.
    pub fn on_close(&mut self, ctx: &mut StreamContext<'_>) {
        if !self.fin_sent && !self.rst_sent {
            self.reset(RstStreamCode::FlowControlAccounting, ctx);
        }
        ctx.scheduler.remove(self.id);
        self.read_side_closed = true;

        let unconsumed = self.highest_received_offset.saturating_sub(self.sequencer.bytes_read());
        self.sequencer.clear();
        if unconsumed > 0 && self.contributes_to_connection {
            if let Some(signal) = ctx.connection_flow.add_bytes_consumed(unconsumed) {
                ctx.push_signal(StreamId::CONNECTION, signal);
            }
        }
    }
}
