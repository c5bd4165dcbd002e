//! # Session
//!
//! Owns everything connection-wide: the congestion controller, RTT
//! estimates, the connection-level flow controller, the write scheduler and
//! every stream (by value, keyed by id). Inbound events come in through the
//! `on_*` handlers; outbound control signals are queued as
//! [`SessionAction`]s and drained by the caller; stream bytes go out through
//! the [`StreamTransport`].
//!
//! ```text
//!   frames ──▶ on_stream_frame / on_rst_stream / on_window_update ──▶ Stream
//!   acks   ──▶ on_packet_sent / on_congestion_event ─────────────────▶ CongestionController
//!   ready  ──▶ on_can_write ──▶ WriteBlockedList ──▶ Stream ──▶ StreamTransport
//!                                                     │
//!                                  drain_actions() ◀──┘  blocked / window update / reset / close
//! ```
//!
//! A protocol violation or local accounting fault closes the connection:
//! a `ConnectionClose` action is queued and every later event is ignored.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use quanta::Clock;
use tracing::{debug, error, trace, warn};

use crate::config::{
    flow_control_enabled, Perspective, ProtocolVersion, TransportConfig, MIN_FLOW_CONTROL_WINDOW,
};
use crate::congestion::{CongestionController, PacketMap};
use crate::error::{ConnectionError, ErrorCode, RstStreamCode};
use crate::flow_control::{FlowController, FlowScope, FlowSignal};
use crate::rtt::RttStats;
use crate::scheduler::{StreamPriority, WriteBlockedList, DEFAULT_PRIORITY, HIGHEST_PRIORITY};
use crate::stats::{SessionStats, TransportStats};
use crate::stream::{frame_end, Stream, StreamContext, StreamId};

// ─── Transport Seam ─────────────────────────────────────────────────────────

/// What the transport accepted from one write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumedData {
    pub bytes_consumed: u64,
    pub fin_consumed: bool,
}

impl ConsumedData {
    pub fn new(bytes_consumed: u64, fin_consumed: bool) -> Self {
        ConsumedData {
            bytes_consumed,
            fin_consumed,
        }
    }
}

/// Packetiser below the session. May accept less than offered.
pub trait StreamTransport {
    fn writev_data(&mut self, id: StreamId, data: &[u8], offset: u64, fin: bool) -> ConsumedData;
}

// ─── Session Actions ────────────────────────────────────────────────────────

/// Control signal for the peer, queued until [`Session::drain_actions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Send window exhausted; [`StreamId::CONNECTION`] for the connection.
    SendBlocked { stream_id: StreamId },
    /// Receive window enlarged; [`StreamId::CONNECTION`] for the connection.
    SendWindowUpdate { stream_id: StreamId, offset: u64 },
    /// Connection is over.
    ConnectionClose { code: ErrorCode, details: String },
    /// Stream abandoned; `bytes_written` is our final offset.
    RstStream {
        stream_id: StreamId,
        code: RstStreamCode,
        bytes_written: u64,
    },
}

pub(crate) fn queue_signal(
    actions: &mut VecDeque<SessionAction>,
    stats: &mut SessionStats,
    stream_id: StreamId,
    signal: FlowSignal,
) {
    match signal {
        FlowSignal::Blocked => {
            stats.blocked_signals += 1;
            actions.push_back(SessionAction::SendBlocked { stream_id });
        }
        FlowSignal::WindowUpdate { offset } => {
            stats.window_updates += 1;
            actions.push_back(SessionAction::SendWindowUpdate { stream_id, offset });
        }
    }
}

/// Flow-control windows the peer advertised during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerConfig {
    /// Legacy single value, used for either scope when the split value is
    /// absent.
    pub initial_window: Option<u64>,
    pub initial_stream_window: Option<u64>,
    pub initial_session_window: Option<u64>,
}

// ─── Session ────────────────────────────────────────────────────────────────

pub struct Session<T: StreamTransport> {
    config: TransportConfig,
    version: ProtocolVersion,
    clock: Clock,
    transport: T,

    congestion: CongestionController,
    rtt: RttStats,
    /// Bytes the congestion controller counts as in flight.
    bytes_in_flight: u64,
    /// Bytes the transport accepted that have not been reported sent yet.
    pending_send_bytes: u64,

    connection_flow: FlowController,
    /// Send window for streams created from now on.
    peer_stream_window: u64,

    streams: HashMap<StreamId, Stream>,
    scheduler: WriteBlockedList,
    next_outgoing_id: StreamId,
    largest_peer_created: Option<StreamId>,
    /// Peer ids skipped over by a higher id; open but never referenced.
    implicitly_created: HashSet<StreamId>,
    /// Highest received offset of streams closed before their final offset
    /// arrived.
    locally_closed_highest_offset: HashMap<StreamId, u64>,

    actions: VecDeque<SessionAction>,
    closed: Option<ConnectionError>,
    stats: SessionStats,
}

impl<T: StreamTransport> Session<T> {
    pub fn new(config: TransportConfig, transport: T, clock: Clock) -> Self {
        let version = config.session.protocol_version;
        let flow = &config.flow_control;

        let mut connection_flow = FlowController::new(
            FlowScope::Connection,
            StreamId::CONNECTION,
            flow.initial_session_window,
            flow.max_session_receive_window,
        );
        if !flow_control_enabled(FlowScope::Connection, version, &config.features) {
            connection_flow.disable();
        }

        // The control stream is never flow controlled.
        let mut control_flow = FlowController::new(
            FlowScope::Stream,
            StreamId::CONTROL,
            flow.initial_stream_window,
            flow.max_stream_receive_window,
        );
        control_flow.disable();
        let mut streams = HashMap::new();
        streams.insert(
            StreamId::CONTROL,
            Stream::new(StreamId::CONTROL, HIGHEST_PRIORITY, control_flow, false),
        );

        Session {
            version,
            clock,
            transport,
            congestion: CongestionController::new(config.congestion.clone()),
            rtt: RttStats::new(),
            bytes_in_flight: 0,
            pending_send_bytes: 0,
            connection_flow,
            peer_stream_window: flow.initial_stream_window,
            streams,
            scheduler: WriteBlockedList::new(),
            next_outgoing_id: StreamId::first_data_stream(config.session.perspective),
            largest_peer_created: None,
            implicitly_created: HashSet::new(),
            locally_closed_highest_offset: HashMap::new(),
            actions: VecDeque::new(),
            closed: None,
            stats: SessionStats::new(),
            config,
        }
    }

    // ─── Getters ────────────────────────────────────────────────────────

    pub fn perspective(&self) -> Perspective {
        self.config.session.perspective
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Why the connection closed, if it has.
    pub fn close_error(&self) -> Option<&ConnectionError> {
        self.closed.as_ref()
    }

    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    /// Open data streams, not counting the control stream.
    pub fn num_open_streams(&self) -> usize {
        self.streams.len() - 1
    }

    pub fn congestion(&self) -> &CongestionController {
        &self.congestion
    }

    pub fn rtt_stats(&self) -> &RttStats {
        &self.rtt
    }

    pub fn connection_flow_controller(&self) -> &FlowController {
        &self.connection_flow
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    pub fn pending_send_bytes(&self) -> u64 {
        self.pending_send_bytes
    }

    /// Whether any stream waits for write readiness.
    pub fn has_pending_writes(&self) -> bool {
        self.scheduler.blocked_count() > 0
    }

    pub fn is_write_blocked(&self, id: StreamId) -> bool {
        self.scheduler.contains(id)
    }

    /// Queued control signals, oldest first.
    pub fn drain_actions(&mut self) -> impl Iterator<Item = SessionAction> + '_ {
        self.actions.drain(..)
    }

    pub fn pending_actions(&self) -> usize {
        self.actions.len()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            congestion: self.congestion.stats(),
            session: self.stats.clone(),
            srtt_us: self.rtt.smoothed_rtt().as_micros() as u64,
            bandwidth_estimate_bps: self.congestion.bandwidth_estimate(&self.rtt),
            open_streams: self.num_open_streams(),
        }
    }

    pub fn time_until_send(&self) -> Duration {
        self.congestion
            .time_until_send(self.clock.now(), self.bytes_in_flight + self.pending_send_bytes)
    }

    pub fn retransmission_delay(&self) -> Duration {
        self.congestion.retransmission_delay(&self.rtt)
    }

    // ─── Connection Close ───────────────────────────────────────────────

    /// Close the connection from the application side.
    pub fn close(&mut self, code: ErrorCode, details: impl Into<String>) {
        self.close_connection(ConnectionError::new(code, details));
    }

    fn close_connection(&mut self, err: ConnectionError) {
        if self.closed.is_some() {
            return;
        }
        if err.code.is_local() {
            error!(code = ?err.code, details = %err.details, "closing connection on local fault");
        } else {
            warn!(code = ?err.code, details = %err.details, "closing connection");
        }
        self.actions.push_back(SessionAction::ConnectionClose {
            code: err.code,
            details: err.details.clone(),
        });
        self.scheduler = WriteBlockedList::new();
        self.closed = Some(err);
    }

    fn finish(&mut self, result: Result<(), ConnectionError>) {
        if let Err(err) = result {
            self.close_connection(err);
        }
    }

    // ─── Stream Plumbing ────────────────────────────────────────────────

    /// Bytes congestion control lets `id` write right now.
    fn congestion_budget(&self, id: StreamId) -> u64 {
        if id == StreamId::CONTROL {
            return u64::MAX;
        }
        self.data_budget()
    }

    /// Bytes any data stream may write before the next send decision.
    fn data_budget(&self) -> u64 {
        let in_flight = self.bytes_in_flight + self.pending_send_bytes;
        if !self.congestion.can_send(self.clock.now(), in_flight) {
            return 0;
        }
        let mss = self.congestion.max_segment_size();
        if self.congestion.in_recovery() {
            // PRR approves one packet per decision. The next decision waits
            // until the packetiser reports this one through `on_packet_sent`.
            return mss.saturating_sub(self.pending_send_bytes);
        }
        self.congestion
            .congestion_window()
            .saturating_sub(in_flight)
            .max(mss)
    }

    /// Run `f` on a stream with the connection lent through a context.
    fn with_stream<R>(
        &mut self,
        id: StreamId,
        f: impl FnOnce(&mut Stream, &mut StreamContext<'_>) -> R,
    ) -> Option<R> {
        let congestion_budget = self.congestion_budget(id);
        let stream = self.streams.get_mut(&id)?;
        let mut ctx = StreamContext {
            connection_flow: &mut self.connection_flow,
            transport: &mut self.transport,
            scheduler: &mut self.scheduler,
            actions: &mut self.actions,
            stats: &mut self.stats,
            congestion_budget,
            written: 0,
        };
        let result = f(stream, &mut ctx);
        let written = ctx.written;
        self.pending_send_bytes += written;
        Some(result)
    }

    fn is_locally_initiated(&self, id: StreamId) -> bool {
        id.initiator() == self.perspective()
    }

    fn is_closed_stream(&self, id: StreamId) -> bool {
        if id == StreamId::CONTROL || self.streams.contains_key(&id) {
            return false;
        }
        if self.is_locally_initiated(id) {
            // Local ids are handed out in order.
            return id < self.next_outgoing_id;
        }
        self.largest_peer_created.is_some_and(|largest| id <= largest)
            && !self.implicitly_created.contains(&id)
    }

    fn insert_stream(&mut self, id: StreamId, priority: StreamPriority) {
        let mut flow = FlowController::new(
            FlowScope::Stream,
            id,
            self.peer_stream_window,
            self.config.flow_control.max_stream_receive_window,
        );
        if !flow_control_enabled(FlowScope::Stream, self.version, &self.config.features) {
            flow.disable();
        }
        self.streams.insert(id, Stream::new(id, priority, flow, true));
        self.stats.streams_opened += 1;
        debug!(stream_id = %id, priority, "stream opened");
    }

    /// Resolve a frame's stream id, opening peer streams on first
    /// reference. `Ok(false)` means the stream is already closed.
    fn get_or_create_stream(&mut self, id: StreamId) -> Result<bool, ConnectionError> {
        if id == StreamId::CONNECTION {
            return Err(ConnectionError::new(
                ErrorCode::InvalidStreamId,
                "stream id 0 is reserved",
            ));
        }
        if self.streams.contains_key(&id) {
            return Ok(true);
        }
        if self.is_closed_stream(id) {
            return Ok(false);
        }
        if self.is_locally_initiated(id) {
            return Err(ConnectionError::new(
                ErrorCode::InvalidStreamId,
                format!("frame for local stream {id} that was never opened"),
            ));
        }

        if !self.implicitly_created.remove(&id) {
            let first = StreamId::first_data_stream(id.initiator());
            let base = self
                .largest_peer_created
                .map_or(first.0.saturating_sub(2), |largest| largest.0);
            let delta = id.0.saturating_sub(base) as u64;
            if delta > self.config.session.max_stream_id_delta {
                return Err(ConnectionError::new(
                    ErrorCode::InvalidStreamId,
                    format!("stream id {id} jumps {delta} past {base}"),
                ));
            }
            for skipped in (base + 2..id.0).step_by(2) {
                self.implicitly_created.insert(StreamId(skipped));
            }
            self.largest_peer_created = Some(id);
        }

        let open = self.num_open_streams() + self.implicitly_created.len();
        if open >= self.config.session.max_open_streams {
            return Err(ConnectionError::new(
                ErrorCode::TooManyOpenStreams,
                format!("{open} streams open, limit {}", self.config.session.max_open_streams),
            ));
        }
        self.insert_stream(id, DEFAULT_PRIORITY);
        Ok(true)
    }

    /// Fold a final offset for an already-closed stream into connection
    /// accounting.
    fn update_flow_control_on_final_offset(
        &mut self,
        id: StreamId,
        final_offset: u64,
    ) -> Result<(), ConnectionError> {
        let Some(highest) = self.locally_closed_highest_offset.remove(&id) else {
            return Ok(());
        };
        if final_offset < highest {
            return Err(ConnectionError::new(
                ErrorCode::StreamFinalOffsetMismatch,
                format!("stream {id} final offset {final_offset} below received {highest}"),
            ));
        }
        let delta = final_offset - highest;
        trace!(stream_id = %id, final_offset, delta, "final offset for closed stream");

        let offset = self.connection_flow.highest_received_offset().saturating_add(delta);
        if self.connection_flow.update_highest_received_offset(offset)
            && self.connection_flow.flow_control_violation()
        {
            return Err(ConnectionError::new(
                ErrorCode::FlowControlReceivedTooMuchData,
                format!(
                    "connection received offset {} beyond window {}",
                    offset,
                    self.connection_flow.receive_window_offset()
                ),
            ));
        }
        if let Some(signal) = self.connection_flow.add_bytes_consumed(delta) {
            queue_signal(&mut self.actions, &mut self.stats, StreamId::CONNECTION, signal);
        }
        Ok(())
    }

    fn close_stream_inner(&mut self, id: StreamId) {
        if self.with_stream(id, |stream, ctx| stream.on_close(ctx)).is_none() {
            return;
        }
        if let Some(stream) = self.streams.remove(&id) {
            if stream.final_offset().is_none() {
                self.locally_closed_highest_offset
                    .insert(id, stream.highest_received_offset());
            }
            self.stats.streams_closed += 1;
            debug!(
                stream_id = %id,
                written = stream.stream_bytes_written(),
                read = stream.stream_bytes_read(),
                "stream closed"
            );
        }
    }

    fn maybe_close_finished(&mut self, id: StreamId) {
        if id == StreamId::CONTROL {
            return;
        }
        if self.streams.get(&id).is_some_and(Stream::is_finished) {
            self.close_stream_inner(id);
        }
    }

    fn mark_write_blocked(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get(&id) else {
            return;
        };
        if !self.scheduler.contains(id) {
            self.scheduler.push_back(id, stream.priority());
        }
    }

    // ─── Application API ────────────────────────────────────────────────

    /// Open the next locally-initiated stream. `None` when the session is
    /// closed or the open-stream limit is reached.
    pub fn create_outgoing_stream(&mut self, priority: StreamPriority) -> Option<StreamId> {
        if self.closed.is_some() {
            return None;
        }
        if self.num_open_streams() >= self.config.session.max_open_streams {
            warn!(limit = self.config.session.max_open_streams, "open stream limit reached");
            return None;
        }
        let id = self.next_outgoing_id;
        self.next_outgoing_id = StreamId(id.0 + 2);
        self.insert_stream(id, priority);
        Some(id)
    }

    /// Queue data on a stream and try to send it. Returns false when the
    /// stream does not exist or the session is closed.
    pub fn write_stream(&mut self, id: StreamId, data: Bytes, fin: bool) -> bool {
        if self.closed.is_some() {
            return false;
        }
        let Some(result) = self.with_stream(id, |stream, ctx| stream.write_or_buffer(data, fin, ctx))
        else {
            return false;
        };
        if let Err(err) = result {
            self.close_connection(err);
            return false;
        }
        self.maybe_close_finished(id);
        true
    }

    /// Read up to `max` in-order bytes.
    pub fn read_stream(&mut self, id: StreamId, max: usize) -> Option<Bytes> {
        if self.closed.is_some() {
            return None;
        }
        let data = self.with_stream(id, |stream, ctx| stream.read(max, ctx))?;
        self.maybe_close_finished(id);
        Some(data)
    }

    /// Close a stream from the application. A reset goes out when neither a
    /// fin nor a reset was sent.
    pub fn close_stream(&mut self, id: StreamId) {
        if id == StreamId::CONTROL {
            warn!("refusing to close the control stream");
            return;
        }
        self.close_stream_inner(id);
    }

    /// Abandon a stream with `code`.
    pub fn reset_stream(&mut self, id: StreamId, code: RstStreamCode) {
        if id == StreamId::CONTROL || self.closed.is_some() {
            return;
        }
        if self.with_stream(id, |stream, ctx| stream.reset(code, ctx)).is_some() {
            self.close_stream_inner(id);
        }
    }

    // ─── Inbound Frames ─────────────────────────────────────────────────

    pub fn on_stream_frame(&mut self, id: StreamId, offset: u64, data: Bytes, fin: bool) {
        if self.closed.is_some() {
            return;
        }
        let result = self.process_stream_frame(id, offset, data, fin);
        self.finish(result);
    }

    fn process_stream_frame(
        &mut self,
        id: StreamId,
        offset: u64,
        data: Bytes,
        fin: bool,
    ) -> Result<(), ConnectionError> {
        if !self.get_or_create_stream(id)? {
            if fin {
                let end = frame_end(id, offset, data.len())?;
                self.update_flow_control_on_final_offset(id, end)?;
            }
            trace!(stream_id = %id, offset, "frame for closed stream dropped");
            return Ok(());
        }
        self.with_stream(id, |stream, ctx| stream.on_stream_frame(offset, data, fin, ctx))
            .transpose()?;
        self.maybe_close_finished(id);
        Ok(())
    }

    pub fn on_rst_stream(&mut self, id: StreamId, code: RstStreamCode, final_offset: u64) {
        if self.closed.is_some() {
            return;
        }
        let result = self.process_rst_stream(id, code, final_offset);
        self.finish(result);
    }

    fn process_rst_stream(
        &mut self,
        id: StreamId,
        code: RstStreamCode,
        final_offset: u64,
    ) -> Result<(), ConnectionError> {
        if id == StreamId::CONTROL {
            return Err(ConnectionError::new(
                ErrorCode::InvalidStreamId,
                "attempt to reset the control stream",
            ));
        }
        if !self.get_or_create_stream(id)? {
            return self.update_flow_control_on_final_offset(id, final_offset);
        }
        self.stats.resets_received += 1;
        self.with_stream(id, |stream, ctx| stream.on_stream_reset(code, final_offset, ctx))
            .transpose()?;
        self.close_stream_inner(id);
        Ok(())
    }

    /// Peer grant for a stream, or for the connection when `id` is
    /// [`StreamId::CONNECTION`].
    pub fn on_window_update(&mut self, id: StreamId, offset: u64) {
        if self.closed.is_some() {
            return;
        }
        let result = self.process_window_update(id, offset);
        self.finish(result);
    }

    fn process_window_update(&mut self, id: StreamId, offset: u64) -> Result<(), ConnectionError> {
        if id == StreamId::CONNECTION {
            if self.connection_flow.update_send_window_offset(offset) {
                debug!(offset, "connection send window raised");
            }
            return Ok(());
        }
        if !self.get_or_create_stream(id)? {
            return Ok(());
        }
        let wants_write = self
            .streams
            .get_mut(&id)
            .is_some_and(|stream| stream.on_window_update(offset));
        if wants_write {
            self.mark_write_blocked(id);
        }
        Ok(())
    }

    // ─── Negotiation ────────────────────────────────────────────────────

    /// Apply the peer's flow-control windows.
    pub fn on_config_negotiated(&mut self, peer: PeerConfig) {
        if self.closed.is_some() {
            return;
        }
        let result = self.apply_peer_config(peer);
        self.finish(result);
    }

    fn apply_peer_config(&mut self, peer: PeerConfig) -> Result<(), ConnectionError> {
        let stream_window = peer.initial_stream_window.or(peer.initial_window);
        let session_window = peer.initial_session_window.or(peer.initial_window);

        for (scope, window) in [("stream", stream_window), ("session", session_window)] {
            if let Some(window) = window.filter(|&w| w < MIN_FLOW_CONTROL_WINDOW) {
                return Err(ConnectionError::new(
                    ErrorCode::FlowControlInvalidWindow,
                    format!("peer {scope} window {window} below minimum {MIN_FLOW_CONTROL_WINDOW}"),
                ));
            }
        }

        if let Some(window) = stream_window {
            self.peer_stream_window = window;
            for (&id, stream) in self.streams.iter_mut() {
                if id == StreamId::CONTROL {
                    continue;
                }
                if stream.on_window_update(window) && !self.scheduler.contains(id) {
                    self.scheduler.push_back(id, stream.priority());
                }
            }
        }
        if let Some(window) = session_window {
            self.connection_flow.update_send_window_offset(window);
        }
        debug!(?stream_window, ?session_window, "peer config applied");
        Ok(())
    }

    /// Disable every flow controller whose scope `version` does not support.
    pub fn on_version_negotiated(&mut self, version: ProtocolVersion) {
        self.version = version;
        let features = &self.config.features;
        if !flow_control_enabled(FlowScope::Stream, version, features) {
            for stream in self.streams.values_mut() {
                stream.flow_controller_mut().disable();
            }
        }
        if !flow_control_enabled(FlowScope::Connection, version, features) {
            self.connection_flow.disable();
        }
        debug!(version = version.0, "version negotiated");
    }

    // ─── Write Readiness ────────────────────────────────────────────────

    /// The transport can take more data. Services blocked streams in
    /// scheduler order while congestion control allows. Returns whether any
    /// stream still waits.
    pub fn on_can_write(&mut self) -> bool {
        if self.closed.is_some() {
            return false;
        }

        // Only the control stream may write past a blocked connection.
        if self.connection_flow.is_blocked() {
            if self.scheduler.has_control_stream_blocked() {
                self.scheduler.remove(StreamId::CONTROL);
                self.write_blocked_stream(StreamId::CONTROL);
            }
            return self.has_pending_writes();
        }

        let num_writes = self.scheduler.blocked_count();
        for _ in 0..num_writes {
            if !self.scheduler.has_control_stream_blocked() && self.data_budget() == 0 {
                break;
            }
            let Some(id) = self.scheduler.pop_front() else {
                break;
            };
            self.write_blocked_stream(id);
            if self.closed.is_some() {
                return false;
            }
        }
        self.has_pending_writes()
    }

    fn write_blocked_stream(&mut self, id: StreamId) {
        let result = self
            .with_stream(id, |stream, ctx| stream.on_can_write(ctx))
            .transpose();
        match result {
            Ok(_) => self.maybe_close_finished(id),
            Err(err) => self.close_connection(err),
        }
    }

    // ─── Packet Accounting ──────────────────────────────────────────────

    /// A packet left. Returns whether it counts toward bytes in flight.
    pub fn on_packet_sent(&mut self, sequence: u64, bytes: u64, retransmittable: bool) -> bool {
        if retransmittable {
            self.pending_send_bytes = self.pending_send_bytes.saturating_sub(bytes);
        }
        let tracked = self.congestion.on_packet_sent(
            self.clock.now(),
            self.bytes_in_flight,
            sequence,
            bytes,
            retransmittable,
        );
        if tracked {
            self.bytes_in_flight += bytes;
            self.stats.packets_sent += 1;
        }
        tracked
    }

    /// Acks and losses from loss detection. The RTT is sampled from the
    /// largest newly acked packet.
    pub fn on_congestion_event(&mut self, acked: &PacketMap, lost: &PacketMap, ack_delay: Duration) {
        let now = self.clock.now();
        let samples_before = self.rtt.sample_count();
        if let Some((_, largest)) = acked.last_key_value() {
            self.rtt
                .update_rtt(now.saturating_duration_since(largest.sent_time), ack_delay);
        }
        let rtt_updated = self.rtt.sample_count() > samples_before;

        let prior_in_flight = self.bytes_in_flight;
        self.congestion
            .on_congestion_event(now, rtt_updated, prior_in_flight, acked, lost, &self.rtt);

        let removed: u64 = acked.values().chain(lost.values()).map(|p| p.bytes).sum();
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(removed);
        self.stats.packets_acked += acked.len() as u64;
        self.stats.packets_lost += lost.len() as u64;
    }

    pub fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.congestion.on_retransmission_timeout(packets_retransmitted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts everything.
    #[derive(Default)]
    struct SinkTransport {
        writes: Vec<(StreamId, u64, usize, bool)>,
    }

    impl StreamTransport for SinkTransport {
        fn writev_data(&mut self, id: StreamId, data: &[u8], offset: u64, fin: bool) -> ConsumedData {
            self.writes.push((id, offset, data.len(), fin));
            ConsumedData::new(data.len() as u64, fin)
        }
    }

    fn session(perspective: Perspective) -> Session<SinkTransport> {
        let mut config = TransportConfig::default();
        config.session.perspective = perspective;
        let (clock, _mock) = Clock::mock();
        Session::new(config, SinkTransport::default(), clock)
    }

    #[test]
    fn outgoing_ids_follow_perspective() {
        let mut client = session(Perspective::Client);
        assert_eq!(client.create_outgoing_stream(DEFAULT_PRIORITY), Some(StreamId(3)));
        assert_eq!(client.create_outgoing_stream(DEFAULT_PRIORITY), Some(StreamId(5)));

        let mut server = session(Perspective::Server);
        assert_eq!(server.create_outgoing_stream(DEFAULT_PRIORITY), Some(StreamId(2)));
        assert_eq!(server.create_outgoing_stream(DEFAULT_PRIORITY), Some(StreamId(4)));
    }

    #[test]
    fn control_stream_exists_and_bypasses_flow_control() {
        let mut s = session(Perspective::Client);
        let control = s.stream(StreamId::CONTROL).unwrap();
        assert!(!control.flow_controller().is_enabled());
        assert!(!control.contributes_to_connection());
        assert_eq!(s.num_open_streams(), 0);

        // Larger than either flow-control window.
        assert!(s.write_stream(StreamId::CONTROL, Bytes::from(vec![0u8; 64 * 1024]), false));
        assert_eq!(s.stream(StreamId::CONTROL).unwrap().stream_bytes_written(), 64 * 1024);
        assert_eq!(s.connection_flow_controller().bytes_sent(), 0);
    }

    #[test]
    fn implicit_peer_streams() {
        let mut server = session(Perspective::Server);
        server.on_stream_frame(StreamId(9), 0, Bytes::from_static(b"x"), false);
        assert!(!server.is_closed());
        assert!(server.stream(StreamId(9)).is_some());
        // 3, 5 and 7 are open but not yet materialised.
        assert!(server.stream(StreamId(5)).is_none());
        server.on_stream_frame(StreamId(5), 0, Bytes::from_static(b"y"), false);
        assert!(server.stream(StreamId(5)).is_some());
        assert!(!server.is_closed());
    }

    #[test]
    fn never_opened_local_stream_is_fatal() {
        let mut client = session(Perspective::Client);
        client.on_stream_frame(StreamId(7), 0, Bytes::from_static(b"x"), false);
        assert_eq!(client.close_error().unwrap().code, ErrorCode::InvalidStreamId);
        let actions: Vec<_> = client.drain_actions().collect();
        assert!(matches!(
            actions.as_slice(),
            [SessionAction::ConnectionClose { code: ErrorCode::InvalidStreamId, .. }]
        ));
    }

    #[test]
    fn events_after_close_are_ignored() {
        let mut client = session(Perspective::Client);
        client.on_rst_stream(StreamId::CONTROL, RstStreamCode::Cancelled, 0);
        assert!(client.is_closed());
        client.drain_actions().for_each(drop);

        client.on_stream_frame(StreamId(2), 0, Bytes::from_static(b"x"), false);
        client.on_window_update(StreamId::CONNECTION, 1 << 20);
        assert_eq!(client.pending_actions(), 0);
        assert!(client.create_outgoing_stream(DEFAULT_PRIORITY).is_none());
    }

    #[test]
    fn packet_accounting_moves_pending_into_flight() {
        let mut s = session(Perspective::Client);
        let id = s.create_outgoing_stream(DEFAULT_PRIORITY).unwrap();
        s.write_stream(id, Bytes::from(vec![1u8; 3000]), false);
        assert_eq!(s.pending_send_bytes(), 3000);

        assert!(s.on_packet_sent(1, 1460, true));
        assert!(s.on_packet_sent(2, 1460, true));
        assert!(!s.on_packet_sent(3, 40, false));
        assert_eq!(s.pending_send_bytes(), 80);
        assert_eq!(s.bytes_in_flight(), 2920);
        assert_eq!(s.stats().session.packets_sent, 2);
    }
}
