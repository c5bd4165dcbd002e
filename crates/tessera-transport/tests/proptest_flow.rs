//! Property-based tests for flow control, scheduling, reassembly and the
//! congestion window bounds.
//!
//! These exercise the building blocks directly, with arbitrary frame
//! splits, grant orders and ack/loss patterns.

use std::collections::BTreeMap;

use bytes::Bytes;
use proptest::prelude::*;
use quanta::Clock;
use tessera_transport::config::{CongestionConfig, GrowthMode};
use tessera_transport::congestion::{CongestionController, PacketMap, SentPacket};
use tessera_transport::flow_control::{FlowController, FlowScope, FlowSignal};
use tessera_transport::rtt::RttStats;
use tessera_transport::scheduler::WriteBlockedList;
use tessera_transport::stream::{StreamId, StreamSequencer};

// ─── Receive Window ─────────────────────────────────────────────────────────

proptest! {
    /// A receiver that consumes everything it is sent never sees a
    /// violation, and after each read at least half the window is open.
    #[test]
    fn receive_window_stays_at_least_half_open(
        max_window in 1024u64..=256 * 1024,
        fractions in prop::collection::vec(0.0f64..=1.0, 1..64),
    ) {
        let mut fc = FlowController::new(FlowScope::Stream, StreamId(3), max_window, max_window);
        let mut last_offset = fc.receive_window_offset();

        for fraction in fractions {
            let available = fc.receive_window_offset() - fc.highest_received_offset();
            let chunk = (available as f64 * fraction) as u64;
            let end = fc.highest_received_offset() + chunk;
            fc.update_highest_received_offset(end);
            prop_assert!(!fc.flow_control_violation());

            let unread = fc.highest_received_offset() - fc.bytes_consumed();
            if let Some(FlowSignal::WindowUpdate { offset }) = fc.add_bytes_consumed(unread) {
                prop_assert!(offset > last_offset);
                prop_assert_eq!(offset, fc.bytes_consumed() + max_window);
            }
            prop_assert!(fc.receive_window_offset() >= last_offset);
            prop_assert!(fc.receive_window_offset() - fc.bytes_consumed() >= max_window / 2);
            last_offset = fc.receive_window_offset();
        }
    }

    /// Violation is exactly "received past the granted offset".
    #[test]
    fn violation_iff_past_window(max_window in 1024u64..=65536, offset in 0u64..=200_000) {
        let mut fc = FlowController::new(FlowScope::Connection, StreamId::CONNECTION, max_window, max_window);
        fc.update_highest_received_offset(offset);
        prop_assert_eq!(fc.flow_control_violation(), offset > max_window);
    }
}

// ─── Send Window ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum SendOp {
    Send(u64),
    Grant(u64),
    Poll,
}

fn send_op() -> impl Strategy<Value = SendOp> {
    prop_oneof![
        (1u64..=4096).prop_map(SendOp::Send),
        (0u64..=8192).prop_map(SendOp::Grant),
        Just(SendOp::Poll),
    ]
}

proptest! {
    /// Sending only within the window never errors, and the blocked signal
    /// fires at most once per send-window offset.
    #[test]
    fn blocked_signal_once_per_offset(
        initial in 1u64..=16384,
        ops in prop::collection::vec(send_op(), 1..128),
    ) {
        let mut fc = FlowController::new(FlowScope::Stream, StreamId(5), initial, 16384);
        let mut signalled_at = Vec::new();

        for op in ops {
            match op {
                SendOp::Send(n) => {
                    let n = n.min(fc.send_window_size());
                    prop_assert!(fc.add_bytes_sent(n).is_ok());
                }
                SendOp::Grant(extra) => {
                    let before = fc.send_window_offset();
                    let moved = fc.update_send_window_offset(before + extra);
                    prop_assert_eq!(moved, extra > 0);
                }
                SendOp::Poll => {
                    if fc.maybe_send_blocked().is_some() {
                        prop_assert!(fc.is_blocked());
                        prop_assert!(!signalled_at.contains(&fc.send_window_offset()));
                        signalled_at.push(fc.send_window_offset());
                    }
                }
            }
            prop_assert!(fc.bytes_sent() <= fc.send_window_offset());
        }
    }
}

// ─── Scheduler ──────────────────────────────────────────────────────────────

proptest! {
    /// Pops come out by priority, FIFO within a priority.
    #[test]
    fn scheduler_orders_by_priority_then_arrival(
        priorities in prop::collection::vec(0u8..=7, 1..64),
        with_control in any::<bool>(),
    ) {
        let mut list = WriteBlockedList::new();
        let mut expected: Vec<(u8, usize, StreamId)> = Vec::new();
        for (arrival, &priority) in priorities.iter().enumerate() {
            let id = StreamId(3 + 2 * arrival as u32);
            list.push_back(id, priority);
            expected.push((priority, arrival, id));
        }
        if with_control {
            list.push_back(StreamId::CONTROL, 7);
        }
        expected.sort();

        let mut popped: Vec<StreamId> = std::iter::from_fn(|| list.pop_front()).collect();
        if with_control {
            prop_assert_eq!(popped.remove(0), StreamId::CONTROL);
        }
        let want: Vec<StreamId> = expected.into_iter().map(|(_, _, id)| id).collect();
        prop_assert_eq!(popped, want);
        prop_assert_eq!(list.blocked_count(), 0);
    }
}

// ─── Reassembly ─────────────────────────────────────────────────────────────

proptest! {
    /// Any split of a payload, delivered in any order with duplicates,
    /// reads back as the original bytes.
    #[test]
    fn sequencer_reassembles_any_delivery_order(
        data in prop::collection::vec(any::<u8>(), 1..2048),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..16),
        order in any::<prop::sample::Index>(),
        duplicate in any::<prop::sample::Index>(),
        read_size in 1usize..=512,
    ) {
        let mut bounds: Vec<usize> = cuts.iter().map(|c| c.index(data.len())).collect();
        bounds.push(0);
        bounds.push(data.len());
        bounds.sort_unstable();
        bounds.dedup();

        let payload = Bytes::from(data.clone());
        let mut frames: Vec<(u64, Bytes)> = bounds
            .windows(2)
            .map(|w| (w[0] as u64, payload.slice(w[0]..w[1])))
            .collect();
        let rotate = order.index(frames.len());
        frames.rotate_left(rotate);
        let dup = frames[duplicate.index(frames.len())].clone();
        frames.push(dup);

        let mut seq = StreamSequencer::new();
        let mut out = Vec::with_capacity(data.len());
        for (offset, frame) in frames {
            seq.on_frame(offset, frame);
            loop {
                let chunk = seq.read(read_size);
                if chunk.is_empty() {
                    break;
                }
                out.extend_from_slice(&chunk);
            }
        }
        prop_assert_eq!(out, data);
        prop_assert_eq!(seq.readable_bytes(), 0);
    }
}

// ─── Congestion Window Bounds ───────────────────────────────────────────────

proptest! {
    /// Whatever the ack/loss pattern, the window stays within its bounds.
    #[test]
    fn congestion_window_within_bounds(
        reno in any::<bool>(),
        rounds in prop::collection::vec(prop::collection::vec(any::<bool>(), 1..40), 1..40),
    ) {
        let config = CongestionConfig {
            growth: if reno { GrowthMode::Reno } else { GrowthMode::Cubic },
            max_window_packets: 200,
            ..CongestionConfig::default()
        };
        let min = config.min_window();
        let max = config.max_window();
        let mss = config.max_segment_size;
        let mut cc = CongestionController::new(config);
        let (clock, mock) = Clock::mock();
        let mut rtt = RttStats::new();
        let mut sequence = 0u64;

        for outcomes in rounds {
            let mut sent = BTreeMap::new();
            let mut in_flight = 0u64;
            for _ in &outcomes {
                sequence += 1;
                cc.on_packet_sent(clock.now(), in_flight, sequence, mss, true);
                sent.insert(sequence, SentPacket { bytes: mss, sent_time: clock.now() });
                in_flight += mss;
            }
            mock.increment(std::time::Duration::from_millis(30));
            rtt.update_rtt(std::time::Duration::from_millis(30), std::time::Duration::ZERO);

            let mut acked = PacketMap::new();
            let mut lost = PacketMap::new();
            for ((seq, packet), delivered) in sent.into_iter().zip(outcomes) {
                if delivered {
                    acked.insert(seq, packet);
                } else {
                    lost.insert(seq, packet);
                }
            }
            cc.on_congestion_event(clock.now(), true, in_flight, &acked, &lost, &rtt);

            let cwnd = cc.congestion_window();
            prop_assert!(cwnd >= min, "cwnd {} below min {}", cwnd, min);
            prop_assert!(cwnd <= max, "cwnd {} above max {}", cwnd, max);
        }
    }
}
