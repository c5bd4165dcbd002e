//! Per-event processing latency benchmarks for tessera-transport.
//!
//! Measures the hot-path components touched on every packet or frame:
//! - CongestionController ack processing (Reno and cubic)
//! - CongestionController send gate
//! - FlowController consume/grant
//! - WriteBlockedList push/pop
//! - Session write + can-write cycle across many streams
//!
//! Run with: cargo bench --package tessera-transport

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use quanta::Clock;
use std::time::Duration;

use tessera_transport::config::{CongestionConfig, GrowthMode, TransportConfig};
use tessera_transport::congestion::{CongestionController, PacketMap, SentPacket};
use tessera_transport::flow_control::{FlowController, FlowScope};
use tessera_transport::rtt::RttStats;
use tessera_transport::scheduler::WriteBlockedList;
use tessera_transport::session::{ConsumedData, Session, StreamTransport};
use tessera_transport::stream::StreamId;

// ─── Congestion Control ──────────────────────────────────────────────────

fn bench_congestion_ack(c: &mut Criterion) {
    let mut group = c.benchmark_group("congestion_ack");
    let (clock, _mock) = Clock::mock();
    let mut rtt = RttStats::new();
    rtt.update_rtt(Duration::from_millis(40), Duration::ZERO);

    for (name, growth) in [("reno", GrowthMode::Reno), ("cubic", GrowthMode::Cubic)] {
        group.throughput(Throughput::Elements(32));
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let config = CongestionConfig {
                        growth,
                        ..CongestionConfig::default()
                    };
                    let mss = config.max_segment_size;
                    // Out of slow start so the growth function runs.
                    let mut cc = CongestionController::with_state(config, 40 * mss, 40 * mss);
                    let mut acked = PacketMap::new();
                    for seq in 1..=32u64 {
                        cc.on_packet_sent(clock.now(), (seq - 1) * mss, seq, mss, true);
                        acked.insert(
                            seq,
                            SentPacket {
                                bytes: mss,
                                sent_time: clock.now(),
                            },
                        );
                    }
                    (cc, acked)
                },
                |(mut cc, acked)| {
                    cc.on_congestion_event(
                        clock.now(),
                        true,
                        40 * 1460,
                        &acked,
                        &PacketMap::new(),
                        &rtt,
                    );
                    black_box(cc.congestion_window());
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_send_gate(c: &mut Criterion) {
    let (clock, _mock) = Clock::mock();
    let cc = CongestionController::new(CongestionConfig::default());
    c.bench_function("congestion_time_until_send", |b| {
        let mut in_flight = 0u64;
        b.iter(|| {
            in_flight = (in_flight + 1460) % (20 * 1460);
            black_box(cc.time_until_send(clock.now(), black_box(in_flight)));
        });
    });
}

// ─── Flow Control ────────────────────────────────────────────────────────

fn bench_flow_consume(c: &mut Criterion) {
    c.bench_function("flow_control_consume_1200B", |b| {
        let mut fc = FlowController::new(FlowScope::Stream, StreamId(3), 16384, 65536);
        b.iter(|| {
            let end = fc.highest_received_offset() + 1200;
            fc.update_highest_received_offset(end);
            black_box(fc.flow_control_violation());
            black_box(fc.add_bytes_consumed(1200));
        });
    });
}

// ─── Scheduler ───────────────────────────────────────────────────────────

fn bench_scheduler(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_blocked_list");
    for streams in [8u32, 64, 256] {
        group.throughput(Throughput::Elements(streams as u64));
        group.bench_function(format!("push_pop_{streams}"), |b| {
            let mut list = WriteBlockedList::new();
            b.iter(|| {
                for n in 0..streams {
                    list.push_back(StreamId(3 + 2 * n), (n % 8) as u8);
                }
                while let Some(id) = list.pop_front() {
                    black_box(id);
                }
            });
        });
    }
    group.finish();
}

// ─── Session ─────────────────────────────────────────────────────────────

struct NullTransport;

impl StreamTransport for NullTransport {
    fn writev_data(&mut self, _id: StreamId, data: &[u8], _offset: u64, fin: bool) -> ConsumedData {
        ConsumedData::new(data.len() as u64, fin)
    }
}

fn bench_session_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_write");
    let chunk = Bytes::from(vec![0xAB; 1200]);

    for streams in [4usize, 32] {
        group.throughput(Throughput::Bytes((streams * chunk.len()) as u64));
        group.bench_function(format!("streams_{streams}"), |b| {
            b.iter_batched(
                || {
                    let mut config = TransportConfig::default();
                    config.congestion.initial_window_packets = 1000;
                    let (clock, _mock) = Clock::mock();
                    let mut session = Session::new(config, NullTransport, clock);
                    let ids: Vec<StreamId> = (0..streams)
                        .filter_map(|_| session.create_outgoing_stream(3))
                        .collect();
                    (session, ids)
                },
                |(mut session, ids)| {
                    for &id in &ids {
                        session.write_stream(id, chunk.clone(), false);
                    }
                    black_box(session.on_can_write());
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_congestion_ack,
    bench_send_gate,
    bench_flow_consume,
    bench_scheduler,
    bench_session_write,
);
criterion_main!(benches);
