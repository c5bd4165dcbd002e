//! # Tessera Simulator
//!
//! Drives a client session over a simulated path with a fixed RTT and
//! deterministic loss, on a mock clock. Each round sends whatever the
//! congestion and flow-control windows allow, then acknowledges the round
//! one RTT later. The peer re-grants flow-control window every round.
//! Final statistics go to stdout as JSON.
//!
//! ## Usage
//!
//! ```bash
//! # Four streams of 1 MB each, 40 ms RTT, every 50th packet lost
//! tessera-sim --streams 4 --bytes 1000000 --rtt-ms 40 --loss-every 50
//!
//! # Reno growth from a TOML config
//! tessera-sim --config reno.toml --rounds 500
//! ```

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use quanta::Clock;

use tessera_transport::config::TransportConfig;
use tessera_transport::congestion::{PacketMap, SentPacket};
use tessera_transport::scheduler::DEFAULT_PRIORITY;
use tessera_transport::session::{ConsumedData, Session, SessionAction, StreamTransport};
use tessera_transport::stream::StreamId;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => TransportConfig::from_file(path)?,
        None => TransportConfig::default(),
    };
    let mss = config.congestion.max_segment_size;
    let stream_window = config.flow_control.max_stream_receive_window;
    let session_window = config.flow_control.max_session_receive_window;

    tracing::info!(
        streams = args.streams,
        bytes = args.bytes,
        rtt_ms = args.rtt_ms,
        loss_every = ?args.loss_every,
        growth = ?config.congestion.growth,
        "tessera-sim starting"
    );

    // ── Session ─────────────────────────────────────────────────
    let (clock, mock) = Clock::mock();
    let mut session = Session::new(config, PathTransport::default(), clock.clone());

    let mut ids = Vec::with_capacity(args.streams);
    for _ in 0..args.streams {
        let id = session
            .create_outgoing_stream(DEFAULT_PRIORITY)
            .ok_or_else(|| anyhow::anyhow!("open stream limit reached"))?;
        session.write_stream(id, Bytes::from(vec![0u8; args.bytes as usize]), true);
        ids.push(id);
    }

    // ── Round loop ──────────────────────────────────────────────
    let rtt = Duration::from_millis(args.rtt_ms);
    let mut next_sequence = 1u64;
    let mut packets_total = 0u64;
    let mut outstanding: VecDeque<(u64, SentPacket)> = VecDeque::new();
    let mut rounds = 0u32;

    while rounds < args.rounds {
        rounds += 1;

        // Send until congestion control says stop.
        loop {
            session.on_can_write();
            let queued = session.transport_mut().take_queued();
            if queued == 0 {
                break;
            }
            let mut remaining = queued;
            while remaining > 0 {
                let size = remaining.min(mss);
                remaining -= size;
                session.on_packet_sent(next_sequence, size, true);
                outstanding.push_back((
                    next_sequence,
                    SentPacket {
                        bytes: size,
                        sent_time: clock.now(),
                    },
                ));
                next_sequence += 1;
                packets_total += 1;
            }
            if !session.time_until_send().is_zero() {
                break;
            }
        }

        // One RTT later the whole round is acknowledged or lost.
        mock.increment(rtt);
        let mut acked = PacketMap::new();
        let mut lost = PacketMap::new();
        for (sequence, packet) in outstanding.drain(..) {
            let dropped = args.loss_every.is_some_and(|n| sequence % n == 0);
            if dropped {
                session.transport_mut().requeue(packet.bytes);
                lost.insert(sequence, packet);
            } else {
                acked.insert(sequence, packet);
            }
        }
        session.on_congestion_event(&acked, &lost, Duration::ZERO);

        // Peer consumed everything it received; grant fresh windows.
        for &id in &ids {
            if let Some(stream) = session.stream(id) {
                let offset = stream.stream_bytes_written() + stream_window;
                session.on_window_update(id, offset);
            }
        }
        let connection_offset = session.connection_flow_controller().bytes_sent() + session_window;
        session.on_window_update(StreamId::CONNECTION, connection_offset);

        for action in session.drain_actions() {
            if let SessionAction::ConnectionClose { code, details } = action {
                anyhow::bail!("connection closed: {code:?} {details}");
            }
        }

        tracing::debug!(
            round = rounds,
            cwnd = session.congestion().congestion_window(),
            ssthresh = session.congestion().slow_start_threshold(),
            in_flight = session.bytes_in_flight(),
            "round complete"
        );

        if !session.has_pending_writes() && session.transport().is_idle() {
            break;
        }
    }

    // ── Report ──────────────────────────────────────────────────
    let stats = session.stats();
    tracing::info!(
        rounds,
        packets = packets_total,
        cwnd = stats.congestion.congestion_window,
        cutbacks = stats.congestion.cutbacks,
        "tessera-sim finished"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}

// ─── Simulated Path ─────────────────────────────────────────────────────────

/// Accepts every write and hands the bytes to the packetiser as a count.
/// Lost packets are requeued for retransmission.
#[derive(Default)]
struct PathTransport {
    queued: u64,
}

impl PathTransport {
    fn take_queued(&mut self) -> u64 {
        std::mem::take(&mut self.queued)
    }

    fn requeue(&mut self, bytes: u64) {
        self.queued += bytes;
    }

    fn is_idle(&self) -> bool {
        self.queued == 0
    }
}

impl StreamTransport for PathTransport {
    fn writev_data(&mut self, _id: StreamId, data: &[u8], _offset: u64, fin: bool) -> ConsumedData {
        self.queued += data.len() as u64;
        ConsumedData::new(data.len() as u64, fin)
    }
}

// ─── CLI Parsing ────────────────────────────────────────────────────────────

struct Args {
    config: Option<PathBuf>,
    streams: usize,
    bytes: u64,
    rtt_ms: u64,
    loss_every: Option<u64>,
    rounds: u32,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config: None,
        streams: 2,
        bytes: 256 * 1024,
        rtt_ms: 50,
        loss_every: None,
        rounds: 1000,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        if matches!(flag, "--help" | "-h") {
            print_help();
            std::process::exit(0);
        }
        i += 1;
        let val = args
            .get(i)
            .ok_or_else(|| anyhow::anyhow!("{} requires a value", flag))?;
        match flag {
            "--config" | "-c" => parsed.config = Some(PathBuf::from(val)),
            "--streams" | "-s" => parsed.streams = parse_value(flag, val)?,
            "--bytes" | "-b" => parsed.bytes = parse_value(flag, val)?,
            "--rtt-ms" => parsed.rtt_ms = parse_value(flag, val)?,
            "--loss-every" => {
                let n: u64 = parse_value(flag, val)?;
                parsed.loss_every = (n > 0).then_some(n);
            }
            "--rounds" => parsed.rounds = parse_value(flag, val)?,
            other => anyhow::bail!("unknown argument '{}'", other),
        }
        i += 1;
    }

    if parsed.rtt_ms == 0 {
        anyhow::bail!("--rtt-ms must be non-zero");
    }
    Ok(parsed)
}

fn parse_value<T>(flag: &str, val: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    val.parse()
        .map_err(|e| anyhow::anyhow!("invalid value '{}' for {}: {}", val, flag, e))
}

fn print_help() {
    eprintln!(
        r#"tessera-sim — Congestion and flow control simulator

USAGE:
  tessera-sim [OPTIONS]

OPTIONS:
  --config, -c <path>   Transport config TOML (default: built-in defaults)
  --streams, -s <n>     Streams to open (default: 2)
  --bytes, -b <n>       Bytes written per stream (default: 262144)
  --rtt-ms <ms>         Path round-trip time (default: 50)
  --loss-every <n>      Drop every n-th packet, 0 for none (default: none)
  --rounds <n>          Round trips to simulate at most (default: 1000)
  --help, -h            Show this help

ENVIRONMENT VARIABLES:
  RUST_LOG   Log level filter (e.g. info, debug, tessera_transport=trace)"#
    );
}
