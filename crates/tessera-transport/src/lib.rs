//! # tessera-transport
//!
//! Sending-side core of a QUIC-style multiplexed transport.
//!
//! Loss-based congestion control (slow start, Reno or cubic growth,
//! proportional rate reduction, hybrid slow start), byte-offset flow
//! control at stream and connection scope, and a priority scheduler for
//! streams waiting to write. Packet framing, encryption and loss detection
//! live below this crate and talk to it through [`session::StreamTransport`]
//! and the session's packet-accounting calls.
//!
//! ## Crate structure
//!
//! - [`config`] — Transport configuration, TOML input, version gating
//! - [`error`] — Connection error codes and stream reset codes
//! - [`rtt`] — Smoothed RTT estimator
//! - [`hystart`] — Hybrid slow start exit detection
//! - [`cubic`] — Cubic window growth function
//! - [`congestion`] — Window-based congestion controller with PRR
//! - [`flow_control`] — Per-stream and per-connection flow controllers
//! - [`scheduler`] — Priority write-blocked list
//! - [`stream`] — Reliable stream, receive sequencer
//! - [`session`] — Stream table, event handlers, outbound actions
//! - [`stats`] — Congestion and session counters

pub mod config;
pub mod congestion;
pub mod cubic;
pub mod error;
pub mod flow_control;
pub mod hystart;
pub mod rtt;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod stream;
