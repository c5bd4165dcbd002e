//! # Transport Configuration
//!
//! Two layers, as with the bonding config: a permissive [`TransportConfigInput`]
//! deserialised from TOML where every field is optional, and a resolved,
//! validated [`TransportConfig`] that the congestion controller, flow
//! controllers and session are built from.
//!
//! Protocol-version gating of flow control lives here too. Instead of
//! process-wide flags, a [`FeatureSet`] is carried in the config and
//! [`flow_control_enabled`] is a pure function of scope, negotiated version
//! and feature set.

use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::flow_control::FlowScope;

pub const CONFIG_VERSION: u32 = 1;

/// Smallest initial flow-control window either endpoint may advertise.
pub const MIN_FLOW_CONTROL_WINDOW: u64 = 16 * 1024;

// ─── Enumerations ───────────────────────────────────────────────────────────

/// Congestion-avoidance growth function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthMode {
    /// Classic AIMD: one segment per window of acknowledged bytes.
    Reno,
    /// Cubic function of time since the last loss.
    Cubic,
}

/// Which end of the connection this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Perspective {
    Client,
    Server,
}

/// Negotiated protocol version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(pub u32);

/// Version thresholds and switches that gate flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSet {
    /// First version with per-stream flow control.
    pub stream_flow_control_since: u32,
    /// First version with connection-level flow control.
    pub connection_flow_control_since: u32,
    /// Connection-level flow control switch, independent of the version gate.
    pub connection_flow_control: bool,
}

impl Default for FeatureSet {
    fn default() -> Self {
        FeatureSet {
            stream_flow_control_since: 17,
            connection_flow_control_since: 19,
            connection_flow_control: true,
        }
    }
}

/// Whether a flow controller of `scope` is active under `version`.
pub fn flow_control_enabled(
    scope: FlowScope,
    version: ProtocolVersion,
    features: &FeatureSet,
) -> bool {
    match scope {
        FlowScope::Stream => version.0 >= features.stream_flow_control_since,
        FlowScope::Connection => {
            features.connection_flow_control && version.0 >= features.connection_flow_control_since
        }
    }
}

// ─── Resolved Config ────────────────────────────────────────────────────────

/// Hybrid slow start tuning. The exit heuristic is a tunable, not a
/// correctness property, so every threshold is exposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridSlowStartConfig {
    pub enabled: bool,
    /// Window (packets) below which slow start is never exited early.
    pub low_window_packets: u64,
    /// ACK train must span at least `min_rtt >> ack_train_factor_exp`.
    pub ack_train_factor_exp: u32,
    /// ACKs closer together than this belong to the same train.
    pub close_ack_threshold: Duration,
    /// RTT samples per round used for delay-increase detection.
    pub min_samples: u32,
    /// Accepted RTT increase is `min_rtt >> delay_factor_exp`, clamped.
    pub delay_factor_exp: u32,
    pub delay_min_threshold: Duration,
    pub delay_max_threshold: Duration,
}

impl Default for HybridSlowStartConfig {
    fn default() -> Self {
        HybridSlowStartConfig {
            enabled: true,
            low_window_packets: 16,
            ack_train_factor_exp: 1,
            close_ack_threshold: Duration::from_micros(2_000),
            min_samples: 8,
            delay_factor_exp: 3,
            delay_min_threshold: Duration::from_micros(4_000),
            delay_max_threshold: Duration::from_micros(16_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CongestionConfig {
    /// Bytes per full-sized packet.
    pub max_segment_size: u64,
    pub initial_window_packets: u64,
    pub min_window_packets: u64,
    pub max_window_packets: u64,
    pub growth: GrowthMode,
    /// Cubic never grows slower than the Reno estimate.
    pub reno_friendly: bool,
    /// Number of Reno flows cubic emulates.
    pub num_connections: u32,
    /// Retransmission delay used before any RTT sample exists.
    pub default_retransmission_delay: Duration,
    pub hybrid_slow_start: HybridSlowStartConfig,
}

impl CongestionConfig {
    pub fn initial_window(&self) -> u64 {
        self.initial_window_packets * self.max_segment_size
    }

    pub fn min_window(&self) -> u64 {
        self.min_window_packets * self.max_segment_size
    }

    pub fn max_window(&self) -> u64 {
        self.max_window_packets * self.max_segment_size
    }
}

impl Default for CongestionConfig {
    fn default() -> Self {
        CongestionConfig {
            max_segment_size: 1460,
            initial_window_packets: 10,
            min_window_packets: 2,
            max_window_packets: 2000,
            growth: GrowthMode::Cubic,
            reno_friendly: true,
            num_connections: 2,
            default_retransmission_delay: Duration::from_millis(500),
            hybrid_slow_start: HybridSlowStartConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControlConfig {
    /// Stream send window assumed until the peer's config arrives.
    pub initial_stream_window: u64,
    /// Connection send window assumed until the peer's config arrives.
    pub initial_session_window: u64,
    /// Stream receive window and grant increment.
    pub max_stream_receive_window: u64,
    /// Connection receive window and grant increment.
    pub max_session_receive_window: u64,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        FlowControlConfig {
            initial_stream_window: MIN_FLOW_CONTROL_WINDOW,
            initial_session_window: MIN_FLOW_CONTROL_WINDOW,
            max_stream_receive_window: 64 * 1024,
            max_session_receive_window: 96 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub perspective: Perspective,
    pub max_open_streams: usize,
    /// Largest jump allowed past the highest peer-created stream id.
    pub max_stream_id_delta: u64,
    pub protocol_version: ProtocolVersion,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            perspective: Perspective::Client,
            max_open_streams: 100,
            max_stream_id_delta: 200,
            protocol_version: ProtocolVersion(19),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportConfig {
    pub congestion: CongestionConfig,
    pub flow_control: FlowControlConfig,
    pub session: SessionConfig,
    pub features: FeatureSet,
}

// ─── TOML Input ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfigInput {
    pub version: u32,
    pub congestion: CongestionConfigInput,
    pub flow_control: FlowControlConfigInput,
    pub session: SessionConfigInput,
    pub features: FeatureSetInput,
    pub rtt: RttConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CongestionConfigInput {
    pub max_segment_size: Option<u64>,
    pub initial_window_packets: Option<u64>,
    pub min_window_packets: Option<u64>,
    pub max_window_packets: Option<u64>,
    pub growth: Option<GrowthMode>,
    pub reno_friendly: Option<bool>,
    pub num_connections: Option<u32>,
    pub hybrid_slow_start: HybridSlowStartConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HybridSlowStartConfigInput {
    pub enabled: Option<bool>,
    pub low_window_packets: Option<u64>,
    pub ack_train_factor_exp: Option<u32>,
    pub close_ack_threshold_us: Option<u64>,
    pub min_samples: Option<u32>,
    pub delay_factor_exp: Option<u32>,
    pub delay_min_threshold_us: Option<u64>,
    pub delay_max_threshold_us: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FlowControlConfigInput {
    pub initial_stream_window: Option<u64>,
    pub initial_session_window: Option<u64>,
    pub max_stream_receive_window: Option<u64>,
    pub max_session_receive_window: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfigInput {
    pub perspective: Option<Perspective>,
    pub max_open_streams: Option<usize>,
    pub max_stream_id_delta: Option<u64>,
    pub protocol_version: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeatureSetInput {
    pub stream_flow_control_since: Option<u32>,
    pub connection_flow_control_since: Option<u32>,
    pub connection_flow_control: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RttConfigInput {
    pub default_retransmission_delay_ms: Option<u64>,
}

impl HybridSlowStartConfigInput {
    fn resolve(self) -> HybridSlowStartConfig {
        let d = HybridSlowStartConfig::default();
        HybridSlowStartConfig {
            enabled: self.enabled.unwrap_or(d.enabled),
            low_window_packets: self.low_window_packets.unwrap_or(d.low_window_packets),
            ack_train_factor_exp: self.ack_train_factor_exp.unwrap_or(d.ack_train_factor_exp),
            close_ack_threshold: self
                .close_ack_threshold_us
                .map(Duration::from_micros)
                .unwrap_or(d.close_ack_threshold),
            min_samples: self.min_samples.unwrap_or(d.min_samples).max(1),
            delay_factor_exp: self.delay_factor_exp.unwrap_or(d.delay_factor_exp),
            delay_min_threshold: self
                .delay_min_threshold_us
                .map(Duration::from_micros)
                .unwrap_or(d.delay_min_threshold),
            delay_max_threshold: self
                .delay_max_threshold_us
                .map(Duration::from_micros)
                .unwrap_or(d.delay_max_threshold),
        }
    }
}

impl TransportConfigInput {
    pub fn resolve(self) -> anyhow::Result<TransportConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            bail!("unsupported config version {}", version);
        }

        let cc = CongestionConfig::default();
        let congestion = CongestionConfig {
            max_segment_size: self.congestion.max_segment_size.unwrap_or(cc.max_segment_size),
            initial_window_packets: self
                .congestion
                .initial_window_packets
                .unwrap_or(cc.initial_window_packets),
            min_window_packets: self
                .congestion
                .min_window_packets
                .unwrap_or(cc.min_window_packets),
            max_window_packets: self
                .congestion
                .max_window_packets
                .unwrap_or(cc.max_window_packets),
            growth: self.congestion.growth.unwrap_or(cc.growth),
            reno_friendly: self.congestion.reno_friendly.unwrap_or(cc.reno_friendly),
            num_connections: self
                .congestion
                .num_connections
                .unwrap_or(cc.num_connections)
                .max(1),
            default_retransmission_delay: self
                .rtt
                .default_retransmission_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(cc.default_retransmission_delay),
            hybrid_slow_start: self.congestion.hybrid_slow_start.resolve(),
        };
        if congestion.max_segment_size == 0 {
            bail!("max_segment_size must be non-zero");
        }
        if congestion.min_window_packets == 0
            || congestion.min_window_packets > congestion.initial_window_packets
            || congestion.initial_window_packets > congestion.max_window_packets
        {
            bail!(
                "congestion windows must satisfy 0 < min ({}) <= initial ({}) <= max ({})",
                congestion.min_window_packets,
                congestion.initial_window_packets,
                congestion.max_window_packets
            );
        }

        let fc = FlowControlConfig::default();
        let flow_control = FlowControlConfig {
            initial_stream_window: self
                .flow_control
                .initial_stream_window
                .unwrap_or(fc.initial_stream_window),
            initial_session_window: self
                .flow_control
                .initial_session_window
                .unwrap_or(fc.initial_session_window),
            max_stream_receive_window: self
                .flow_control
                .max_stream_receive_window
                .unwrap_or(fc.max_stream_receive_window),
            max_session_receive_window: self
                .flow_control
                .max_session_receive_window
                .unwrap_or(fc.max_session_receive_window),
        };
        if flow_control.max_stream_receive_window < MIN_FLOW_CONTROL_WINDOW
            || flow_control.max_session_receive_window < MIN_FLOW_CONTROL_WINDOW
        {
            bail!(
                "receive windows must be at least {} bytes",
                MIN_FLOW_CONTROL_WINDOW
            );
        }

        let sc = SessionConfig::default();
        let session = SessionConfig {
            perspective: self.session.perspective.unwrap_or(sc.perspective),
            max_open_streams: self.session.max_open_streams.unwrap_or(sc.max_open_streams),
            max_stream_id_delta: self
                .session
                .max_stream_id_delta
                .unwrap_or(sc.max_stream_id_delta),
            protocol_version: self
                .session
                .protocol_version
                .map(ProtocolVersion)
                .unwrap_or(sc.protocol_version),
        };
        if session.max_open_streams == 0 {
            bail!("max_open_streams must be non-zero");
        }

        let fs = FeatureSet::default();
        let features = FeatureSet {
            stream_flow_control_since: self
                .features
                .stream_flow_control_since
                .unwrap_or(fs.stream_flow_control_since),
            connection_flow_control_since: self
                .features
                .connection_flow_control_since
                .unwrap_or(fs.connection_flow_control_since),
            connection_flow_control: self
                .features
                .connection_flow_control
                .unwrap_or(fs.connection_flow_control),
        };

        Ok(TransportConfig {
            congestion,
            flow_control,
            session,
            features,
        })
    }
}

impl TransportConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        if input.trim().is_empty() {
            return Ok(TransportConfig::default());
        }
        let parsed: TransportConfigInput =
            toml::from_str(input).context("invalid transport config TOML")?;
        parsed.resolve()
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text)
    }
}
