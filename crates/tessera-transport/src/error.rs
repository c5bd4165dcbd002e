//! # Error Codes
//!
//! Connection-fatal error codes and stream reset codes.
//!
//! Protocol violations (peer misbehaviour) and local invariant violations
//! both end the connection; they differ only in code and log level. Nothing
//! in this crate unwinds: internal helpers return `Result<_, ConnectionError>`
//! and the session event handlers turn an `Err` into a connection close.

use serde::Serialize;
use thiserror::Error;

// ─── Connection Errors ──────────────────────────────────────────────────────

/// Error code carried by a connection close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    /// Orderly shutdown.
    NoError,
    /// Peer sent data beyond the receive window we granted.
    FlowControlReceivedTooMuchData,
    /// We sent data beyond the send window the peer granted (local bug).
    FlowControlSentTooMuchData,
    /// Peer advertised an initial window below the protocol minimum.
    FlowControlInvalidWindow,
    /// Frame addressed a stream id that is out of range or has the wrong parity.
    InvalidStreamId,
    /// Peer opened more concurrent streams than allowed.
    TooManyOpenStreams,
    /// A fin or reset disagreed with an already-recorded final offset.
    StreamFinalOffsetMismatch,
}

impl ErrorCode {
    /// Whether the code describes a local invariant violation rather than
    /// peer misbehaviour.
    pub fn is_local(self) -> bool {
        matches!(self, ErrorCode::FlowControlSentTooMuchData)
    }
}

/// A connection-fatal error with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code:?}: {details}")]
pub struct ConnectionError {
    pub code: ErrorCode,
    pub details: String,
}

impl ConnectionError {
    pub fn new(code: ErrorCode, details: impl Into<String>) -> Self {
        ConnectionError {
            code,
            details: details.into(),
        }
    }
}

// ─── Stream Reset Codes ─────────────────────────────────────────────────────

/// Error code carried by a stream reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RstStreamCode {
    /// Stream finished without error.
    NoError,
    /// Application cancelled the stream.
    Cancelled,
    /// Reset synthesised on close so the peer learns our final byte offset.
    FlowControlAccounting,
    /// Code this endpoint does not recognise.
    Unknown(u32),
}

impl From<u32> for RstStreamCode {
    fn from(code: u32) -> Self {
        match code {
            0 => RstStreamCode::NoError,
            1 => RstStreamCode::Cancelled,
            2 => RstStreamCode::FlowControlAccounting,
            other => RstStreamCode::Unknown(other),
        }
    }
}

impl From<RstStreamCode> for u32 {
    fn from(code: RstStreamCode) -> u32 {
        match code {
            RstStreamCode::NoError => 0,
            RstStreamCode::Cancelled => 1,
            RstStreamCode::FlowControlAccounting => 2,
            RstStreamCode::Unknown(other) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rst_code_wire_values_are_stable() {
        for code in [
            RstStreamCode::NoError,
            RstStreamCode::Cancelled,
            RstStreamCode::FlowControlAccounting,
            RstStreamCode::Unknown(77),
        ] {
            assert_eq!(RstStreamCode::from(u32::from(code)), code);
        }
    }

    #[test]
    fn only_sent_too_much_is_local() {
        assert!(ErrorCode::FlowControlSentTooMuchData.is_local());
        assert!(!ErrorCode::FlowControlReceivedTooMuchData.is_local());
        assert!(!ErrorCode::InvalidStreamId.is_local());
    }

    #[test]
    fn connection_error_display_includes_reason() {
        let err = ConnectionError::new(ErrorCode::InvalidStreamId, "stream 4 never opened");
        assert_eq!(err.to_string(), "InvalidStreamId: stream 4 never opened");
    }
}
