//! Error types for the Quicksilver JIT offload subsystem
//!
//! Nothing in this taxonomy is ever surfaced as a script-visible exception.
//! Every failure degrades to "compilation did not happen this time": the
//! function keeps running at its current tier and the engine moves on.

use crate::snapshot::FunctionId;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Reason tag carried in a failed compilation reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// An immediate or branch offset did not fit its encoding field
    EncodingRange,
    /// The register allocator could not produce a total assignment
    RegAlloc,
    /// The agent died while the item was in flight
    AgentDied,
    /// The wire payload could not be decoded
    WireFormat,
    /// Any other internal failure
    Internal,
}

impl FailureReason {
    /// Stable single-byte tag used on the wire
    pub fn as_tag(self) -> u8 {
        match self {
            FailureReason::EncodingRange => 1,
            FailureReason::RegAlloc => 2,
            FailureReason::AgentDied => 3,
            FailureReason::WireFormat => 4,
            FailureReason::Internal => 5,
        }
    }

    /// Inverse of [`as_tag`](Self::as_tag); unknown tags collapse to `Internal`
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            1 => FailureReason::EncodingRange,
            2 => FailureReason::RegAlloc,
            3 => FailureReason::AgentDied,
            4 => FailureReason::WireFormat,
            _ => FailureReason::Internal,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::EncodingRange => write!(f, "encoding-range"),
            FailureReason::RegAlloc => write!(f, "regalloc"),
            FailureReason::AgentDied => write!(f, "agent-died"),
            FailureReason::WireFormat => write!(f, "wire-format"),
            FailureReason::Internal => write!(f, "internal"),
        }
    }
}

/// Main error type for the JIT offload subsystem
#[derive(Error, Debug)]
pub enum Error {
    /// The profile's epoch moved while a snapshot was being captured.
    /// Recovered locally: the snapshot is dropped and the function is
    /// re-considered on a later hotness notification.
    #[error("CaptureConflict: profile for function #{function} changed during capture (epoch {before} -> {after})")]
    CaptureConflict {
        function: FunctionId,
        before: u64,
        after: u64,
    },

    /// An immediate operand or branch offset is outside the range of its
    /// architecture encoding field. Fails the whole work item; no partial
    /// machine code is kept.
    #[error("EncodingRange: {what} value {value} does not fit a {bits}-bit field")]
    EncodingRange {
        what: &'static str,
        value: i64,
        bits: u8,
    },

    /// The linear-scan allocator finished without a location for every
    /// virtual register. This is a backend defect, not a user condition;
    /// the work item fails closed.
    #[error("RegAllocIncomplete: virtual register v{vreg} has no assigned location")]
    RegAllocIncomplete { vreg: u32 },

    /// The compilation agent is gone (process exited, thread finished, or
    /// unresponsive past the configured timeout).
    #[error("AgentDead: connection {connection_id} is no longer live")]
    AgentDead { connection_id: u64 },

    /// Transport-level failure that is not agent death (queue closed,
    /// broken pipe while the process is still running, ...).
    #[error("TransportError: {0}")]
    Transport(String),

    /// Malformed or version-incompatible wire payload
    #[error("WireFormatError: {0}")]
    WireFormat(String),

    /// A snapshot that is internally inconsistent (e.g. a guard op naming a
    /// fixed-field record that was never captured)
    #[error("MalformedSnapshot: {0}")]
    MalformedSnapshot(String),

    /// Invalid embedder-supplied configuration
    #[error("ConfigError: {0}")]
    Config(String),

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport(message.into())
    }

    /// Create a wire format error
    pub fn wire(message: impl Into<String>) -> Self {
        Error::WireFormat(message.into())
    }

    /// Map this error to the reason tag reported in a compilation reply
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Error::EncodingRange { .. } => FailureReason::EncodingRange,
            Error::RegAllocIncomplete { .. } => FailureReason::RegAlloc,
            Error::AgentDead { .. } => FailureReason::AgentDied,
            Error::WireFormat(_) => FailureReason::WireFormat,
            _ => FailureReason::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_tag_roundtrip() {
        for reason in [
            FailureReason::EncodingRange,
            FailureReason::RegAlloc,
            FailureReason::AgentDied,
            FailureReason::WireFormat,
            FailureReason::Internal,
        ] {
            assert_eq!(FailureReason::from_tag(reason.as_tag()), reason);
        }
    }

    #[test]
    fn test_unknown_tag_collapses_to_internal() {
        assert_eq!(FailureReason::from_tag(0xFF), FailureReason::Internal);
    }

    #[test]
    fn test_error_maps_to_reason() {
        let err = Error::EncodingRange {
            what: "cmp immediate",
            value: 1 << 20,
            bits: 12,
        };
        assert_eq!(err.failure_reason(), FailureReason::EncodingRange);
        let err = Error::RegAllocIncomplete { vreg: 7 };
        assert_eq!(err.failure_reason(), FailureReason::RegAlloc);
    }
}
