// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for fence collectives.
//!
//! Two layers:
//! - [`Error`]: returned synchronously by agent, registry and codec operations.
//! - [`FenceError`]: the only failure a `begin_fence` completion callback ever sees.

use crate::context::NodeId;

/// Errors returned by treefence operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration value rejected by validation.
    Config(String),
    /// Configuration file could not be read, parsed or written.
    ConfigFile(String),

    // ========================================================================
    // Topology Errors
    // ========================================================================
    /// A participant could not be resolved to a host, or the host list is empty.
    Topology(String),
    /// This node hosts none of the participants of the collective.
    NotParticipant(String),
    /// Node id unknown to the job layout.
    UnknownNode(NodeId),

    // ========================================================================
    // Local Contribution Errors
    // ========================================================================
    /// Local data was already contributed to the current generation.
    AlreadyContributed {
        /// Generation the duplicate contribution targeted
        seq: u32,
    },
    /// Local contribution arrived while the upward forward was in flight.
    WrongPhase(&'static str),

    // ========================================================================
    // Wire Errors
    // ========================================================================
    /// Malformed header, envelope or preamble.
    Codec(String),
    /// Message came from a node that is neither the expected parent nor a child.
    UnexpectedSender {
        /// Node id found in the header
        node: NodeId,
        /// Message type name
        kind: &'static str,
    },
    /// Message type the agent does not process.
    UnsupportedMessage(u32),
    /// Contribution generation cannot be reconciled with the local one.
    ProtocolDesync {
        /// Generation the local state machine expected
        expected: u32,
        /// Generation carried by the message
        got: u32,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// I/O error with underlying cause.
    Io(std::io::Error),
    /// Send exhausted its retries or the direct socket failed.
    SendFailed(String),
    /// Agent or reactor already shut down.
    Shutdown,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::ConfigFile(msg) => write!(f, "Config file error: {}", msg),
            Error::Topology(msg) => write!(f, "Topology error: {}", msg),
            Error::NotParticipant(host) => {
                write!(f, "Host {} is not part of the participant set", host)
            }
            Error::UnknownNode(node) => write!(f, "Unknown node id {}", node),
            Error::AlreadyContributed { seq } => {
                write!(f, "Local contribution already made for seq={}", seq)
            }
            Error::WrongPhase(phase) => {
                write!(f, "Local contribution not accepted in phase {}", phase)
            }
            Error::Codec(msg) => write!(f, "Codec error: {}", msg),
            Error::UnexpectedSender { node, kind } => {
                write!(f, "Unexpected {} message from node {}", kind, node)
            }
            Error::UnsupportedMessage(kind) => write!(f, "Unsupported message type {}", kind),
            Error::ProtocolDesync { expected, got } => write!(
                f,
                "Protocol desynchronization: expected seq={}, got seq={}",
                expected, got
            ),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            Error::Shutdown => write!(f, "Fence agent shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenient alias for results using the crate [`Error`] type.
pub type Result<T> = core::result::Result<T, Error>;

/// Failure status delivered to a fence completion callback.
///
/// Partial or garbled aggregates never reach the caller; a failed
/// generation is reported with exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FenceError {
    /// The generation exceeded the configured deadline.
    Timeout,
    /// An upward or downward send failed.
    SendFailed,
    /// A peer sent a contribution that cannot be reconciled.
    ProtocolError,
}

impl std::fmt::Display for FenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FenceError::Timeout => write!(f, "fence timed out"),
            FenceError::SendFailed => write!(f, "fence send failed"),
            FenceError::ProtocolError => write!(f, "fence protocol error"),
        }
    }
}

impl std::error::Error for FenceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = Error::ProtocolDesync {
            expected: 3,
            got: 5,
        };
        assert_eq!(
            e.to_string(),
            "Protocol desynchronization: expected seq=3, got seq=5"
        );
        assert_eq!(FenceError::Timeout.to_string(), "fence timed out");
    }

    #[test]
    fn test_io_source_preserved() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(std::error::Error::source(&e).is_some());
        assert!(std::error::Error::source(&Error::Shutdown).is_none());
    }
}
