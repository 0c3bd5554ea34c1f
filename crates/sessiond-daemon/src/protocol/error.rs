//! Error types for the wire protocol layer.
//!
//! Protocol errors concern the transport: framing, credentials, and
//! connection lifecycle. Broker-level failures travel inside response
//! messages instead, so a misbehaving request never tears down the
//! connection it arrived on.

use std::io;

use thiserror::Error;

/// Maximum frame size in bytes (1 MiB).
///
/// Checked against the length prefix BEFORE allocation so an
/// adversarial prefix cannot trigger memory exhaustion.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors raised by the protocol transport.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame length prefix exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Size announced by the length prefix.
        size: usize,
        /// Maximum allowed frame size.
        max: usize,
    },

    /// The frame payload does not decode as a protocol message.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Description of the framing error.
        reason: String,
    },

    /// The peer's credentials could not be read or were unusable.
    #[error("peer credentials rejected: {reason}")]
    Credentials {
        /// Why the credentials were rejected.
        reason: String,
    },

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Underlying I/O error from the transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A message failed to serialize or deserialize.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Description of the serialization failure.
        reason: String,
    },
}

impl ProtocolError {
    /// Create a frame-too-large error.
    #[must_use]
    pub const fn frame_too_large(size: usize) -> Self {
        Self::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        }
    }

    /// Create an invalid-frame error.
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        Self::InvalidFrame {
            reason: reason.into(),
        }
    }

    /// Create a credentials error.
    pub fn credentials(reason: impl Into<String>) -> Self {
        Self::Credentials {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the error indicates a peer protocol violation,
    /// after which the connection should be dropped.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. } | Self::InvalidFrame { .. } | Self::Serialization { .. }
        )
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_too_large_reports_both_sizes() {
        let err = ProtocolError::frame_too_large(2 * MAX_FRAME_SIZE);
        assert!(err.is_protocol_violation());
        let msg = err.to_string();
        assert!(msg.contains(&(2 * MAX_FRAME_SIZE).to_string()));
        assert!(msg.contains(&MAX_FRAME_SIZE.to_string()));
    }

    #[test]
    fn connection_closed_is_not_a_violation() {
        assert!(!ProtocolError::ConnectionClosed.is_protocol_violation());
        let io_err = ProtocolError::from(io::Error::other("boom"));
        assert!(!io_err.is_protocol_violation());
    }
}
