//! Protocol error types.

use thiserror::Error;

/// Result alias for framing operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while parsing or building frames.
///
/// None of these carry payload bytes: a malformed frame from the peer is
/// reported by shape only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer shorter than a frame header
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Required length
        expected: usize,
        /// Available length
        actual: usize,
    },

    /// Header does not start with the Skiff magic
    #[error("invalid magic number")]
    InvalidMagic,

    /// Header version is not spoken by this build
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Payload exceeds the protocol limit
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Claimed or actual payload size
        size: usize,
        /// Protocol maximum
        max: usize,
    },

    /// Fewer payload bytes than the header claims
    #[error("frame truncated: expected {expected} payload bytes, got {actual}")]
    FrameTruncated {
        /// Payload size from the header
        expected: usize,
        /// Payload bytes present
        actual: usize,
    },

    /// Opcode not known to this build
    #[error("unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    /// Payload serialization failed
    #[error("CBOR encoding failed: {0}")]
    CborEncode(String),

    /// Payload deserialization failed
    #[error("CBOR decoding failed: {0}")]
    CborDecode(String),
}
