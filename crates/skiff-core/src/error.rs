//! Error types for the session controller.
//!
//! [`SessionError`] wraps the cryptographic taxonomy from `skiff-crypto`
//! together with state-machine and framing errors. The split that matters to
//! a caller is [`SessionError::is_fatal`]: a fatal error has already moved the
//! session to `Failed` and wiped its keys, anything else dropped one frame.

use std::io;

use skiff_crypto::CryptoError;
use skiff_proto::ProtocolError;
use thiserror::Error;

use crate::{config::ConfigError, session::SessionState};

/// Errors returned by [`Session`](crate::Session) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation not allowed in the current state
    #[error("invalid state: cannot {operation} in {state:?}")]
    InvalidState {
        /// State when the operation was attempted
        state: SessionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Frame type not expected in the current state
    #[error("unexpected frame: opcode {opcode:#06x} in state {state:?}")]
    UnexpectedFrame {
        /// State when the frame arrived
        state: SessionState,
        /// Opcode of the frame
        opcode: u16,
    },

    /// Frame carries another session's id
    #[error("frame belongs to a different session")]
    SessionMismatch,

    /// Peer aborted the session
    #[error("peer aborted the session (code {code})")]
    PeerAborted {
        /// Abort code sent by the peer
        code: u16,
    },

    /// Session was cancelled locally
    #[error("session cancelled")]
    Cancelled,

    /// Frame sequence lies at or beyond the local nonce limit
    #[error("frame sequence {sequence} is beyond the nonce limit")]
    SequenceOutOfRange {
        /// Sequence carried by the frame
        sequence: u64,
    },

    /// Plaintext chunk exceeds the configured size
    #[error("chunk of {size} bytes exceeds limit of {max}")]
    ChunkTooLarge {
        /// Chunk size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Retransmission requested for a chunk that was never sent, or with
    /// different contents
    #[error("unknown chunk {index}")]
    UnknownChunk {
        /// Requested index
        index: u64,
    },

    /// Framing or payload decoding failure
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Cryptographic failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// Returns true if the session was torn down by this error.
    ///
    /// Fatal cryptographic failures, cancellation and peer aborts are fatal.
    /// Malformed or misdirected frames are dropped without affecting the
    /// session, since anyone on the path can produce them.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Crypto(err) => err.is_fatal(),
            Self::PeerAborted { .. } | Self::Cancelled => true,
            _ => false,
        }
    }

    /// Returns true if the failed chunk may succeed when retransmitted.
    ///
    /// Per-chunk cryptographic rejections (AEAD, ratchet window, duplicate)
    /// are transient; state and configuration errors are caller bugs.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Crypto(err) if !err.is_fatal())
    }

    /// Message safe to show an end user.
    ///
    /// Never names the check that failed, so a peer testing the session learns
    /// nothing beyond success or failure.
    pub fn user_message(&self) -> &'static str {
        if self.is_fatal() {
            "Transfer failed: the file could not be verified."
        } else if self.is_transient() {
            "A part of the file could not be verified. Retrying may help."
        } else {
            "The transfer could not continue."
        }
    }
}

/// Boundary conversion for async I/O drivers.
impl From<SessionError> for io::Error {
    fn from(err: SessionError) -> Self {
        let kind = match &err {
            SessionError::PeerAborted { .. } | SessionError::Cancelled => {
                io::ErrorKind::ConnectionAborted
            },
            SessionError::Config(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::InvalidData,
        };
        Self::new(kind, err.to_string())
    }
}
