//! Manifest status reported to the application.
//!
//! Enough for a UI to offer retry or abort: where the transfer stands and,
//! on a rejection, which chunk and which layer refused it. Nothing here
//! carries cryptographic detail.

use skiff_crypto::{CryptoError, IntegrityError};

use crate::error::SessionError;

/// Layer that rejected a chunk or failed the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureLayer {
    /// Key agreement or key confirmation
    Handshake,
    /// Message key derivation
    Ratchet,
    /// AEAD tag verification
    Aead,
    /// Manifest hash chain or final digest
    HashChain,
    /// Nonce or buffer limits
    Resource,
    /// Framing or state-machine violation
    Protocol,
    /// The peer aborted
    Peer,
    /// Cancelled locally
    Cancelled,
}

impl FailureLayer {
    /// Classify a session error.
    pub fn of(err: &SessionError) -> Self {
        match err {
            SessionError::Crypto(CryptoError::Handshake(_)) => Self::Handshake,
            SessionError::Crypto(CryptoError::Ratchet(_)) => Self::Ratchet,
            SessionError::Crypto(CryptoError::Auth(_)) => Self::Aead,
            SessionError::Crypto(CryptoError::Integrity(_)) => Self::HashChain,
            SessionError::Crypto(CryptoError::Resource(_)) => Self::Resource,
            SessionError::PeerAborted { .. } => Self::Peer,
            SessionError::Cancelled => Self::Cancelled,
            _ => Self::Protocol,
        }
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFault {
    /// Chunk index, when the failure concerns one chunk
    pub index: Option<u64>,
    /// Layer that failed
    pub layer: FailureLayer,
}

impl ChunkFault {
    /// Fault for `err`, attributed to `index` if known.
    pub fn new(index: Option<u64>, err: &SessionError) -> Self {
        let index = match err {
            SessionError::Crypto(CryptoError::Integrity(IntegrityError::ChainMismatch {
                index,
            })) => Some(*index),
            _ => index,
        };
        Self { index, layer: FailureLayer::of(err) }
    }
}

/// Status of the incoming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestStatus {
    /// Transfer still running
    InProgress {
        /// Chunks verified in order so far
        verified_chunks: u64,
        /// Chunk count declared by the sender, once known
        expected_chunks: Option<u64>,
        /// Most recent per-chunk rejection, if any
        rejected: Option<ChunkFault>,
    },
    /// Every chunk verified and the manifest matched
    Completed {
        /// Chunks in the file
        chunk_count: u64,
        /// Bytes in the file
        total_bytes: u64,
    },
    /// Session failed; anything already delivered is untrusted
    Failed(ChunkFault),
}

impl ManifestStatus {
    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress { .. })
    }
}
