//! Error taxonomy for the Skiff cryptographic core.
//!
//! Errors are split by the layer that detected them so the session controller
//! can decide between dropping a single chunk and tearing down the session:
//!
//! - [`HandshakeError`]: malformed peer key material, version mismatch. Fatal.
//! - [`RatchetError`]: out-of-window or undecodable ratchet state for one
//!   message. Recoverable.
//! - [`AuthError`]: AEAD tag mismatch. Recoverable for the session, but always
//!   treated as possible tampering.
//! - [`IntegrityError`]: hash-chain or final digest mismatch. Fatal.
//! - [`ResourceError`]: nonce exhaustion (fatal) and bounded-structure
//!   overflow (recoverable).
//!
//! None of these types carry key material, plaintext or nonce bytes.

use thiserror::Error;

use crate::nonce::Direction;

/// Failures during the hybrid key agreement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Peer public key material has the wrong length or encoding
    #[error("invalid peer key: {component}: {reason}")]
    InvalidPeerKey {
        /// Which key was rejected (`x25519`, `ml-kem`, ...)
        component: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Peer speaks a different protocol version
    #[error("protocol version mismatch: local {local}, peer {peer}")]
    VersionMismatch {
        /// Our protocol version
        local: u8,
        /// Version announced by the peer
        peer: u8,
    },

    /// Diffie-Hellman produced an all-zero (non-contributory) secret
    #[error("peer key produced a non-contributory shared secret")]
    NonContributory,

    /// No cipher suite is supported by both sides
    #[error("no common cipher suite")]
    NoCommonCipherSuite,

    /// Peer selected a suite we never offered
    #[error("peer selected unoffered cipher suite {suite_id:#04x}")]
    UnofferedCipherSuite {
        /// Wire identifier chosen by the peer
        suite_id: u8,
    },

    /// Key-confirmation tag did not match the derived keys
    #[error("key confirmation failed")]
    KeyConfirmationFailed,
}

/// Failures while deriving a key for one message.
///
/// A ratchet error drops the affected message; the ratchet state is left
/// untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RatchetError {
    /// Message key is behind the receive window or was already consumed
    #[error("message key expired: epoch {epoch}, counter {counter}")]
    KeyExpired {
        /// Epoch claimed by the message
        epoch: u32,
        /// Chain counter claimed by the message
        counter: u32,
    },

    /// Message belongs to an epoch more than one step ahead
    #[error("message epoch {epoch} is ahead of current epoch {current}")]
    EpochAhead {
        /// Epoch claimed by the message
        epoch: u32,
        /// Current receive epoch
        current: u32,
    },

    /// Ratchet step targets a receive key set we no longer (or never) had
    #[error("unknown receive key set generation {generation}")]
    UnknownKeyset {
        /// Generation referenced by the message
        generation: u32,
    },

    /// Ratchet public key produced a non-contributory DH result
    #[error("ratchet key produced a non-contributory shared secret")]
    NonContributory,

    /// Ratchet key material in a header is malformed
    #[error("invalid ratchet key: {reason}")]
    InvalidRatchetKey {
        /// What was wrong with it
        reason: String,
    },

    /// Chain counter would overflow
    #[error("chain counter overflow in epoch {epoch}")]
    CounterOverflow {
        /// Epoch whose chain is exhausted
        epoch: u32,
    },

    /// Epoch counter would overflow
    #[error("ratchet epoch overflow")]
    EpochOverflow,
}

/// AEAD authentication failure.
///
/// Carries no detail on purpose: the caller learns only that the chunk was
/// rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// Authentication tag did not verify
    #[error("authentication tag mismatch")]
    TagMismatch,
}

/// Manifest hash-chain or digest failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// Chunk's claimed predecessor link differs from the locally computed one
    #[error("hash chain mismatch at chunk {index}")]
    ChainMismatch {
        /// Chunk whose link failed
        index: u64,
    },

    /// Final chain digest differs from the sender's manifest
    #[error("manifest chain digest mismatch")]
    ChainDigestMismatch,

    /// Whole-file digest differs from the sender's manifest
    #[error("file digest mismatch")]
    FileDigestMismatch,

    /// Total byte count differs from the sender's manifest
    #[error("length mismatch: manifest {expected} bytes, received {actual}")]
    LengthMismatch {
        /// Bytes declared by the manifest
        expected: u64,
        /// Bytes received and verified
        actual: u64,
    },

    /// Chunk index lies beyond the manifest's declared chunk count
    #[error("chunk {index} is beyond manifest count {count}")]
    UnexpectedChunk {
        /// Offending chunk index
        index: u64,
        /// Chunk count declared by the manifest
        count: u64,
    },

    /// Chunk index was already verified or is already buffered
    #[error("duplicate chunk {index}")]
    DuplicateChunk {
        /// Repeated chunk index
        index: u64,
    },

    /// A second, different manifest summary arrived
    #[error("conflicting manifest summary")]
    ConflictingManifest,

    /// Encoded manifest summary has the wrong size
    #[error("malformed manifest summary: {len} bytes")]
    MalformedSummary {
        /// Length of the rejected encoding
        len: usize,
    },
}

/// Resource bounds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Nonce counter reached its limit; the session must not continue
    #[error("nonce space exhausted for {direction:?}")]
    NonceExhausted {
        /// Direction whose counter ran out
        direction: Direction,
    },

    /// Nonce counter was already used (replay or local bug)
    #[error("nonce counter {counter} already used")]
    NonceReused {
        /// Rejected counter
        counter: u64,
    },

    /// Nonce counter is older than the replay window
    #[error("nonce counter {counter} is below replay window floor {floor}")]
    NonceOutsideWindow {
        /// Rejected counter
        counter: u64,
        /// Oldest counter still tracked
        floor: u64,
    },

    /// Message would require skipping more keys than allowed
    #[error("skip of {requested} keys exceeds window of {max_skip}")]
    SkipWindowExceeded {
        /// Keys that would have to be skipped
        requested: u64,
        /// Configured maximum
        max_skip: u32,
    },

    /// Out-of-order chunk buffer is full
    #[error("reorder buffer full ({capacity} chunks)")]
    ReorderBufferFull {
        /// Configured capacity
        capacity: usize,
    },
}

/// Any error raised by the cryptographic core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key agreement failure
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    /// Ratchet failure for one message
    #[error(transparent)]
    Ratchet(#[from] RatchetError),
    /// AEAD failure for one message
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Manifest failure
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    /// Resource bound reached
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl ResourceError {
    /// Returns true if the session cannot continue after this error.
    ///
    /// Only nonce exhaustion is fatal: every other bound rejects a single
    /// message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NonceExhausted { .. })
    }
}

impl IntegrityError {
    /// Returns true if the transfer can no longer complete.
    ///
    /// A duplicate is the only recoverable case: it changes nothing already
    /// verified.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::DuplicateChunk { .. })
    }
}

impl CryptoError {
    /// Returns true if this error must terminate the session.
    ///
    /// Handshake and integrity failures leave no partially trusted state to
    /// continue from. Ratchet and AEAD failures only drop one message, as
    /// does a duplicate chunk.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Handshake(_) => true,
            Self::Ratchet(_) | Self::Auth(_) => false,
            Self::Integrity(err) => err.is_fatal(),
            Self::Resource(err) => err.is_fatal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_and_integrity_errors_are_fatal() {
        let handshake: CryptoError = HandshakeError::NoCommonCipherSuite.into();
        let integrity: CryptoError = IntegrityError::ChainMismatch { index: 3 }.into();

        assert!(handshake.is_fatal());
        assert!(integrity.is_fatal());
    }

    #[test]
    fn per_message_errors_are_recoverable() {
        let expired: CryptoError = RatchetError::KeyExpired { epoch: 0, counter: 1 }.into();
        let auth: CryptoError = AuthError::TagMismatch.into();
        let skip: CryptoError =
            ResourceError::SkipWindowExceeded { requested: 5000, max_skip: 1000 }.into();

        assert!(!expired.is_fatal());
        assert!(!auth.is_fatal());
        assert!(!skip.is_fatal());
    }

    #[test]
    fn duplicate_chunk_is_recoverable() {
        let err: CryptoError = IntegrityError::DuplicateChunk { index: 1 }.into();
        assert!(!err.is_fatal());
    }

    #[test]
    fn nonce_exhaustion_is_fatal() {
        let err: CryptoError =
            ResourceError::NonceExhausted { direction: Direction::InitiatorToResponder }.into();
        assert!(err.is_fatal());
    }

    #[test]
    fn auth_error_message_reveals_nothing() {
        assert_eq!(AuthError::TagMismatch.to_string(), "authentication tag mismatch");
    }
}
