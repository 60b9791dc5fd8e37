//! Session policy.
//!
//! Every value here is local policy, not protocol: two peers may run with
//! different settings and still interoperate. Intervals and windows trade
//! resilience to reordering against memory held for an attacker.

use serde::{Deserialize, Serialize};
use skiff_crypto::{
    CipherSuite, RatchetConfig,
    integrity::DEFAULT_MAX_PENDING_CHUNKS,
    nonce::DEFAULT_REPLAY_WINDOW,
    ratchet::{
        DEFAULT_DH_INTERVAL, DEFAULT_MAX_CACHED_KEYS, DEFAULT_MAX_KEYSETS, DEFAULT_MAX_SKIP,
        DEFAULT_PQ_INTERVAL,
    },
};
use skiff_proto::FrameHeader;
use thiserror::Error;

/// Largest plaintext chunk sealed into one frame by default (1 MiB).
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Default nonce counter limit per direction.
///
/// Far below 2^64 so the fatal exhaustion path stays reachable in tests
/// with a lowered limit, while being unreachable in practice.
pub const DEFAULT_NONCE_LIMIT: u64 = 1 << 48;

/// Room reserved in a frame payload for the ratchet header and CBOR framing.
const ENVELOPE_OVERHEAD: usize = 8 * 1024;

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A value that must be positive is zero
    #[error("{field} must be greater than zero")]
    Zero {
        /// Offending field
        field: &'static str,
    },

    /// Chunks would not fit in a frame
    #[error("max_chunk_size {size} exceeds the frame limit {max}")]
    ChunkTooLarge {
        /// Configured size
        size: usize,
        /// Largest size that fits
        max: usize,
    },

    /// Fewer than two key sets cannot survive a rotation in flight
    #[error("max_keysets must be at least 2, got {0}")]
    TooFewKeysets(usize),

    /// No cipher suite to offer
    #[error("cipher_suites must not be empty")]
    NoCipherSuites,

    /// A suite is listed twice
    #[error("cipher suite {0:?} listed more than once")]
    DuplicateCipherSuite(CipherSuite),
}

/// Per-session policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Messages between post-quantum ratchet steps
    pub pq_interval: u32,
    /// Messages per chain before a DH ratchet step
    pub dh_interval: u32,
    /// Largest gap in one chain, and how far back skipped keys are kept
    pub max_skip: u32,
    /// Maximum skipped keys held at once
    pub max_cached_keys: usize,
    /// Own receive key sets retained for late peer steps
    pub max_keysets: usize,
    /// Replay window of the receive nonce allocator
    pub replay_window: u64,
    /// Out-of-order chunks buffered before verification
    pub max_pending_chunks: usize,
    /// Largest plaintext chunk accepted or sent
    pub max_chunk_size: usize,
    /// Cipher suites in preference order
    pub cipher_suites: Vec<CipherSuite>,
    /// Exclusive nonce counter limit per direction
    pub nonce_limit: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pq_interval: DEFAULT_PQ_INTERVAL,
            dh_interval: DEFAULT_DH_INTERVAL,
            max_skip: DEFAULT_MAX_SKIP,
            max_cached_keys: DEFAULT_MAX_CACHED_KEYS,
            max_keysets: DEFAULT_MAX_KEYSETS,
            replay_window: DEFAULT_REPLAY_WINDOW,
            max_pending_chunks: DEFAULT_MAX_PENDING_CHUNKS,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            cipher_suites: CipherSuite::ALL.to_vec(),
            nonce_limit: DEFAULT_NONCE_LIMIT,
        }
    }
}

impl SessionConfig {
    /// Check every field.
    ///
    /// # Errors
    ///
    /// The first invalid field found, as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("pq_interval", u64::from(self.pq_interval)),
            ("dh_interval", u64::from(self.dh_interval)),
            ("max_skip", u64::from(self.max_skip)),
            ("max_cached_keys", self.max_cached_keys as u64),
            ("replay_window", self.replay_window),
            ("max_pending_chunks", self.max_pending_chunks as u64),
            ("max_chunk_size", self.max_chunk_size as u64),
            ("nonce_limit", self.nonce_limit),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }

        let max = FrameHeader::MAX_PAYLOAD_SIZE as usize - ENVELOPE_OVERHEAD;
        if self.max_chunk_size > max {
            return Err(ConfigError::ChunkTooLarge { size: self.max_chunk_size, max });
        }

        if self.max_keysets < 2 {
            return Err(ConfigError::TooFewKeysets(self.max_keysets));
        }

        if self.cipher_suites.is_empty() {
            return Err(ConfigError::NoCipherSuites);
        }
        for (i, suite) in self.cipher_suites.iter().enumerate() {
            if self.cipher_suites[..i].contains(suite) {
                return Err(ConfigError::DuplicateCipherSuite(*suite));
            }
        }

        Ok(())
    }

    /// Ratchet policy slice of this configuration.
    #[must_use]
    pub fn ratchet_config(&self) -> RatchetConfig {
        RatchetConfig {
            dh_interval: self.dh_interval,
            pq_interval: self.pq_interval,
            max_skip: self.max_skip,
            max_cached_keys: self.max_cached_keys,
            max_keysets: self.max_keysets,
        }
    }
}
