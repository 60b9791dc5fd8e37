//! Skiff Cryptographic Core
//!
//! End-to-end protection for peer-to-peer file transfers. Pure state and
//! functions: no I/O, no clocks, and all randomness is supplied by the caller
//! so that every run can be replayed deterministically in tests.
//!
//! # Key Lifecycle
//!
//! ```text
//! X25519 ⊕ ML-KEM-768 (hybrid handshake)
//!        │
//!        ▼
//! SessionRootSecret ──────────────▶ wiped once the schedule exists
//!        │
//!        ▼
//! KeySchedule (one HKDF per session)
//!        │
//!        ├─▶ direction root + initial chain (per direction)
//!        │          │
//!        │          ▼
//!        │   DH / PQ steps ──▶ new root + chain
//!        │          │
//!        │          ▼
//!        │   Symmetric chain ──▶ MessageKey (one per chunk)
//!        │
//!        └─▶ nonce salt (per direction)
//!                   │
//!                   ▼
//!          DirectionalNonce ──▶ AEAD seal/open
//! ```
//!
//! Separately from the keys, every chunk is linked into a BLAKE3 hash chain
//! ([`integrity`]) so reordering, substitution and truncation are caught even
//! if an individual AEAD key were compromised.
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain keys are overwritten after deriving the next key
//! - Message keys are zeroized on drop and used for a single chunk
//! - DH steps use fresh ephemeral X25519 keys
//!
//! Post-Compromise Security:
//! - Every DH step mixes a fresh shared secret into the direction's root
//! - Every `pq_interval` messages an ML-KEM encapsulation is mixed in too
//!
//! Authenticity:
//! - Tags are verified before any plaintext leaves [`ChunkCipher::decrypt`]
//! - Tag, digest and confirmation comparisons are constant-time
//! - Nonces are counter-based and reserved before use, never random

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cipher;
pub mod ct;
pub mod error;
pub mod hybrid;
pub mod integrity;
mod kdf;
mod kem;
pub mod nonce;
pub mod ratchet;

pub use cipher::{ChunkCipher, ChunkRecord, CipherSuite, TAG_SIZE};
pub use error::{AuthError, CryptoError, HandshakeError, IntegrityError, RatchetError, ResourceError};
pub use hybrid::{
    HandshakeAnswer, HandshakeOffer, HybridInitiator, PROTOCOL_VERSION, Role, SessionRootSecret,
    respond,
};
pub use integrity::{
    IntegrityVerifier, ManifestEntry, ManifestSummary, TransferManifest, VerifiedChunk,
};
pub use kem::{MLKEM_CIPHERTEXT_SIZE, MLKEM_PUBLIC_KEY_SIZE, X25519_PUBLIC_KEY_SIZE};
pub use nonce::{Direction, DirectionalNonce, NonceAllocator};
pub use ratchet::{
    KeyAdvert, MessageKey, PeerKeyset, RatchetConfig, RatchetEngine, RatchetHeader,
    RatchetSnapshot, ReceiveKeyset, ReceiveStage, StepKind,
};
