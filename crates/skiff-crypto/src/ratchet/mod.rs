//! Triple ratchet
//!
//! Derives one message key per chunk from the session root:
//!
//! - [`ChainKey`]: symmetric per-message chain (forward secrecy per message)
//! - DH steps: fresh X25519 exchange mixed into the direction's root
//!   (post-compromise recovery)
//! - Post-quantum steps: every `pq_interval` messages, a fresh ML-KEM
//!   encapsulation is mixed in as well
//!
//! Out-of-order messages are served from a bounded skipped-key cache; see
//! [`RatchetEngine::stage_receive`].

mod chain;
mod engine;
mod header;
mod skipped;

pub use chain::{ChainKey, MessageKey};
pub use engine::{
    DEFAULT_DH_INTERVAL, DEFAULT_MAX_CACHED_KEYS, DEFAULT_MAX_KEYSETS, DEFAULT_MAX_SKIP,
    DEFAULT_PQ_INTERVAL, PeerKeyset, RatchetConfig, RatchetEngine, RatchetSnapshot,
    ReceiveKeyset, ReceiveStage,
};
pub use header::{KeyAdvert, RatchetHeader, StepKind};
