//! Sealed transfer payloads.
//!
//! Chunk, Finish and Receipt frames all carry a [`RatchetHeaderWire`] in the
//! clear (the receiver needs it to derive the message key) followed by an
//! AEAD ciphertext and detached tag. The ratchet header and every other
//! cleartext field are bound into the AAD by the session layer.

use serde::{Deserialize, Serialize};

/// Ratchet receive key set advertisement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAdvertWire {
    /// Key set generation
    pub generation: u32,

    /// X25519 public key for DH steps
    #[serde(with = "serde_bytes")]
    pub dh_public: [u8; 32],

    /// ML-KEM-768 encapsulation key for post-quantum steps
    #[serde(with = "serde_bytes")]
    pub pq_public: Vec<u8>,
}

/// Ratchet position of one sealed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeaderWire {
    /// Sending epoch
    pub epoch: u32,

    /// Message counter within the epoch
    pub counter: u32,

    /// Length of the sender's previous chain
    pub prev_chain_len: u32,

    /// Sender's ratchet public key for this epoch
    #[serde(with = "serde_bytes")]
    pub dh_public: [u8; 32],

    /// Receiver key set generation the epoch was stepped against
    pub target_generation: u32,

    /// ML-KEM ciphertext, present on every message of a post-quantum epoch
    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub pq_ciphertext: Option<Vec<u8>>,

    /// Sender's newest receive key set, until acknowledged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advert: Option<KeyAdvertWire>,
}

/// Encrypted file chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedChunk {
    /// Ratchet position of the message key
    pub ratchet: RatchetHeaderWire,

    /// Chunk index within the file
    pub index: u64,

    /// Manifest chain value before this chunk
    #[serde(with = "serde_bytes")]
    pub prev_link: [u8; 32],

    /// Ciphertext (same length as the plaintext)
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,

    /// Detached AEAD tag
    #[serde(with = "serde_bytes")]
    pub tag: [u8; 16],
}

/// Encrypted control message (Finish and Receipt)
///
/// The plaintext is an encoded manifest summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedControl {
    /// Ratchet position of the message key
    pub ratchet: RatchetHeaderWire,

    /// Ciphertext
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,

    /// Detached AEAD tag
    #[serde(with = "serde_bytes")]
    pub tag: [u8; 16],
}
