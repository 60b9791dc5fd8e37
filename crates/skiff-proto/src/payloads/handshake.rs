//! Handshake and abort payloads.
//!
//! The initiator opens with [`Hello`]; the responder answers with
//! [`HelloReply`]. Both are plaintext: their integrity comes from the
//! handshake transcript, which both sides hash into the session root, and from
//! the responder's key-confirmation tag.

use serde::{Deserialize, Serialize};

use super::transfer::KeyAdvertWire;

/// Initiator's handshake offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Hybrid key agreement version
    pub version: u8,

    /// Ephemeral X25519 public key
    #[serde(with = "serde_bytes")]
    pub x25519_public: [u8; 32],

    /// Ephemeral ML-KEM-768 encapsulation key
    #[serde(with = "serde_bytes")]
    pub mlkem_public: Vec<u8>,

    /// Offered cipher suite ids, most preferred first
    #[serde(with = "serde_bytes")]
    pub cipher_suites: Vec<u8>,

    /// Initiator's first ratchet receive key set
    pub keyset: KeyAdvertWire,
}

/// Responder's handshake answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    /// Hybrid key agreement version
    pub version: u8,

    /// Ephemeral X25519 public key
    #[serde(with = "serde_bytes")]
    pub x25519_public: [u8; 32],

    /// ML-KEM-768 ciphertext for the initiator's encapsulation key
    #[serde(with = "serde_bytes")]
    pub mlkem_ciphertext: Vec<u8>,

    /// Selected cipher suite id
    pub cipher_suite: u8,

    /// Responder's first ratchet receive key set
    pub keyset: KeyAdvertWire,

    /// Responder's key-confirmation tag over the new root
    #[serde(with = "serde_bytes")]
    pub confirmation: [u8; 32],
}

/// Session abort
///
/// Carries a coarse reason code only. Which check failed is never sent to
/// the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abort {
    /// Reason code (see associated constants)
    pub code: u16,
}

impl Abort {
    /// The local user cancelled the transfer.
    pub const CANCELLED: u16 = 0x0001;
    /// The transfer could not be verified.
    pub const VERIFICATION_FAILED: u16 = 0x0002;
    /// The peer violated the protocol.
    pub const PROTOCOL_VIOLATION: u16 = 0x0003;
    /// A local resource limit was reached.
    pub const RESOURCE_EXHAUSTED: u16 = 0x0004;
}
