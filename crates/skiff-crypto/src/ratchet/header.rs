//! Per-message ratchet header.

use serde::{Deserialize, Serialize};

/// Kind of asymmetric step that opened an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StepKind {
    /// X25519 only
    Dh = 1,
    /// X25519 plus ML-KEM-768 encapsulation
    PostQuantum = 2,
}

/// A freshly generated receive key set, advertised to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAdvert {
    /// Generation number of the key set
    pub generation: u32,
    /// X25519 public key peers step against
    pub dh_public: [u8; 32],
    /// ML-KEM-768 encapsulation key peers encapsulate to
    pub pq_public: Vec<u8>,
}

/// Ratchet metadata carried by every sealed frame.
///
/// The header is bound into the AEAD associated data, so any modification
/// fails authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Sending epoch (number of asymmetric steps so far)
    pub epoch: u32,
    /// Position in the epoch's chain
    pub counter: u32,
    /// Length of the previous epoch's chain
    pub prev_chain_len: u32,
    /// Sender's ratchet public key for this epoch (zero in epoch 0)
    pub dh_public: [u8; 32],
    /// Receive key set generation the step was made against
    pub target_generation: u32,
    /// ML-KEM ciphertext, present on every message of a post-quantum epoch
    pub pq_ciphertext: Option<Vec<u8>>,
    /// New receive key set for the other direction, until acknowledged
    pub advert: Option<KeyAdvert>,
}

impl RatchetHeader {
    /// Kind of step that opened this header's epoch, if any.
    pub fn step_kind(&self) -> Option<StepKind> {
        match (self.epoch, &self.pq_ciphertext) {
            (0, _) => None,
            (_, Some(_)) => Some(StepKind::PostQuantum),
            (_, None) => Some(StepKind::Dh),
        }
    }

    /// Append an unambiguous encoding to `out` for use as associated data.
    pub fn encode_aad(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.epoch.to_be_bytes());
        out.extend_from_slice(&self.counter.to_be_bytes());
        out.extend_from_slice(&self.prev_chain_len.to_be_bytes());
        out.extend_from_slice(&self.dh_public);
        out.extend_from_slice(&self.target_generation.to_be_bytes());

        match &self.pq_ciphertext {
            Some(ct) => {
                out.push(1);
                push_bytes(out, ct);
            },
            None => out.push(0),
        }

        match &self.advert {
            Some(advert) => {
                out.push(1);
                out.extend_from_slice(&advert.generation.to_be_bytes());
                out.extend_from_slice(&advert.dh_public);
                push_bytes(out, &advert.pq_public);
            },
            None => out.push(0),
        }
    }
}

fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}
