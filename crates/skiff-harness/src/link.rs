//! Chaotic in-memory link.
//!
//! Carries encoded frames one way between two sessions and injects faults on
//! chunk frames: seeded random drop, adjacent reordering and bit flips, plus
//! scripted faults aimed at a specific chunk index. Control frames (handshake,
//! Finish, Receipt, Abort) always pass unharmed and in order.
//!
//! Scripted faults hit the first transmission of a chunk only, so a
//! retransmission can repair them. Random faults hit every transmission.

use std::collections::{HashMap, VecDeque};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use skiff_proto::{Frame, FrameFlags, Opcode, Payload, ProtocolError};
use thiserror::Error;

/// Random fault rates, each a probability per chunk frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Chance a chunk frame is lost
    pub drop_rate: f64,
    /// Chance a chunk frame is held back behind the next one
    pub reorder_rate: f64,
    /// Chance one random bit of a chunk frame is flipped
    pub tamper_rate: f64,
}

impl LinkConfig {
    /// A link that never misbehaves.
    pub fn reliable() -> Self {
        Self::default()
    }

    /// Check every rate lies in `[0, 1]`.
    pub fn validate(&self) -> Result<(), LinkError> {
        let rates = [
            ("drop_rate", self.drop_rate),
            ("reorder_rate", self.reorder_rate),
            ("tamper_rate", self.tamper_rate),
        ];
        for (field, rate) in rates {
            if !(0.0..=1.0).contains(&rate) {
                return Err(LinkError::InvalidRate { field, rate });
            }
        }
        Ok(())
    }
}

/// Link configuration errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    /// A fault rate outside `[0, 1]`
    #[error("{field} must lie in [0, 1], got {rate}")]
    InvalidRate {
        /// Offending field
        field: &'static str,
        /// Configured value
        rate: f64,
    },

    /// Frame could not be encoded for the wire
    #[error("frame encoding failed: {0}")]
    Encode(#[from] ProtocolError),
}

/// A fault aimed at one chunk index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Lose the chunk
    Drop {
        /// Chunk index
        index: u64,
    },
    /// Flip one byte in the middle of the chunk's ciphertext
    FlipCiphertext {
        /// Chunk index
        index: u64,
    },
    /// Deliver `second` before `first`
    Swap {
        /// Chunk held back
        first: u64,
        /// Chunk that overtakes it
        second: u64,
    },
}

/// What the link did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStats {
    /// Frames handed to the link
    pub sent: u64,
    /// Frames lost
    pub dropped: u64,
    /// Frames delivered out of order
    pub reordered: u64,
    /// Frames altered in flight
    pub tampered: u64,
}

/// One direction of a simulated connection.
pub struct ChaoticLink {
    config: LinkConfig,
    rng: ChaCha20Rng,
    faults: Vec<Fault>,
    queue: VecDeque<Vec<u8>>,
    /// Frame held back by a random reorder
    held: Option<Vec<u8>>,
    /// Frames held back by a scripted swap, keyed by the chunk that releases them
    swaps: HashMap<u64, Vec<u8>>,
    stats: LinkStats,
}

impl std::fmt::Debug for ChaoticLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaoticLink")
            .field("config", &self.config)
            .field("faults", &self.faults)
            .field("queued", &self.queue.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ChaoticLink {
    /// Link with random faults drawn from `seed`.
    pub fn new(config: LinkConfig, seed: u64) -> Result<Self, LinkError> {
        config.validate()?;
        Ok(Self {
            config,
            rng: ChaCha20Rng::seed_from_u64(seed),
            faults: Vec::new(),
            queue: VecDeque::new(),
            held: None,
            swaps: HashMap::new(),
            stats: LinkStats::default(),
        })
    }

    /// Link that delivers everything in order.
    pub fn reliable() -> Self {
        Self {
            config: LinkConfig::reliable(),
            rng: ChaCha20Rng::seed_from_u64(0),
            faults: Vec::new(),
            queue: VecDeque::new(),
            held: None,
            swaps: HashMap::new(),
            stats: LinkStats::default(),
        }
    }

    /// Add scripted faults.
    #[must_use]
    pub fn with_faults(mut self, faults: impl IntoIterator<Item = Fault>) -> Self {
        self.faults.extend(faults);
        self
    }

    /// Counters so far.
    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Whether any frame is waiting, including held-back ones.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.held.is_none() && self.swaps.is_empty()
    }

    /// Hand a frame to the link.
    pub fn push(&mut self, frame: &Frame) -> Result<(), LinkError> {
        self.stats.sent += 1;

        let chunk_index = match frame.header.opcode_enum() {
            Some(Opcode::Chunk) => match Payload::from_frame(frame)? {
                Payload::Chunk(chunk) => Some(chunk.index),
                _ => None,
            },
            _ => None,
        };
        let Some(index) = chunk_index else {
            self.queue.push_back(frame.to_vec()?);
            return Ok(());
        };

        let original = !frame.header.flags().contains(FrameFlags::RETRANSMIT);
        if original && self.scripted(index, frame)? {
            return Ok(());
        }
        self.random(frame.to_vec()?);
        Ok(())
    }

    /// Take every frame ready for delivery, releasing held-back frames last.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut ready: Vec<Vec<u8>> = self.queue.drain(..).collect();
        if let Some(held) = self.held.take() {
            ready.push(held);
        }
        let mut swapped: Vec<_> = self.swaps.drain().collect();
        swapped.sort_by_key(|(release, _)| *release);
        ready.extend(swapped.into_iter().map(|(_, bytes)| bytes));
        ready
    }

    /// Apply a scripted fault for `index`. False if none is scripted.
    fn scripted(&mut self, index: u64, frame: &Frame) -> Result<bool, LinkError> {
        let Some(position) = self.faults.iter().position(|fault| fault.targets(index)) else {
            return Ok(false);
        };

        match self.faults[position] {
            Fault::Drop { .. } => {
                self.faults.remove(position);
                self.stats.dropped += 1;
            },
            Fault::FlipCiphertext { .. } => {
                self.faults.remove(position);
                let Payload::Chunk(mut chunk) = Payload::from_frame(frame)? else {
                    return Ok(false);
                };
                let mid = chunk.ciphertext.len() / 2;
                match chunk.ciphertext.get_mut(mid) {
                    Some(byte) => *byte ^= 0xFF,
                    None => chunk.tag[0] ^= 0xFF,
                }
                self.stats.tampered += 1;
                self.queue.push_back(Payload::Chunk(chunk).into_frame(frame.header)?.to_vec()?);
            },
            Fault::Swap { first, second } if index == first => {
                self.swaps.insert(second, frame.to_vec()?);
                self.stats.reordered += 1;
            },
            Fault::Swap { .. } => {
                self.faults.remove(position);
                self.queue.push_back(frame.to_vec()?);
                if let Some(held) = self.swaps.remove(&index) {
                    self.queue.push_back(held);
                }
            },
        }
        Ok(true)
    }

    fn random(&mut self, mut bytes: Vec<u8>) {
        if self.rng.gen_bool(self.config.drop_rate) {
            self.stats.dropped += 1;
            return;
        }
        if self.rng.gen_bool(self.config.tamper_rate) && !bytes.is_empty() {
            let at = self.rng.gen_range(0..bytes.len());
            bytes[at] ^= 1u8 << self.rng.gen_range(0..8u32);
            self.stats.tampered += 1;
        }

        if let Some(held) = self.held.take() {
            self.queue.push_back(bytes);
            self.queue.push_back(held);
        } else if self.rng.gen_bool(self.config.reorder_rate) {
            self.held = Some(bytes);
            self.stats.reordered += 1;
        } else {
            self.queue.push_back(bytes);
        }
    }
}

impl Fault {
    fn targets(&self, index: u64) -> bool {
        match *self {
            Self::Drop { index: target } | Self::FlipCiphertext { index: target } => {
                target == index
            },
            Self::Swap { first, second } => first == index || second == index,
        }
    }
}
