//! Directional nonce allocation.
//!
//! Nonces are never random. Each (session, direction) pair owns one
//! [`NonceAllocator`] and every nonce is a fixed direction constant followed by
//! a monotonically increasing counter. Uniqueness is enforced by a reservation
//! check rather than trusted to the counter:
//!
//! - Sending: [`NonceAllocator::allocate`] issues the next counter and marks it
//!   used in the same call.
//! - Receiving: [`NonceAllocator::reserve`] is a compare-and-reserve over a
//!   sliding bitmap window. A counter already marked, or older than the window,
//!   is refused.
//!
//! Both operations take `&mut self`, so two in-flight operations on the same
//! direction cannot interleave between the check and the mark.

use serde::{Deserialize, Serialize};

use crate::error::ResourceError;

/// Bytes of per-session salt mixed into extended (24-byte) nonces.
pub const NONCE_SALT_SIZE: usize = 12;

/// Default size of the receive replay window, in counters.
pub const DEFAULT_REPLAY_WINDOW: u64 = 4096;

/// Traffic direction within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Frames sent by the handshake initiator
    InitiatorToResponder,
    /// Frames sent by the handshake responder
    ResponderToInitiator,
}

impl Direction {
    /// Fixed-width direction constant placed at the start of every nonce.
    pub const fn tag(self) -> [u8; 4] {
        match self {
            Self::InitiatorToResponder => *b"I->R",
            Self::ResponderToInitiator => *b"R->I",
        }
    }

    /// The other direction.
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::InitiatorToResponder => Self::ResponderToInitiator,
            Self::ResponderToInitiator => Self::InitiatorToResponder,
        }
    }

    /// Single-byte encoding used in KDF contexts.
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::InitiatorToResponder => 0x01,
            Self::ResponderToInitiator => 0x02,
        }
    }
}

/// A nonce identity: direction plus counter.
///
/// The byte form depends on the cipher suite; see
/// [`DirectionalNonce::to_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectionalNonce {
    /// Direction the nonce belongs to
    pub direction: Direction,
    /// Per-direction counter
    pub counter: u64,
}

impl DirectionalNonce {
    /// Materialize the nonce.
    ///
    /// - 12 bytes: `direction(4) || counter(8)`
    /// - 24 bytes: `direction(4) || salt(12) || counter(8)`
    ///
    /// Returns a 24-byte buffer; only the first `len` bytes are meaningful.
    pub fn to_bytes(&self, salt: &[u8; NONCE_SALT_SIZE], len: usize) -> [u8; 24] {
        debug_assert!(len == 12 || len == 24);

        let mut out = [0u8; 24];
        out[..4].copy_from_slice(&self.direction.tag());
        if len == 24 {
            out[4..16].copy_from_slice(salt);
            out[16..24].copy_from_slice(&self.counter.to_be_bytes());
        } else {
            out[4..12].copy_from_slice(&self.counter.to_be_bytes());
        }
        out
    }
}

/// Collision-free nonce issuer and replay filter for one direction.
///
/// # Invariants
///
/// - A counter is handed out or accepted at most once while it is inside the
///   window.
/// - `allocate` never returns a counter at or beyond `limit`; it fails
///   permanently instead of wrapping.
/// - `highest` never decreases.
#[derive(Debug, Clone)]
pub struct NonceAllocator {
    direction: Direction,
    /// Next counter to issue when sending
    next: u64,
    /// Exclusive upper bound on counters
    limit: u64,
    /// Highest counter reserved so far
    highest: Option<u64>,
    /// Bitmap of reserved counters, indexed by `counter % window`
    used: Vec<u64>,
    /// Window size in counters (multiple of 64)
    window: u64,
}

impl NonceAllocator {
    /// Create an allocator with the default window and the full `u64` range.
    pub fn new(direction: Direction) -> Self {
        Self::with_limits(direction, DEFAULT_REPLAY_WINDOW, u64::MAX)
    }

    /// Create an allocator with an explicit replay window and counter limit.
    ///
    /// `window` is rounded up to a multiple of 64 (minimum 64).
    pub fn with_limits(direction: Direction, window: u64, limit: u64) -> Self {
        let window = window.max(64).div_ceil(64) * 64;
        Self {
            direction,
            next: 0,
            limit,
            highest: None,
            used: vec![0; (window / 64) as usize],
            window,
        }
    }

    /// Direction this allocator serves.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Number of counters issued by [`allocate`](Self::allocate).
    pub fn issued(&self) -> u64 {
        self.next
    }

    /// Issue the next sending nonce.
    ///
    /// # Errors
    ///
    /// - `ResourceError::NonceExhausted` once the counter limit is reached
    /// - `ResourceError::NonceReused` if the counter was somehow already
    ///   reserved (indicates a local bug; never expected)
    pub fn allocate(&mut self) -> Result<DirectionalNonce, ResourceError> {
        if self.next >= self.limit {
            return Err(ResourceError::NonceExhausted { direction: self.direction });
        }

        let counter = self.next;
        self.reserve(counter)?;
        self.next += 1;

        Ok(DirectionalNonce { direction: self.direction, counter })
    }

    /// Reserve a counter seen on the receive path.
    ///
    /// Check and mark happen in one call.
    ///
    /// # Errors
    ///
    /// - `ResourceError::NonceExhausted` if `counter` is at or past the limit
    /// - `ResourceError::NonceReused` if already reserved
    /// - `ResourceError::NonceOutsideWindow` if older than the window
    pub fn reserve(&mut self, counter: u64) -> Result<DirectionalNonce, ResourceError> {
        if counter >= self.limit {
            return Err(ResourceError::NonceExhausted { direction: self.direction });
        }

        match self.highest {
            None => {
                self.used.fill(0);
                self.set(counter);
                self.highest = Some(counter);
            },
            Some(highest) if counter > highest => {
                let advance = counter - highest;
                if advance >= self.window {
                    self.used.fill(0);
                } else {
                    for cleared in (highest + 1)..=counter {
                        self.clear(cleared);
                    }
                }
                self.set(counter);
                self.highest = Some(counter);
            },
            Some(highest) => {
                if highest - counter >= self.window {
                    return Err(ResourceError::NonceOutsideWindow {
                        counter,
                        floor: highest + 1 - self.window,
                    });
                }
                if self.is_set(counter) {
                    return Err(ResourceError::NonceReused { counter });
                }
                self.set(counter);
            },
        }

        Ok(DirectionalNonce { direction: self.direction, counter })
    }

    /// Undo a reservation whose message failed to authenticate.
    ///
    /// The high-water mark is kept; only the bit is cleared, so a genuine
    /// retransmission at the same counter can still be accepted.
    pub fn release(&mut self, counter: u64) {
        if let Some(highest) = self.highest {
            if counter <= highest && highest - counter < self.window {
                self.clear(counter);
            }
        }
    }

    fn slot(&self, counter: u64) -> (usize, u64) {
        let bit = counter % self.window;
        ((bit / 64) as usize, 1u64 << (bit % 64))
    }

    fn set(&mut self, counter: u64) {
        let (word, mask) = self.slot(counter);
        self.used[word] |= mask;
    }

    fn clear(&mut self, counter: u64) {
        let (word, mask) = self.slot(counter);
        self.used[word] &= !mask;
    }

    fn is_set(&self, counter: u64) -> bool {
        let (word, mask) = self.slot(counter);
        self.used[word] & mask != 0
    }
}
