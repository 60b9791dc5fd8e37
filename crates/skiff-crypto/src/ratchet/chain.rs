//! Symmetric chain ratchet.
//!
//! # Security Properties
//!
//! - Forward Secrecy: the old chain key is zeroized as soon as the next one
//!   exists
//! - Key Uniqueness: the message key binds `(epoch, counter)` explicitly, so a
//!   stalled chain can never hand out the same key for two counters
//! - Determinism: same seed always produces the same key sequence

use zeroize::{Zeroize, Zeroizing};

use crate::{
    error::RatchetError,
    kdf::{hmac, labels},
};

/// A message key derived from a chain.
///
/// Used for exactly one chunk, then dropped.
#[derive(Clone)]
pub struct MessageKey {
    /// 32-byte AEAD key
    key: [u8; 32],
    /// Epoch of the chain that produced it
    epoch: u32,
    /// Position within that chain
    counter: u32,
}

impl MessageKey {
    /// 32-byte AEAD key.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Ratchet epoch this key belongs to.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Chain counter this key was derived at.
    pub fn counter(&self) -> u32 {
        self.counter
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKey")
            .field("epoch", &self.epoch)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// One symmetric chain.
///
/// Each [`advance`](Self::advance) call:
/// 1. Derives the message key for the current counter
/// 2. Derives the next chain key
/// 3. Overwrites the old chain key
#[derive(Clone)]
pub struct ChainKey {
    key: Zeroizing<[u8; 32]>,
    counter: u32,
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainKey").field("counter", &self.counter).finish_non_exhaustive()
    }
}

impl ChainKey {
    /// Start a chain at counter 0.
    pub fn new(seed: [u8; 32]) -> Self {
        Self { key: Zeroizing::new(seed), counter: 0 }
    }

    pub(crate) fn from_secret(seed: &Zeroizing<[u8; 32]>) -> Self {
        Self { key: seed.clone(), counter: 0 }
    }

    /// Counter of the next message key.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Derive the key for the current counter and move to the next.
    pub fn advance(&mut self, epoch: u32) -> Result<MessageKey, RatchetError> {
        if self.counter == u32::MAX {
            return Err(RatchetError::CounterOverflow { epoch });
        }

        let message_key = hmac(
            &*self.key,
            &[labels::MESSAGE, &epoch.to_be_bytes(), &self.counter.to_be_bytes()],
        );
        let mut next = hmac(&*self.key, &[labels::CHAIN]);

        self.key.copy_from_slice(&next);
        next.zeroize();

        let counter = self.counter;
        self.counter += 1;

        Ok(MessageKey { key: message_key, epoch, counter })
    }
}
