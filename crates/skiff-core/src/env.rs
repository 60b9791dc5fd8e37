//! Environment abstraction for deterministic testing.
//!
//! Decouples session logic from system entropy. Production uses
//! [`SystemEnv`](crate::SystemEnv); the simulation harness supplies a seeded
//! environment so that every run, including every generated key, can be
//! replayed.

use rand::{CryptoRng, RngCore};

/// Abstract source of randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Given the same seed, a simulated environment produces the same bytes
pub trait Environment: Clone + Send + Sync + 'static {
    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u128`.
    ///
    /// Used for session ids.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }
}

/// Exposes an [`Environment`] as a `rand` RNG for key generation.
///
/// Marked `CryptoRng` because every `Environment` promises cryptographic
/// entropy outside simulation.
#[derive(Debug)]
pub struct EnvRng<'a, E>(&'a E);

impl<'a, E: Environment> EnvRng<'a, E> {
    /// Borrow `env` as an RNG.
    pub fn new(env: &'a E) -> Self {
        Self(env)
    }
}

impl<E: Environment> RngCore for EnvRng<'_, E> {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.0.random_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.0.random_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.random_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.0.random_bytes(dest);
        Ok(())
    }
}

impl<E: Environment> CryptoRng for EnvRng<'_, E> {}
