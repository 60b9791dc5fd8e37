//! Seeded environment for simulation.
//!
//! Every byte of randomness a session draws (session ids, ephemeral keys,
//! ratchet key sets) comes from a ChaCha20 stream, so a failing run replays
//! exactly from its seed.

use std::sync::{Arc, Mutex, PoisonError};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use skiff_core::Environment;

/// Deterministic [`Environment`] backed by a seeded ChaCha20 stream.
///
/// Clones share one stream. Use [`fork`](Self::fork) to give each simulated
/// peer an independent stream derived from the same seed.
#[derive(Clone)]
pub struct SimEnv {
    seed: u64,
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").field("seed", &self.seed).finish_non_exhaustive()
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl SimEnv {
    /// Environment drawing from stream 0 of `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self::stream(seed, 0)
    }

    /// Independent environment on stream `stream` of the same seed.
    pub fn fork(&self, stream: u64) -> Self {
        Self::stream(self.seed, stream)
    }

    /// Seed this environment was created from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn stream(seed: u64, stream: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        rng.set_stream(stream);
        Self { seed, rng: Arc::new(Mutex::new(rng)) }
    }
}

impl Environment for SimEnv {
    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}
