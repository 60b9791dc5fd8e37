//! Production Environment backed by the OS RNG.

use crate::env::Environment;

/// Production environment using the operating system's cryptographic RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. A session without working randomness cannot
/// generate keys safely, and continuing would be worse than stopping.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - keys cannot be generated");
    }
}
