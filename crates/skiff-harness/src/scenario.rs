//! Reusable transfer scenarios.
//!
//! Each preset fixes the file shape, the session policy, the link faults and
//! how the driver feeds chunks. File contents come from the run seed, so a
//! scenario plus a seed fully determines a run.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use skiff_core::SessionConfig;

use crate::{
    driver::{DriverConfig, DriverError, TransferDriver, TransferReport},
    invariants::InvariantRegistry,
    link::{ChaoticLink, Fault, LinkConfig},
    sim_env::SimEnv,
};

/// A complete transfer setup.
#[derive(Debug, Clone)]
pub struct Scenario {
    /// Short name used in logs
    pub name: &'static str,
    /// Chunks in the file
    pub chunks: usize,
    /// Bytes per chunk
    pub chunk_size: usize,
    /// Policy for both sessions
    pub session: SessionConfig,
    /// How the driver feeds the sender
    pub driver: DriverConfig,
    /// Random faults on the sender to receiver link
    pub link: LinkConfig,
    /// Scripted faults on the sender to receiver link
    pub faults: Vec<Fault>,
}

impl Scenario {
    /// 1,000 chunks of 16 KiB over a perfect link.
    pub fn sequential() -> Self {
        Self {
            name: "sequential",
            chunks: 1000,
            chunk_size: 16 * 1024,
            session: SessionConfig::default(),
            driver: DriverConfig::default(),
            link: LinkConfig::reliable(),
            faults: Vec::new(),
        }
    }

    /// Chunks 50 and 51 arrive swapped.
    pub fn swapped() -> Self {
        Self {
            name: "swapped",
            chunks: 100,
            chunk_size: 1024,
            faults: vec![Fault::Swap { first: 50, second: 51 }],
            ..Self::sequential()
        }
    }

    /// One byte of chunk 700's ciphertext is flipped, and nothing is resent.
    pub fn tampered() -> Self {
        Self {
            name: "tampered",
            chunks: 1000,
            chunk_size: 1024,
            driver: DriverConfig { max_resend_rounds: 0, ..DriverConfig::default() },
            faults: vec![Fault::FlipCiphertext { index: 700 }],
            ..Self::sequential()
        }
    }

    /// A post-quantum step every `interval` messages, one chunk per send.
    pub fn post_quantum(interval: u32) -> Self {
        let chunks = interval as usize * 3 + 1;
        Self {
            name: "post-quantum",
            chunks,
            chunk_size: 512,
            session: SessionConfig { pq_interval: interval, ..SessionConfig::default() },
            driver: DriverConfig { batch_size: 1, ..DriverConfig::default() },
            ..Self::sequential()
        }
    }

    /// Random drop, reorder and tamper with short ratchet intervals.
    pub fn chaos(link: LinkConfig) -> Self {
        Self {
            name: "chaos",
            chunks: 200,
            chunk_size: 256,
            session: SessionConfig { dh_interval: 16, pq_interval: 40, ..SessionConfig::default() },
            driver: DriverConfig { batch_size: 16, max_resend_rounds: 32, ..DriverConfig::default() },
            link,
            ..Self::sequential()
        }
    }

    /// Deterministic file contents for `seed`.
    pub fn file(&self, seed: u64) -> Vec<Vec<u8>> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        rng.set_stream(u64::MAX);
        (0..self.chunks)
            .map(|_| {
                let mut chunk = vec![0u8; self.chunk_size];
                rng.fill_bytes(&mut chunk);
                chunk
            })
            .collect()
    }

    /// Driver wired for this scenario, checking the standard invariants.
    pub fn driver(&self, seed: u64) -> Result<TransferDriver, DriverError> {
        let link = ChaoticLink::new(self.link, seed)?.with_faults(self.faults.iter().copied());
        let driver =
            TransferDriver::new(&self.session, self.driver, &SimEnv::with_seed(seed), link)?;
        Ok(driver.with_invariants(InvariantRegistry::standard()))
    }

    /// Run the whole transfer.
    ///
    /// Returns the driver as well, so callers can inspect the trace.
    pub fn run(&self, seed: u64) -> Result<(TransferDriver, TransferReport), DriverError> {
        let file = self.file(seed);
        let mut driver = self.driver(seed)?;
        let report = driver.run(&file)?;
        tracing::info!(
            scenario = self.name,
            seed,
            delivered = report.delivered_chunks,
            rejections = report.rejections.len(),
            "scenario finished"
        );
        Ok((driver, report))
    }
}
