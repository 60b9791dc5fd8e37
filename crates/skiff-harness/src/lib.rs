//! Deterministic simulation harness for Skiff transfers.
//!
//! Two sessions are wired together through in-memory links that drop,
//! reorder and corrupt chunk frames under a seeded RNG. Every key, every
//! fault and every file byte derives from one seed, so a failing run replays
//! exactly.
//!
//! # Invariant Testing
//!
//! The `invariants` module provides behavioral testing through invariant
//! checks over a recorded [`TransferTrace`]. Invariants verify WHAT must be
//! true across all execution paths, not specific scenarios. Use
//! [`InvariantRegistry::standard()`] for the transfer invariants.
//!
//! # Network Simulation
//!
//! The `net` module runs sessions over any tokio byte stream, which the
//! tests point at turmoil's simulated TCP.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod driver;
pub mod invariants;
pub mod link;
pub mod net;
pub mod scenario;
pub mod sim_env;

pub use driver::{DriverConfig, DriverError, TransferDriver, TransferReport};
pub use invariants::{
    DeliveredIntegrity, Invariant, InvariantRegistry, InvariantResult, NonceUniqueness,
    RatchetMonotonicity, RatchetObservation, TerminalStability, TransferTrace, Violation,
    WireRecord,
};
pub use link::{ChaoticLink, Fault, LinkConfig, LinkError, LinkStats};
pub use scenario::Scenario;
pub use sim_env::SimEnv;
