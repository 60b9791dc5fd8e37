//! Invariants over a recorded transfer.
//!
//! The [`TransferDriver`](crate::TransferDriver) appends to a
//! [`TransferTrace`] as it pumps frames: what went on the wire, where each
//! ratchet stood, what was delivered and which states each session passed
//! through. After every step it runs the registered checks against the whole
//! trace, so a violation is caught at the step that introduced it rather
//! than at the end of the run.
//!
//! Checks state properties of every run (no nonce repeats, ratchets only move
//! forward), not expected outcomes of one scenario. Scenario outcomes belong
//! in tests.
//!
//! ```ignore
//! let driver = TransferDriver::new(&config, DriverConfig::default(), &env, link)?
//!     .with_invariants(InvariantRegistry::standard());
//! ```

mod checks;
mod snapshot;

pub use checks::{DeliveredIntegrity, NonceUniqueness, RatchetMonotonicity, TerminalStability};
pub use snapshot::{RatchetObservation, TransferTrace, WireRecord};
use thiserror::Error;

/// Outcome of one check.
pub type InvariantResult = Result<(), Violation>;

/// A check that failed, and why.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{invariant}: {message}")]
pub struct Violation {
    /// Name of the failed check
    pub invariant: &'static str,
    /// What the trace showed
    pub message: String,
}

/// A property every transfer trace must satisfy.
pub trait Invariant: Send + Sync {
    /// Stable name, used in violations and logs.
    fn name(&self) -> &'static str;

    /// Check the trace recorded so far.
    fn check(&self, trace: &TransferTrace) -> InvariantResult;
}

/// Set of checks the driver runs after every step.
#[derive(Default)]
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantRegistry {
    /// Registry with no checks.
    pub fn new() -> Self {
        Self::default()
    }

    /// [`NonceUniqueness`], [`RatchetMonotonicity`], [`DeliveredIntegrity`]
    /// and [`TerminalStability`].
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(NonceUniqueness);
        registry.add(RatchetMonotonicity);
        registry.add(DeliveredIntegrity);
        registry.add(TerminalStability);
        registry
    }

    /// Register another check.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Run every check, collecting all violations rather than stopping at
    /// the first.
    pub fn check_all(&self, trace: &TransferTrace) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|invariant| invariant.check(trace).err()).collect();
        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Names of the registered checks, in run order.
    pub fn names(&self) -> Vec<&'static str> {
        self.invariants.iter().map(|invariant| invariant.name()).collect()
    }

    /// Number of registered checks.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Whether no checks are registered.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_runs_transfer_checks() {
        let registry = InvariantRegistry::standard();
        assert_eq!(
            registry.names(),
            ["nonce_uniqueness", "ratchet_monotonicity", "delivered_integrity", "terminal_stability"]
        );
    }

    #[test]
    fn empty_trace_satisfies_standard_checks() {
        assert!(InvariantRegistry::standard().check_all(&TransferTrace::default()).is_ok());
    }

    #[test]
    fn every_violation_is_reported() {
        let mut trace = TransferTrace::new(vec![b"a".to_vec()]);
        trace.delivered.push((0, b"b".to_vec()));
        trace.delivered.push((1, b"c".to_vec()));

        let violations = InvariantRegistry::standard().check_all(&trace).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, "delivered_integrity");
        assert!(violations[0].to_string().starts_with("delivered_integrity: "));
    }
}
