//! Standard invariant checks.
//!
//! These invariants capture behavioral properties that must always hold.
//! They verify WHAT must be true, not specific test scenarios.

use std::collections::{HashMap, HashSet};

use skiff_core::SessionState;
use skiff_crypto::{Direction, Role};

use super::{Invariant, InvariantResult, TransferTrace, Violation};

/// A nonce counter is never used twice in one direction.
///
/// Every sealed frame (Chunk, Finish, Receipt) carries its nonce counter as
/// the header sequence, retransmissions included, so a repeat on the wire is
/// a nonce reuse.
pub struct NonceUniqueness;

impl Invariant for NonceUniqueness {
    fn name(&self) -> &'static str {
        "nonce_uniqueness"
    }

    fn check(&self, trace: &TransferTrace) -> InvariantResult {
        let mut seen: HashSet<(Direction, u64)> = HashSet::new();
        for record in trace.wire.iter().filter(|record| record.opcode.is_sealed()) {
            if !seen.insert((record.direction, record.sequence)) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "{:?} counter {} used twice ({:?})",
                        record.direction, record.sequence, record.opcode
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Ratchet positions never move backwards.
///
/// For each (observer, direction): epoch and step counts never decrease, and
/// within one epoch the chain counter never decreases.
pub struct RatchetMonotonicity;

impl Invariant for RatchetMonotonicity {
    fn name(&self) -> &'static str {
        "ratchet_monotonicity"
    }

    fn check(&self, trace: &TransferTrace) -> InvariantResult {
        let mut last: HashMap<(Role, Direction), &skiff_crypto::RatchetSnapshot> = HashMap::new();

        for observation in &trace.ratchets {
            let current = &observation.snapshot;
            let key = (observation.observer, current.direction);
            if let Some(previous) = last.insert(key, current) {
                let backwards = current.epoch < previous.epoch
                    || current.dh_steps < previous.dh_steps
                    || current.pq_steps < previous.pq_steps
                    || (current.epoch == previous.epoch && current.counter < previous.counter);
                if backwards {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "{:?} view of {:?}: ({}, {}) after ({}, {})",
                            observation.observer,
                            current.direction,
                            current.epoch,
                            current.counter,
                            previous.epoch,
                            previous.counter
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The application only ever receives the sent file, in order.
///
/// Delivered chunk `n` has index `n` and exactly the plaintext sent at `n`.
/// A prefix is fine (a transfer may stop early); a gap, repeat or altered
/// byte is not.
pub struct DeliveredIntegrity;

impl Invariant for DeliveredIntegrity {
    fn name(&self) -> &'static str {
        "delivered_integrity"
    }

    fn check(&self, trace: &TransferTrace) -> InvariantResult {
        for (position, (index, plaintext)) in trace.delivered.iter().enumerate() {
            if *index != position as u64 {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("delivery {position} carried index {index}"),
                });
            }
            if trace.source.get(position) != Some(plaintext) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("chunk {index} differs from what was sent"),
                });
            }
        }
        Ok(())
    }
}

/// States only follow legal transitions, and a terminal state is final.
pub struct TerminalStability;

impl TerminalStability {
    fn check_history(&self, peer: &str, history: &[SessionState]) -> InvariantResult {
        for pair in history.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            if !from.can_transition_to(to) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("{peer}: illegal transition {from:?} -> {to:?}"),
                });
            }
        }
        Ok(())
    }
}

impl Invariant for TerminalStability {
    fn name(&self) -> &'static str {
        "terminal_stability"
    }

    fn check(&self, trace: &TransferTrace) -> InvariantResult {
        self.check_history("sender", &trace.sender_states)?;
        self.check_history("receiver", &trace.receiver_states)
    }
}

#[cfg(test)]
mod tests {
    use skiff_crypto::RatchetSnapshot;
    use skiff_proto::Opcode;

    use super::*;
    use crate::invariants::{RatchetObservation, WireRecord};

    fn record(sequence: u64, opcode: Opcode) -> WireRecord {
        WireRecord {
            direction: Direction::InitiatorToResponder,
            opcode,
            sequence,
            retransmit: false,
            pq_step: false,
        }
    }

    fn snapshot(epoch: u32, counter: u32) -> RatchetObservation {
        RatchetObservation {
            observer: Role::Initiator,
            snapshot: RatchetSnapshot {
                direction: Direction::InitiatorToResponder,
                epoch,
                counter,
                root_fingerprint: [0; 16],
                dh_steps: u64::from(epoch),
                pq_steps: 0,
                last_step: None,
                cached_keys: 0,
            },
        }
    }

    #[test]
    fn repeated_sealed_sequence_is_a_violation() {
        let mut trace = TransferTrace::default();
        trace.wire = vec![record(0, Opcode::Hello), record(0, Opcode::Chunk)];
        assert!(NonceUniqueness.check(&trace).is_ok());

        trace.wire.push(record(0, Opcode::Finish));
        assert!(NonceUniqueness.check(&trace).is_err());
    }

    #[test]
    fn counter_may_reset_only_with_a_new_epoch() {
        let mut trace = TransferTrace::default();
        trace.ratchets = vec![snapshot(0, 5), snapshot(1, 0), snapshot(1, 3)];
        assert!(RatchetMonotonicity.check(&trace).is_ok());

        trace.ratchets.push(snapshot(1, 2));
        assert!(RatchetMonotonicity.check(&trace).is_err());
    }

    #[test]
    fn altered_delivery_is_a_violation() {
        let mut trace = TransferTrace::new(vec![b"a".to_vec(), b"b".to_vec()]);
        trace.delivered = vec![(0, b"a".to_vec())];
        assert!(DeliveredIntegrity.check(&trace).is_ok());

        trace.delivered.push((1, b"x".to_vec()));
        assert!(DeliveredIntegrity.check(&trace).is_err());
    }

    #[test]
    fn leaving_a_terminal_state_is_a_violation() {
        let mut trace = TransferTrace::default();
        trace.receiver_states = vec![
            SessionState::Uninitialized,
            SessionState::Handshaking,
            SessionState::Failed,
        ];
        assert!(TerminalStability.check(&trace).is_ok());

        trace.receiver_states.push(SessionState::Transferring);
        assert!(TerminalStability.check(&trace).is_err());
    }
}
