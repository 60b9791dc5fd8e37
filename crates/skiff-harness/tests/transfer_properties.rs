//! Property-based transfer tests under a chaotic link.
//!
//! Seeds, file shapes and fault rates are generated; the standard invariants
//! run after every driver step, so any nonce reuse, ratchet regression,
//! corrupt delivery or illegal transition fails the case.

use proptest::prelude::*;
use skiff_core::{ManifestStatus, SessionConfig, SessionState};
use skiff_harness::{
    ChaoticLink, DriverConfig, DriverError, Fault, InvariantRegistry, LinkConfig, Scenario,
    SimEnv, TransferDriver,
};

fn link_strategy() -> impl Strategy<Value = LinkConfig> {
    (0.0..0.1f64, 0.0..0.3f64, 0.0..0.05f64).prop_map(|(drop_rate, reorder_rate, tamper_rate)| {
        LinkConfig { drop_rate, reorder_rate, tamper_rate }
    })
}

#[test]
fn prop_chaotic_link_still_delivers_the_file() {
    proptest!(ProptestConfig::with_cases(24), |(seed in any::<u64>(), link in link_strategy())| {
        let mut scenario = Scenario::chaos(link);
        scenario.chunks = 64;
        let file = scenario.file(seed);

        let (driver, report) = scenario.run(seed).unwrap();

        // PROPERTY: retransmission recovers every loss and corruption
        prop_assert!(report.completed(), "report: {:?}", report);
        prop_assert_eq!(driver.trace().delivered_bytes(), file.concat());
    });
}

#[test]
fn prop_delivery_is_a_verified_prefix_without_retransmission() {
    proptest!(ProptestConfig::with_cases(24), |(seed in any::<u64>(), link in link_strategy())| {
        let mut scenario = Scenario::chaos(link);
        scenario.chunks = 48;
        scenario.driver.max_resend_rounds = 0;
        let file = scenario.file(seed);

        let (driver, report) = scenario.run(seed).unwrap();
        let delivered = driver.trace().delivered_bytes();

        // PROPERTY: whatever arrives is exactly the start of the file
        prop_assert_eq!(&delivered[..], &file.concat()[..delivered.len()]);

        // PROPERTY: completion implies every chunk was delivered
        if report.receiver_state == SessionState::Completed {
            prop_assert_eq!(report.delivered_chunks, file.len());
        } else {
            let complete = matches!(report.status, ManifestStatus::Completed { .. });
            prop_assert!(!complete);
        }
    });
}

#[test]
fn prop_dropped_chunks_are_resent_once() {
    proptest!(ProptestConfig::with_cases(16), |(
        seed in any::<u64>(),
        dropped in prop::collection::btree_set(0u64..40, 1..6),
    )| {
        let link = ChaoticLink::reliable().with_faults(dropped.iter().map(|&index| Fault::Drop { index }));
        let mut driver = TransferDriver::new(
            &SessionConfig { dh_interval: 7, pq_interval: 13, ..SessionConfig::default() },
            DriverConfig { batch_size: 8, ..DriverConfig::default() },
            &SimEnv::with_seed(seed),
            link,
        )
        .unwrap()
        .with_invariants(InvariantRegistry::standard());
        let file: Vec<Vec<u8>> = (0..40u8).map(|i| vec![i; 100]).collect();

        let report = driver.run(&file).unwrap();

        // PROPERTY: scripted losses cost exactly one retransmission round
        prop_assert!(report.completed());
        prop_assert_eq!(report.resend_rounds, 1);
        prop_assert_eq!(report.forward.dropped, dropped.len() as u64);
    });
}

#[test]
fn invariant_violation_stops_the_run() {
    use skiff_harness::{Invariant, InvariantResult, TransferTrace, Violation};

    struct NoDelivery;

    impl Invariant for NoDelivery {
        fn name(&self) -> &'static str {
            "no_delivery"
        }

        fn check(&self, trace: &TransferTrace) -> InvariantResult {
            if trace.delivered.is_empty() {
                Ok(())
            } else {
                Err(Violation { invariant: self.name(), message: "chunk delivered".to_string() })
            }
        }
    }

    let mut registry = InvariantRegistry::new();
    registry.add(NoDelivery);
    let mut driver = TransferDriver::new(
        &SessionConfig::default(),
        DriverConfig::default(),
        &SimEnv::with_seed(5),
        ChaoticLink::reliable(),
    )
    .unwrap()
    .with_invariants(registry);

    let err = driver.run(&[b"one".to_vec()]).unwrap_err();
    assert!(matches!(err, DriverError::Invariant(ref violations) if violations[0].invariant == "no_delivery"));
}
