//! End-to-end transfer scenarios.
//!
//! Each test runs a complete seeded transfer through the driver with the
//! standard invariants checked after every step.

use skiff_core::{ChunkFault, FailureLayer, ManifestStatus, Role, SessionError, SessionState};
use skiff_crypto::{CryptoError, Direction, StepKind};
use skiff_harness::Scenario;
use skiff_proto::Opcode;

#[test]
fn sequential_transfer_is_byte_identical() {
    let scenario = Scenario::sequential();
    let file = scenario.file(11);

    let (driver, report) = scenario.run(11).expect("run");

    assert!(report.completed());
    assert!(report.rejections.is_empty());
    assert_eq!(report.delivered_chunks, 1000);
    assert_eq!(driver.trace().delivered_bytes(), file.concat());
    assert_eq!(
        report.status,
        ManifestStatus::Completed { chunk_count: 1000, total_bytes: 1000 * 16 * 1024 }
    );
    assert!(driver.receiver().verify_manifest_complete());
}

#[test]
fn swapped_chunks_decrypt_through_skipped_keys() {
    let scenario = Scenario::swapped();
    let file = scenario.file(12);

    let (driver, report) = scenario.run(12).expect("run");

    assert!(report.completed());
    assert_eq!(report.forward.reordered, 1);
    assert!(report.rejections.is_empty(), "no retransmission needed: {:?}", report.rejections);
    assert_eq!(driver.trace().delivered_bytes(), file.concat());

    // Chunk 51 arrived first, so the key for 50 was held in the skipped cache.
    let cached = driver.trace().ratchets.iter().any(|observation| {
        observation.observer == Role::Responder
            && observation.snapshot.direction == Direction::InitiatorToResponder
            && observation.snapshot.cached_keys > 0
    });
    assert!(cached);
}

#[test]
fn tampered_chunk_is_rejected_and_manifest_stays_open() {
    let scenario = Scenario::tampered();
    let file = scenario.file(13);

    let (driver, report) = scenario.run(13).expect("run");

    assert_eq!(report.forward.tampered, 1);
    assert_eq!(report.rejections.len(), 1);
    assert!(matches!(report.rejections[0], SessionError::Crypto(CryptoError::Auth(_))));

    // Everything before 700 is delivered, nothing after it.
    assert_eq!(report.delivered_chunks, 700);
    assert_eq!(driver.trace().delivered_bytes(), file[..700].concat());

    // The session stays alive but the manifest never completes.
    assert_eq!(report.receiver_state, SessionState::Transferring);
    assert_eq!(report.sender_state, SessionState::Transferring);
    assert!(!driver.receiver().verify_manifest_complete());
    assert_eq!(
        report.status,
        ManifestStatus::InProgress {
            verified_chunks: 700,
            expected_chunks: Some(1000),
            rejected: Some(ChunkFault { index: Some(700), layer: FailureLayer::Aead }),
        }
    );
}

#[test]
fn tampered_chunk_recovers_when_resent() {
    let mut scenario = Scenario::tampered();
    scenario.driver.max_resend_rounds = 2;

    let (_, report) = scenario.run(14).expect("run");

    assert!(report.completed());
    assert_eq!(report.resend_rounds, 1);
}

#[test]
fn post_quantum_step_after_interval() {
    const INTERVAL: u32 = 8;
    let scenario = Scenario::post_quantum(INTERVAL);
    let file = scenario.file(15);
    let mut driver = scenario.driver(15).expect("driver");
    driver.handshake().expect("handshake");

    let forward = Direction::InitiatorToResponder;
    for chunk in file.chunks(1).take(INTERVAL as usize) {
        driver.send(chunk).expect("send");
    }
    let before = driver.sender().ratchet_snapshot(forward).expect("keys");
    assert_eq!(before.pq_steps, 0);
    assert_eq!(before.epoch, 0);
    assert_eq!(
        driver.receiver().ratchet_snapshot(forward).expect("keys").root_fingerprint,
        before.root_fingerprint
    );

    // Message N+1 opens a new epoch with a post-quantum step.
    driver.send(&file[INTERVAL as usize..=INTERVAL as usize]).expect("send");
    let sender = driver.sender().ratchet_snapshot(forward).expect("keys");
    let receiver = driver.receiver().ratchet_snapshot(forward).expect("keys");

    assert_eq!(sender.epoch, 1);
    assert_eq!(sender.pq_steps, 1);
    assert_eq!(sender.dh_steps, 0);
    assert_eq!(sender.last_step, Some(StepKind::PostQuantum));
    assert_ne!(sender.root_fingerprint, before.root_fingerprint);

    // The receiver mirrored the same step.
    assert_eq!(receiver.pq_steps, 1);
    assert_eq!(receiver.last_step, Some(StepKind::PostQuantum));
    assert_eq!(receiver.root_fingerprint, sender.root_fingerprint);

    // Only that chunk's frame announces the post-quantum step.
    let chunks: Vec<_> = driver
        .trace()
        .wire
        .iter()
        .filter(|record| record.direction == forward && record.opcode == Opcode::Chunk)
        .collect();
    assert_eq!(chunks.len(), INTERVAL as usize + 1);
    assert!(chunks[..INTERVAL as usize].iter().all(|record| !record.pq_step));
    assert!(chunks[INTERVAL as usize].pq_step);

    for chunk in file[INTERVAL as usize + 1..].chunks(1) {
        driver.send(chunk).expect("send");
    }
    let report = driver.finish().expect("finish");
    assert!(report.completed());
    assert_eq!(driver.trace().delivered_bytes(), file.concat());

    let steps = driver
        .trace()
        .ratchets
        .iter()
        .filter(|observation| observation.observer == Role::Initiator)
        .filter(|observation| observation.snapshot.direction == forward)
        .map(|observation| observation.snapshot.pq_steps)
        .max();
    assert_eq!(steps, Some(3));
}

#[test]
fn responder_sends_swapped_file() {
    let mut scenario = Scenario::swapped();
    scenario.driver.sender_role = Role::Responder;

    let (driver, report) = scenario.run(16).expect("run");

    assert!(report.completed());
    assert_eq!(driver.trace().delivered_bytes(), scenario.file(16).concat());
}
