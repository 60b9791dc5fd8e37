//! Fuzz target for the integrity chain verifier
//!
//! Chunks of a real manifest are offered to the verifier in a fuzzed order,
//! mixed with duplicates, forged links and out-of-range indices.
//!
//! # Invariants
//!
//! - The verifier NEVER panics
//! - Verified chunks come out in index order with the original contents
//! - A forged link is never accepted
//! - The manifest is complete only once every chunk was released, and a
//!   fully released manifest is complete unless a later fault failed it

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use skiff_crypto::{Direction, IntegrityVerifier, TransferManifest, VerifiedChunk};

const SESSION_ID: [u8; 16] = [7; 16];

#[derive(Debug, Clone, Arbitrary)]
struct Input {
    chunks: Vec<Vec<u8>>,
    steps: Vec<Step>,
    max_pending: u8,
}

#[derive(Debug, Clone, Arbitrary)]
enum Step {
    Genuine(u8),
    ForgedLink { index: u8, link: [u8; 32] },
    OutOfRange(u64),
}

fuzz_target!(|input: Input| {
    let chunks: Vec<Vec<u8>> = input.chunks.into_iter().take(32).collect();
    if chunks.is_empty() {
        return;
    }

    let direction = Direction::InitiatorToResponder;
    let mut manifest = TransferManifest::new(&SESSION_ID, direction);
    let entries: Vec<_> = chunks.iter().map(|chunk| manifest.append(chunk)).collect();
    let summary = manifest.summary();

    let mut verifier =
        IntegrityVerifier::new(&SESSION_ID, direction, usize::from(input.max_pending).max(1));
    verifier.finish(summary).expect("genuine summary before any chunk");

    let mut released = 0u64;
    let mut check = |verified: Vec<VerifiedChunk>| {
        for chunk in verified {
            assert_eq!(chunk.index, released);
            assert_eq!(chunk.plaintext, chunks[chunk.index as usize]);
            released += 1;
        }
    };

    for step in input.steps.into_iter().take(256) {
        match step {
            Step::Genuine(pick) => {
                let index = usize::from(pick) % chunks.len();
                let entry = &entries[index];
                if let Ok(verified) = verifier.accept(entry.index, &entry.prev_link, chunks[index].clone()) {
                    check(verified);
                }
            },
            Step::ForgedLink { index, link } => {
                let index = usize::from(index) % chunks.len();
                if link == entries[index].prev_link {
                    continue;
                }
                if let Ok(verified) = verifier.accept(index as u64, &link, chunks[index].clone()) {
                    // A forged link can sit in the reorder buffer, but never
                    // be released.
                    assert!(verified.is_empty());
                }
            },
            Step::OutOfRange(offset) => {
                let index = (chunks.len() as u64).saturating_add(offset);
                assert!(verifier.accept(index, &[0; 32], Vec::new()).is_err());
            },
        }
    }

    if verifier.verify_manifest_complete() {
        assert_eq!(released, chunks.len() as u64);
    } else if released == chunks.len() as u64 {
        assert!(verifier.is_failed());
    }
});
