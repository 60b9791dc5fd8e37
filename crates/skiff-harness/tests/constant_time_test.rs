//! Timing-variance checks for secret comparisons.
//!
//! A matching input and an input that differs in its first byte must take
//! the same time to compare; an early-exit comparison would be far faster on
//! the mismatch. Batches of each are interleaved and their medians compared
//! with a generous bound, so scheduler noise does not fail the test while a
//! short-circuit still would.

#![allow(clippy::disallowed_methods)]

use std::{hint::black_box, time::Instant};

use skiff_crypto::{
    ManifestSummary,
    ct::{ct_eq, ct_eq_32},
};

const ROUNDS: usize = 101;
const BATCH: usize = 2_000;
const MAX_RATIO: f64 = 1.5;

fn median(mut samples: Vec<u128>) -> f64 {
    samples.sort_unstable();
    samples[samples.len() / 2] as f64
}

/// Medians of `equal` and `unequal` over interleaved batches.
fn measure(mut equal: impl FnMut() -> bool, mut unequal: impl FnMut() -> bool) -> (f64, f64) {
    let mut equal_times = Vec::with_capacity(ROUNDS);
    let mut unequal_times = Vec::with_capacity(ROUNDS);

    for round in 0..ROUNDS {
        let time = |f: &mut dyn FnMut() -> bool| {
            let start = Instant::now();
            for _ in 0..BATCH {
                black_box(f());
            }
            start.elapsed().as_nanos()
        };
        // Alternate which runs first so warm-up effects cancel.
        if round % 2 == 0 {
            equal_times.push(time(&mut equal));
            unequal_times.push(time(&mut unequal));
        } else {
            unequal_times.push(time(&mut unequal));
            equal_times.push(time(&mut equal));
        }
    }
    (median(equal_times), median(unequal_times))
}

fn assert_indistinguishable(name: &str, (equal, unequal): (f64, f64)) {
    let ratio = equal.max(unequal) / equal.min(unequal).max(1.0);
    assert!(
        ratio < MAX_RATIO,
        "{name}: equal median {equal}ns, unequal median {unequal}ns, ratio {ratio:.2}"
    );
}

#[test]
fn tag_comparison_time_does_not_depend_on_match() {
    let tag = [0x5Au8; 16];
    let same = tag;
    let mut first_differs = tag;
    first_differs[0] ^= 1;

    let timing = measure(
        || ct_eq(black_box(&tag), black_box(&same)),
        || ct_eq(black_box(&tag), black_box(&first_differs)),
    );
    assert_indistinguishable("tag", timing);
}

#[test]
fn link_comparison_time_does_not_depend_on_match() {
    let link = [0xC3u8; 32];
    let same = link;
    let mut first_differs = link;
    first_differs[0] ^= 0x80;

    let timing = measure(
        || ct_eq_32(black_box(&link), black_box(&same)),
        || ct_eq_32(black_box(&link), black_box(&first_differs)),
    );
    assert_indistinguishable("link", timing);
}

#[test]
fn manifest_digest_comparison_time_does_not_depend_on_match() {
    let summary = ManifestSummary {
        chunk_count: 1000,
        total_bytes: 16 * 1024 * 1000,
        chain_digest: [7; 32],
        file_digest: [9; 32],
    };
    let same = summary;
    let different = ManifestSummary { chunk_count: 999, ..summary };

    let timing = measure(
        || black_box(&summary).ct_matches(black_box(&same)),
        || black_box(&summary).ct_matches(black_box(&different)),
    );
    assert_indistinguishable("manifest", timing);
}
