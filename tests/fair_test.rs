//! Provably-fair derivation tests
//!
//! Run with: cargo test --test fair_test

use apogee::fair::{
    crash_from_draw, derive_crash_point, draw, sha256, verify_round, FairnessOracle,
};
use apogee::types::Multiplier;
use proptest::prelude::*;

// =============================================================================
// COMMITMENT
// =============================================================================

#[test]
fn test_oracle_commits_to_seed_hash() {
    let mut oracle = FairnessOracle::new(100, "client");
    let fair = oracle.next_round().unwrap();

    assert_eq!(sha256(&fair.server_seed), fair.server_seed_hash);
    assert_eq!(fair.client_seed, "client");
    assert!(fair.crash_point >= Multiplier::ONE);
}

#[test]
fn test_oracle_nonce_increments_per_round() {
    let mut oracle = FairnessOracle::new(100, "client").with_nonce(41);
    let first = oracle.next_round().unwrap();
    let second = oracle.next_round().unwrap();

    assert_eq!(first.nonce, 41);
    assert_eq!(second.nonce, 42);
    assert_ne!(first.server_seed, second.server_seed);
}

// =============================================================================
// DERIVATION
// =============================================================================

#[test]
fn test_derivation_is_deterministic() {
    let seed = [7u8; 32];
    let a = derive_crash_point(&seed, "client", 3, 100);
    let b = derive_crash_point(&seed, "client", 3, 100);
    assert_eq!(a, b);

    // Any input change moves the draw.
    assert_ne!(draw(&seed, "client", 3), draw(&seed, "client", 4));
    assert_ne!(draw(&seed, "client", 3), draw(&seed, "other", 3));
}

#[test]
fn test_crash_floor_is_one() {
    // Smallest draw gives the floor.
    assert_eq!(crash_from_draw(0, 100), Multiplier::from_hundredths(100));
}

#[test]
fn test_crash_from_known_draws() {
    // With 1% edge: crash_hundredths = floor(9900 * 2^52 / ((2^52 - x) * 100)).
    let e: u128 = 1 << 52;

    // Half the range: 0.99 / 0.5 = 1.98x.
    let x = (e / 2) as u64;
    assert_eq!(crash_from_draw(x, 100), Multiplier::from_hundredths(198));

    // 90% of the range: 0.99 / 0.1 = 9.90x.
    let x = (e - e / 10) as u64;
    assert_eq!(crash_from_draw(x, 100), Multiplier::from_hundredths(990));

    // Zero edge, half range: exactly 2.00x.
    let x = (e / 2) as u64;
    assert_eq!(crash_from_draw(x, 0), Multiplier::from_hundredths(200));
}

#[test]
fn test_verifier_reproduces_crash_point() {
    let mut oracle = FairnessOracle::new(100, "client");
    for _ in 0..50 {
        let fair = oracle.next_round().unwrap();
        assert!(verify_round(
            &fair.server_seed,
            &fair.server_seed_hash,
            &fair.client_seed,
            fair.nonce,
            fair.crash_point,
            100,
        ));
    }
}

#[test]
fn test_verifier_rejects_tampered_outcome() {
    let mut oracle = FairnessOracle::new(100, "client");
    let fair = oracle.next_round().unwrap();

    let inflated = Multiplier::from_hundredths(fair.crash_point.hundredths() + 100);
    assert!(!verify_round(
        &fair.server_seed,
        &fair.server_seed_hash,
        &fair.client_seed,
        fair.nonce,
        inflated,
        100,
    ));

    let mut wrong_seed = fair.server_seed;
    wrong_seed[0] ^= 1;
    assert!(!verify_round(
        &wrong_seed,
        &fair.server_seed_hash,
        &fair.client_seed,
        fair.nonce,
        fair.crash_point,
        100,
    ));
}

// =============================================================================
// PROPERTIES
// =============================================================================

proptest! {
    #[test]
    fn prop_crash_never_below_one(x in 0u64..(1 << 52), edge in 0u16..10_000) {
        prop_assert!(crash_from_draw(x, edge) >= Multiplier::ONE);
    }

    #[test]
    fn prop_crash_monotone_in_draw(x in 0u64..((1 << 52) - 1)) {
        prop_assert!(crash_from_draw(x, 100) <= crash_from_draw(x + 1, 100));
    }

    #[test]
    fn prop_house_edge_lowers_crash(x in 0u64..(1 << 52)) {
        prop_assert!(crash_from_draw(x, 100) <= crash_from_draw(x, 0));
    }

    #[test]
    fn prop_derive_verify_round_trip(seed in any::<[u8; 32]>(), nonce in any::<u64>()) {
        let crash = derive_crash_point(&seed, "client", nonce, 100);
        prop_assert!(verify_round(&seed, &sha256(&seed), "client", nonce, crash, 100));
    }
}
