//! Property-Based Tests for Secret Sharing
//!
//! # Test Properties
//!
//! 1. **Roundtrip Correctness**: reconstruct(split(s)) = s
//! 2. **Subset Independence**: any K distinct shares reconstruct the secret
//! 3. **Threshold Enforcement**: K-1 shares never reconstruct
//! 4. **Regeneration**: a share rebuilt from survivors equals the original

#![cfg(test)]

use proptest::prelude::*;

use super::sharer::{interpolate_share, reconstruct, split, CHUNK_SIZE};
use crate::error::Error;

// =============================================================================
// Property Strategies
// =============================================================================

/// Strategy for (K, N) with 1 <= K <= N <= 7.
fn threshold_strategy() -> impl Strategy<Value = (usize, usize)> {
    (1usize..=5, 0usize..=2).prop_map(|(k, extra)| (k, k + extra))
}

/// Secrets spanning zero, one and several chunks.
fn secret_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..(CHUNK_SIZE * 5))
}

/// A random K-subset of share indices, drawn by shuffling 0..N.
fn subset_strategy() -> impl Strategy<Value = ((usize, usize), Vec<usize>)> {
    threshold_strategy().prop_flat_map(|(k, n)| {
        let order = Just((0..n).collect::<Vec<_>>()).prop_shuffle();
        (Just((k, n)), order.prop_map(move |v| v.into_iter().take(k).collect()))
    })
}

// =============================================================================
// Roundtrip Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: all N shares reconstruct the secret.
    #[test]
    fn prop_roundtrip_all_shares(
        (k, n) in threshold_strategy(),
        secret in secret_strategy(),
    ) {
        let shares = split(&secret, k, n)?;
        prop_assert_eq!(shares.len(), n);
        prop_assert_eq!(reconstruct(&shares)?, secret);
    }

    /// Property: any K-subset reconstructs, regardless of order.
    #[test]
    fn prop_any_subset_reconstructs(
        ((k, n), picks) in subset_strategy(),
        secret in secret_strategy(),
    ) {
        let shares = split(&secret, k, n)?;
        let subset: Vec<_> = picks.iter().map(|&i| shares[i].clone()).collect();

        let recovered = reconstruct(&subset)?;
        prop_assert_eq!(recovered, secret, "k={}, n={}, picks={:?}", k, n, picks);
    }
}

// =============================================================================
// Threshold Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: K-1 shares fail with InsufficientShares.
    #[test]
    fn prop_below_threshold_fails(
        k in 2usize..=5,
        secret in prop::collection::vec(any::<u8>(), 1..100),
    ) {
        let shares = split(&secret, k, k + 1)?;
        let result = reconstruct(&shares[..k - 1]);
        let is_insufficient = matches!(result, Err(Error::InsufficientShares { .. }));
        prop_assert!(is_insufficient);
    }

    /// Property: a missing share regenerated from any K survivors is identical.
    #[test]
    fn prop_regenerated_share_matches(
        ((k, n), picks) in subset_strategy(),
        secret in secret_strategy(),
    ) {
        let shares = split(&secret, k, n)?;
        let survivors: Vec<_> = picks.iter().map(|&i| shares[i].clone()).collect();

        for original in &shares {
            let rebuilt = interpolate_share(&survivors, original.x)?;
            prop_assert_eq!(&rebuilt, original);
        }
    }
}
