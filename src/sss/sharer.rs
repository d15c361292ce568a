//! Threshold Secret Sharing
//!
//! Splits arbitrary byte strings into N shares of which any K reconstruct
//! the secret. The secret is cut into 30-byte chunks so that every chunk,
//! read as a big-endian integer, is strictly below the 256-bit field prime.
//! Each chunk gets its own random polynomial of degree K-1 and every share
//! carries one evaluation per chunk.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use super::field::FieldElement;

/// Bytes of secret carried by one field element.
pub const CHUNK_SIZE: usize = 30;

/// Largest share count addressable by a one-byte x-coordinate.
pub const MAX_SHARES: usize = 255;

// =============================================================================
// Share
// =============================================================================

/// One point-set of a split secret.
///
/// All shares produced by a single [`split`] call agree on `threshold`,
/// `total`, `secret_len` and `chunk_count` and have distinct `x`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    /// Evaluation point, 1..=total
    pub x: u8,
    /// Minimum number of shares needed to reconstruct (K)
    pub threshold: u8,
    /// Number of shares issued (N)
    pub total: u8,
    /// Length of the original secret in bytes
    pub secret_len: u64,
    /// Number of 30-byte chunks the secret was cut into
    pub chunk_count: u32,
    /// One field element per chunk
    pub values: Vec<FieldElement>,
}

impl Share {
    /// Canonical byte encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a share from its canonical encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::InvalidShare(format!("malformed encoding: {}", e)))
    }

    /// Hex SHA-256 of the canonical encoding.
    pub fn digest(&self) -> Result<String> {
        Ok(hex::encode(Sha256::digest(self.to_bytes()?)))
    }

    fn same_context(&self, other: &Share) -> bool {
        self.threshold == other.threshold
            && self.total == other.total
            && self.secret_len == other.secret_len
            && self.chunk_count == other.chunk_count
    }
}

// =============================================================================
// Split / Reconstruct
// =============================================================================

fn check_parameters(threshold: usize, total: usize) -> Result<()> {
    if threshold == 0 {
        return Err(Error::InvalidConfig("threshold must be at least 1".into()));
    }
    if threshold > total {
        return Err(Error::InvalidConfig(format!(
            "threshold {} exceeds total shares {}",
            threshold, total
        )));
    }
    if total > MAX_SHARES {
        return Err(Error::InvalidConfig(format!(
            "total shares {} exceeds maximum of {}",
            total, MAX_SHARES
        )));
    }
    Ok(())
}

fn chunk_count_for(secret_len: u64) -> u64 {
    secret_len.div_ceil(CHUNK_SIZE as u64)
}

/// Split `secret` into `total` shares, any `threshold` of which reconstruct it.
#[instrument(skip(secret), fields(secret_len = secret.len()))]
pub fn split(secret: &[u8], threshold: usize, total: usize) -> Result<Vec<Share>> {
    check_parameters(threshold, total)?;

    let chunk_count = u32::try_from(chunk_count_for(secret.len() as u64))
        .map_err(|_| Error::InvalidConfig("secret too large to share".into()))?;

    // Coefficients [chunk, r1 .. r(K-1)] per chunk
    let polynomials: Vec<Vec<FieldElement>> = secret
        .chunks(CHUNK_SIZE)
        .map(|chunk| {
            let mut coeffs = Vec::with_capacity(threshold);
            coeffs.push(FieldElement::from_bytes_be(chunk));
            coeffs.extend((1..threshold).map(|_| FieldElement::random()));
            coeffs
        })
        .collect();

    let shares = (1..=total)
        .map(|x| {
            let point = FieldElement::from_u64(x as u64);
            Share {
                x: x as u8,
                threshold: threshold as u8,
                total: total as u8,
                secret_len: secret.len() as u64,
                chunk_count,
                values: polynomials
                    .iter()
                    .map(|coeffs| FieldElement::evaluate_polynomial(coeffs, &point))
                    .collect(),
            }
        })
        .collect();

    debug!(threshold, total, chunk_count, "Split secret into shares");
    Ok(shares)
}

/// Check a single share for internal consistency against an expected
/// `(threshold, total)` context.
pub fn validate_share(share: &Share, threshold: usize, total: usize) -> Result<()> {
    check_parameters(threshold, total)?;

    if share.threshold as usize != threshold || share.total as usize != total {
        return Err(Error::InvalidShare(format!(
            "share {} has parameters ({}, {}), expected ({}, {})",
            share.x, share.threshold, share.total, threshold, total
        )));
    }
    if share.x == 0 || share.x as usize > total {
        return Err(Error::InvalidShare(format!(
            "x-coordinate {} outside 1..={}",
            share.x, total
        )));
    }
    if share.chunk_count as u64 != chunk_count_for(share.secret_len) {
        return Err(Error::InvalidShare(format!(
            "share {} declares {} chunks for a {}-byte secret",
            share.x, share.chunk_count, share.secret_len
        )));
    }
    if share.values.len() != share.chunk_count as usize {
        return Err(Error::InvalidShare(format!(
            "share {} carries {} values, expected {}",
            share.x,
            share.values.len(),
            share.chunk_count
        )));
    }
    Ok(())
}

/// Validate a set of shares against each other and return them keyed by x.
///
/// Fails with `InsufficientShares` before any validation when fewer than the
/// first share's threshold are distinct.
fn collect_consistent(shares: &[Share]) -> Result<BTreeMap<u8, &Share>> {
    let reference = shares.first().ok_or(Error::InsufficientShares {
        available: 0,
        required: 1,
    })?;
    let threshold = reference.threshold as usize;

    let mut distinct = shares.iter().map(|s| s.x).collect::<Vec<_>>();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() < threshold {
        return Err(Error::InsufficientShares {
            available: distinct.len(),
            required: threshold,
        });
    }

    let mut by_x = BTreeMap::new();
    for share in shares {
        if !share.same_context(reference) {
            return Err(Error::InvalidShare(format!(
                "share {} belongs to a different sharing",
                share.x
            )));
        }
        validate_share(share, threshold, reference.total as usize)?;

        if let Some(existing) = by_x.insert(share.x, share) {
            if existing.values != share.values {
                return Err(Error::InvalidShare(format!(
                    "conflicting shares for x = {}",
                    share.x
                )));
            }
        }
    }

    Ok(by_x)
}

fn node_xs(shares: &[&Share]) -> Vec<FieldElement> {
    shares.iter().map(|s| FieldElement::from_u64(s.x as u64)).collect()
}

/// Reconstruct the secret from at least `threshold` shares.
#[instrument(skip(shares), fields(share_count = shares.len()))]
pub fn reconstruct(shares: &[Share]) -> Result<Vec<u8>> {
    let by_x = collect_consistent(shares)?;
    let reference = shares[0].clone();
    let threshold = reference.threshold as usize;
    let selected: Vec<&Share> = by_x.values().take(threshold).copied().collect();

    let secret_len = usize::try_from(reference.secret_len)
        .map_err(|_| Error::InvalidShare("secret length exceeds address space".into()))?;
    let mut secret = Vec::with_capacity(secret_len);
    let weights = FieldElement::lagrange_coefficients(&node_xs(&selected), &FieldElement::zero());

    for chunk in 0..reference.chunk_count as usize {
        let value = FieldElement::weighted_sum(&weights, selected.iter().map(|s| &s.values[chunk]));

        let width = std::cmp::min(CHUNK_SIZE, secret_len - chunk * CHUNK_SIZE);
        let bytes = value.to_bytes_padded(width).ok_or_else(|| {
            Error::InvalidShare(format!(
                "chunk {} does not fit in {} bytes; shares are inconsistent",
                chunk, width
            ))
        })?;
        secret.extend_from_slice(&bytes);
    }

    secret.truncate(secret_len);
    debug!(threshold, secret_len, "Reconstructed secret");
    Ok(secret)
}

/// Regenerate the share at `x` from at least `threshold` consistent shares.
///
/// The result lies on the same polynomials as the originals and is therefore
/// identical to the share first issued at `x`.
#[instrument(skip(shares), fields(share_count = shares.len()))]
pub fn interpolate_share(shares: &[Share], x: u8) -> Result<Share> {
    let by_x = collect_consistent(shares)?;
    let reference = &shares[0];

    if x == 0 || x > reference.total {
        return Err(Error::InvalidConfig(format!(
            "cannot regenerate share at x = {} outside 1..={}",
            x, reference.total
        )));
    }
    if let Some(existing) = by_x.get(&x) {
        return Ok((*existing).clone());
    }

    let selected: Vec<&Share> = by_x
        .values()
        .take(reference.threshold as usize)
        .copied()
        .collect();
    let weights = FieldElement::lagrange_coefficients(&node_xs(&selected), &FieldElement::from_u64(x as u64));

    let values = (0..reference.chunk_count as usize)
        .map(|chunk| FieldElement::weighted_sum(&weights, selected.iter().map(|s| &s.values[chunk])))
        .collect();

    Ok(Share {
        x,
        threshold: reference.threshold,
        total: reference.total,
        secret_len: reference.secret_len,
        chunk_count: reference.chunk_count,
        values,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_split_basic() {
        let shares = split(b"correct horse battery staple", 3, 5).unwrap();
        assert_eq!(shares.len(), 5);
        for (i, share) in shares.iter().enumerate() {
            assert_eq!(share.x as usize, i + 1);
            assert_eq!(share.threshold, 3);
            assert_eq!(share.total, 5);
            assert_eq!(share.chunk_count, 1);
        }
    }

    #[test]
    fn test_split_invalid_parameters() {
        assert_matches!(split(b"x", 0, 3), Err(Error::InvalidConfig(_)));
        assert_matches!(split(b"x", 4, 3), Err(Error::InvalidConfig(_)));
        assert_matches!(split(b"x", 2, 256), Err(Error::InvalidConfig(_)));
    }

    #[test]
    fn test_roundtrip_chunk_boundaries() {
        for len in [0usize, 1, 29, 30, 31, 60, 61, 1000] {
            let secret: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let shares = split(&secret, 3, 5).unwrap();
            assert_eq!(shares[0].chunk_count as usize, len.div_ceil(CHUNK_SIZE));
            assert_eq!(reconstruct(&shares[2..]).unwrap(), secret, "len = {}", len);
        }
    }

    #[test]
    fn test_leading_zero_bytes_preserved() {
        let secret = [0u8, 0, 0, 1, 0, 0];
        let shares = split(&secret, 2, 3).unwrap();
        assert_eq!(reconstruct(&shares[..2]).unwrap(), secret);
    }

    #[test]
    fn test_threshold_of_one_replicates() {
        let shares = split(b"solo", 1, 3).unwrap();
        for share in &shares {
            assert_eq!(reconstruct(std::slice::from_ref(share)).unwrap(), b"solo");
        }
    }

    #[test]
    fn test_insufficient_shares() {
        let shares = split(b"threshold", 3, 5).unwrap();
        assert_matches!(
            reconstruct(&shares[..2]),
            Err(Error::InsufficientShares {
                available: 2,
                required: 3
            })
        );
        assert_matches!(reconstruct(&[]), Err(Error::InsufficientShares { .. }));
    }

    #[test]
    fn test_duplicate_shares_do_not_count_twice() {
        let shares = split(b"dup", 3, 5).unwrap();
        let dupes = vec![shares[0].clone(), shares[0].clone(), shares[1].clone()];
        assert_matches!(reconstruct(&dupes), Err(Error::InsufficientShares { available: 2, .. }));
    }

    #[test]
    fn test_conflicting_duplicate_rejected() {
        let shares = split(b"conflict", 2, 3).unwrap();
        let mut forged = shares[0].clone();
        forged.values[0] = FieldElement::from_u64(42);
        let set = vec![shares[0].clone(), forged, shares[1].clone()];
        assert_matches!(reconstruct(&set), Err(Error::InvalidShare(_)));
    }

    #[test]
    fn test_mixed_sharings_rejected() {
        let a = split(b"first secret", 2, 3).unwrap();
        let b = split(b"second secret, longer than thirty bytes", 2, 3).unwrap();
        assert_matches!(reconstruct(&[a[0].clone(), b[1].clone()]), Err(Error::InvalidShare(_)));
    }

    #[test]
    fn test_validate_share() {
        let shares = split(b"validate", 2, 4).unwrap();
        assert!(validate_share(&shares[3], 2, 4).is_ok());
        assert_matches!(validate_share(&shares[3], 3, 4), Err(Error::InvalidShare(_)));

        let mut bad = shares[0].clone();
        bad.x = 0;
        assert_matches!(validate_share(&bad, 2, 4), Err(Error::InvalidShare(_)));

        let mut truncated = shares[1].clone();
        truncated.values.clear();
        assert_matches!(validate_share(&truncated, 2, 4), Err(Error::InvalidShare(_)));
    }

    #[test]
    fn test_interpolate_share_is_byte_identical() {
        let secret = vec![0xAB; 95];
        let shares = split(&secret, 3, 6).unwrap();

        let survivors = vec![shares[0].clone(), shares[2].clone(), shares[5].clone()];
        for missing in [2u8, 4, 5] {
            let regenerated = interpolate_share(&survivors, missing).unwrap();
            assert_eq!(regenerated, shares[missing as usize - 1]);
            assert_eq!(
                regenerated.to_bytes().unwrap(),
                shares[missing as usize - 1].to_bytes().unwrap()
            );
        }

        assert_matches!(interpolate_share(&survivors, 7), Err(Error::InvalidConfig(_)));
    }

    #[test]
    fn test_large_secret_reconstructs_from_any_subset() {
        let secret: Vec<u8> = (0..64 * 1024).map(|i| (i * 31 % 251) as u8).collect();
        let shares = split(&secret, 5, 8).unwrap();
        assert_eq!(shares[0].chunk_count as usize, secret.len().div_ceil(CHUNK_SIZE));

        let subset: Vec<Share> = [7usize, 1, 4, 2, 6].iter().map(|&i| shares[i].clone()).collect();
        assert_eq!(reconstruct(&subset).unwrap(), secret);
        assert_eq!(interpolate_share(&subset, 1).unwrap(), shares[0]);
    }

    #[test]
    fn test_share_encoding() {
        let shares = split(b"encode me", 2, 3).unwrap();
        let bytes = shares[1].to_bytes().unwrap();
        assert_eq!(Share::from_bytes(&bytes).unwrap(), shares[1]);
        assert_eq!(shares[1].digest().unwrap().len(), 64);

        assert_matches!(Share::from_bytes(&bytes[..bytes.len() - 1]), Err(Error::InvalidShare(_)));
    }
}
