//! Reed-Solomon erasure coding
//!
//! Systematic k+m coding with the `reed-solomon-erasure` crate: the first k
//! shards are the ciphertext split into equal slices, the remaining m are
//! parity. Any k shards reconstruct the rest.

use crate::error::{Error, Result};
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Reed-Solomon codec for one (k, m) configuration.
#[derive(Clone)]
pub struct ErasureCoder {
    rs: Arc<ReedSolomon>,
    data_shards: usize,
    parity_shards: usize,
}

impl std::fmt::Debug for ErasureCoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasureCoder")
            .field("data_shards", &self.data_shards)
            .field("parity_shards", &self.parity_shards)
            .finish()
    }
}

impl ErasureCoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        match (data_shards, parity_shards) {
            (0, _) => Err(Error::InvalidConfig("erasure threshold must be at least 1".into())),
            (_, 0) => Err(Error::InvalidConfig(
                "erasure mode needs more shards than its threshold".into(),
            )),
            _ => {
                let rs = ReedSolomon::new(data_shards, parity_shards).map_err(|e| {
                    Error::InvalidConfig(format!("{}+{} is not a valid Reed-Solomon layout: {}", data_shards, parity_shards, e))
                })?;
                Ok(Self {
                    rs: Arc::new(rs),
                    data_shards,
                    parity_shards,
                })
            }
        }
    }

    /// Coder for a K-of-N file.
    pub fn for_threshold(threshold: usize, total: usize) -> Result<Self> {
        Self::new(threshold, total.saturating_sub(threshold))
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Size of every shard for `data_len` bytes of input. Never zero, so
    /// empty input still yields well-formed shards.
    pub fn shard_size(&self, data_len: usize) -> usize {
        std::cmp::max(1, data_len.div_ceil(self.data_shards))
    }

    /// Slice `data` into k zero-padded data shards and compute m parity
    /// shards. Shard i of the result carries file index i + 1.
    #[instrument(skip(self, data), fields(data_len = data.len()))]
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let shard_size = self.shard_size(data.len());
        let mut shards: Vec<Vec<u8>> = data
            .chunks(shard_size)
            .map(|slice| {
                let mut shard = slice.to_vec();
                shard.resize(shard_size, 0);
                shard
            })
            .collect();
        // Short inputs leave trailing data shards entirely zero
        shards.resize(self.total_shards(), vec![0u8; shard_size]);

        self.rs
            .encode(&mut shards)
            .map_err(|e| Error::ErasureCoding(format!("parity computation failed: {}", e)))?;

        debug!(shard_size, shards = shards.len(), "Ciphertext erasure-coded");
        Ok(shards)
    }

    /// Fill in every missing shard. At least k must be present.
    #[instrument(skip(self, shards))]
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        let available = self.check_available(shards)?;

        self.rs
            .reconstruct(shards)
            .map_err(|e| Error::ErasureCoding(format!("shard regeneration failed: {}", e)))?;

        debug!(available, total = self.total_shards(), "Missing shards regenerated");
        Ok(())
    }

    /// Reassemble the original data, reconstructing missing data shards first.
    #[instrument(skip(self, shards))]
    pub fn decode(&self, shards: &mut [Option<Vec<u8>>], original_size: usize) -> Result<Vec<u8>> {
        self.check_available(shards)?;

        self.rs
            .reconstruct_data(shards)
            .map_err(|e| Error::ErasureCoding(format!("data shard recovery failed: {}", e)))?;

        let mut data: Vec<u8> = shards[..self.data_shards].iter().flatten().flatten().copied().collect();
        if data.len() < original_size {
            return Err(Error::ErasureCoding(format!(
                "{} bytes of data shards cannot hold {} bytes of ciphertext",
                data.len(),
                original_size
            )));
        }
        data.truncate(original_size);
        Ok(data)
    }

    fn check_available(&self, shards: &[Option<Vec<u8>>]) -> Result<usize> {
        if shards.len() != self.total_shards() {
            return Err(Error::InvalidConfig(format!(
                "{}+{} layout needs {} shard slots, got {}",
                self.data_shards,
                self.parity_shards,
                self.total_shards(),
                shards.len()
            )));
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data_shards {
            return Err(Error::InsufficientShares {
                available,
                required: self.data_shards,
            });
        }
        Ok(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_layout_from_threshold() {
        let coder = ErasureCoder::for_threshold(4, 6).unwrap();
        assert_eq!(coder.data_shards(), 4);
        assert_eq!(coder.parity_shards(), 2);
        assert_eq!(coder.total_shards(), 6);
        assert_eq!(coder.shard_size(10), 3);
        assert_eq!(coder.shard_size(0), 1);
    }

    #[test]
    fn test_invalid_config() {
        assert!(ErasureCoder::new(0, 2).is_err());
        assert!(ErasureCoder::new(4, 0).is_err());
        assert!(ErasureCoder::for_threshold(3, 3).is_err());
    }

    #[test]
    fn test_roundtrip_with_loss() {
        let coder = ErasureCoder::for_threshold(4, 6).unwrap();
        let original = b"Testing recovery from shard loss with erasure coding!";

        let shards = coder.encode(original).unwrap();
        let size = shards[0].len();
        assert!(shards.iter().all(|s| s.len() == size));

        let mut optional: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        optional[1] = None;
        optional[4] = None;

        assert_eq!(coder.decode(&mut optional, original.len()).unwrap(), original);
    }

    #[test]
    fn test_reconstruct_restores_parity() {
        let coder = ErasureCoder::new(2, 2).unwrap();
        let shards = coder.encode(b"parity shards come back too").unwrap();

        let mut optional: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
        optional[0] = None;
        optional[3] = None;

        coder.reconstruct(&mut optional).unwrap();
        let rebuilt: Vec<Vec<u8>> = optional.into_iter().flatten().collect();
        assert_eq!(rebuilt, shards);
    }

    #[test]
    fn test_empty_data() {
        let coder = ErasureCoder::new(3, 2).unwrap();
        let shards = coder.encode(&[]).unwrap();
        assert_eq!(shards.len(), 5);
        assert!(shards.iter().all(|s| s.len() == 1));

        let mut optional: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        optional[0] = None;
        assert!(coder.decode(&mut optional, 0).unwrap().is_empty());
    }

    #[test]
    fn test_insufficient_shards() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> = vec![
            Some(vec![0u8; 16]),
            Some(vec![0u8; 16]),
            Some(vec![0u8; 16]),
            None,
            None,
            None,
        ];

        assert_matches!(
            coder.reconstruct(&mut shards),
            Err(Error::InsufficientShares {
                available: 3,
                required: 4
            })
        );
    }
}
