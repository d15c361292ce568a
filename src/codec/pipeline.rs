//! Shard Codec
//!
//! encode: plaintext → HKDF file key → AES-256-GCM → K-of-N shards + manifest
//! decode: shards → integrity screen → reassemble → decrypt → hash check
//!
//! Shards that fail screening (wrong hash, out-of-range index, duplicate,
//! malformed payload) are excluded and reported rather than aborting the
//! decode, as long as K valid shards remain.

use crate::error::{Error, Result};
use crate::sss::{self, Share};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

use super::crypto::{self, sha256_hex, FileContext, MasterKey};
use super::erasure::ErasureCoder;
use super::manifest::{CodingMode, EncryptionParams, FileManifest};
use super::shard::Shard;

// =============================================================================
// Parameters and results
// =============================================================================

/// Coding parameters for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodingParams {
    /// K: shards needed to decode
    pub threshold: usize,
    /// N: shards produced
    pub total: usize,
    pub mode: CodingMode,
}

impl CodingParams {
    pub fn shamir(threshold: usize, total: usize) -> Self {
        Self {
            threshold,
            total,
            mode: CodingMode::Shamir,
        }
    }

    pub fn erasure(threshold: usize, total: usize) -> Self {
        Self {
            threshold,
            total,
            mode: CodingMode::Erasure,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 || self.threshold > self.total {
            return Err(Error::InvalidConfig(format!(
                "threshold {} must be between 1 and total {}",
                self.threshold, self.total
            )));
        }
        if self.total > sss::MAX_SHARES {
            return Err(Error::InvalidConfig(format!(
                "total shards {} exceeds maximum of {}",
                self.total,
                sss::MAX_SHARES
            )));
        }
        if self.mode == CodingMode::Erasure && self.total == self.threshold {
            return Err(Error::InvalidConfig(
                "erasure mode requires total shards greater than threshold".into(),
            ));
        }
        Ok(())
    }
}

impl Default for CodingParams {
    fn default() -> Self {
        Self::shamir(3, 5)
    }
}

/// Shards and manifest produced by [`ShardCodec::encode`].
#[derive(Debug, Clone)]
pub struct EncodedFile {
    pub shards: Vec<Shard>,
    pub manifest: FileManifest,
}

/// A shard excluded during decode, with the reason.
#[derive(Debug)]
pub struct RejectedShard {
    pub index: u8,
    pub error: Error,
}

/// Result of [`ShardCodec::decode_detailed`].
#[derive(Debug)]
pub struct DecodedFile {
    pub plaintext: Vec<u8>,
    /// Indices of the shards that passed screening
    pub valid_indices: Vec<u8>,
    pub rejected: Vec<RejectedShard>,
}

impl DecodedFile {
    pub fn rejected_indices(&self) -> Vec<u8> {
        self.rejected.iter().map(|r| r.index).collect()
    }
}

/// Shards that survived screening, keyed by index.
struct Screened {
    payloads: BTreeMap<u8, Bytes>,
    /// Parsed shares, Shamir mode only
    shares: BTreeMap<u8, Share>,
    rejected: Vec<RejectedShard>,
}

// =============================================================================
// Shard Codec
// =============================================================================

/// Stateless encoder/decoder for protected files.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardCodec;

impl ShardCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encrypt and split a file.
    #[instrument(skip(self, data, master_key), fields(file_id = %context.file_id, size = data.len()))]
    pub fn encode(
        &self,
        data: &[u8],
        params: CodingParams,
        master_key: &MasterKey,
        context: &FileContext,
    ) -> Result<EncodedFile> {
        params.validate()?;

        let blob = crypto::encrypt(master_key, context, data)?;

        let payloads: Vec<Vec<u8>> = match params.mode {
            CodingMode::Shamir => sss::split(&blob.ciphertext, params.threshold, params.total)?
                .iter()
                .map(Share::to_bytes)
                .collect::<Result<_>>()?,
            CodingMode::Erasure => {
                ErasureCoder::for_threshold(params.threshold, params.total)?.encode(&blob.ciphertext)?
            }
        };

        let shards: Vec<Shard> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| Shard::new(context.file_id.clone(), (i + 1) as u8, payload))
            .collect();

        let now = Utc::now();
        let manifest = FileManifest {
            file_id: context.file_id.clone(),
            file_name: context.file_name.clone(),
            threshold: params.threshold as u8,
            total: params.total as u8,
            mode: params.mode,
            shard_hashes: shards.iter().map(|s| (s.index, s.hash.clone())).collect(),
            locations: BTreeMap::new(),
            encryption: EncryptionParams::from_blob(&blob),
            file_hash: sha256_hex(data),
            plaintext_size: data.len() as u64,
            ciphertext_size: blob.ciphertext.len() as u64,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        info!(
            threshold = params.threshold,
            total = params.total,
            mode = %params.mode,
            "Encoded file into shards"
        );

        Ok(EncodedFile { shards, manifest })
    }

    /// Decode a file, returning only the plaintext.
    pub fn decode(
        &self,
        shards: &[Shard],
        manifest: &FileManifest,
        master_key: &MasterKey,
        context: &FileContext,
    ) -> Result<Vec<u8>> {
        self.decode_detailed(shards, manifest, master_key, context)
            .map(|decoded| decoded.plaintext)
    }

    /// Decode a file and report which shards were rejected.
    #[instrument(skip_all, fields(file_id = %manifest.file_id, supplied = shards.len()))]
    pub fn decode_detailed(
        &self,
        shards: &[Shard],
        manifest: &FileManifest,
        master_key: &MasterKey,
        context: &FileContext,
    ) -> Result<DecodedFile> {
        manifest.validate()?;

        let required = manifest.threshold();
        if shards.len() < required {
            return Err(Error::InsufficientShares {
                available: shards.len(),
                required,
            });
        }

        let screened = screen(shards, manifest);
        let ciphertext = reassemble(&screened, manifest)?;

        let blob = manifest.encryption.to_blob(ciphertext)?;
        let plaintext = crypto::decrypt(master_key, context, &blob)?;

        if sha256_hex(&plaintext) != manifest.file_hash {
            return Err(Error::integrity(
                format!("file {}", manifest.file_id),
                "plaintext hash does not match manifest",
            ));
        }

        debug!(
            valid = screened.payloads.len(),
            rejected = screened.rejected.len(),
            "Decoded file"
        );

        Ok(DecodedFile {
            plaintext,
            valid_indices: screened.payloads.keys().copied().collect(),
            rejected: screened.rejected,
        })
    }

    /// Rebuild the shards at `indices` from valid survivors without
    /// decrypting. Each rebuilt shard must match its manifest hash.
    #[instrument(skip_all, fields(file_id = %manifest.file_id, indices = ?indices))]
    pub fn regenerate(&self, shards: &[Shard], manifest: &FileManifest, indices: &[u8]) -> Result<Vec<Shard>> {
        manifest.validate()?;

        if let Some(bad) = indices.iter().find(|&&i| i == 0 || i > manifest.total) {
            return Err(Error::InvalidConfig(format!(
                "cannot regenerate shard {} of {}",
                bad, manifest.total
            )));
        }

        let screened = screen(shards, manifest);
        let required = manifest.threshold();
        if screened.payloads.len() < required {
            return Err(Error::InsufficientValidShares {
                valid: screened.payloads.len(),
                required,
            });
        }

        let payloads: Vec<(u8, Vec<u8>)> = match manifest.mode {
            CodingMode::Shamir => {
                let shares: Vec<Share> = screened.shares.values().cloned().collect();
                indices
                    .iter()
                    .map(|&i| -> Result<(u8, Vec<u8>)> {
                        Ok((i, sss::interpolate_share(&shares, i)?.to_bytes()?))
                    })
                    .collect::<Result<_>>()?
            }
            CodingMode::Erasure => {
                let coder = ErasureCoder::for_threshold(manifest.threshold(), manifest.total())?;
                let mut slots: Vec<Option<Vec<u8>>> = manifest
                    .indices()
                    .map(|i| screened.payloads.get(&i).map(|p| p.to_vec()))
                    .collect();
                coder.reconstruct(&mut slots)?;
                indices
                    .iter()
                    .map(|&i| {
                        slots[i as usize - 1]
                            .clone()
                            .map(|p| (i, p))
                            .ok_or_else(|| Error::ErasureCoding(format!("shard {} was not rebuilt", i)))
                    })
                    .collect::<Result<_>>()?
            }
        };

        payloads
            .into_iter()
            .map(|(index, payload)| {
                let shard = Shard::new(manifest.file_id.clone(), index, payload);
                match manifest.hash_for(index) {
                    Some(expected) if expected == shard.hash => Ok(shard),
                    _ => Err(Error::integrity(
                        shard.shard_id.clone(),
                        "regenerated shard does not match manifest hash",
                    )),
                }
            })
            .collect()
    }
}

// =============================================================================
// Screening and reassembly
// =============================================================================

fn screen(shards: &[Shard], manifest: &FileManifest) -> Screened {
    let mut screened = Screened {
        payloads: BTreeMap::new(),
        shares: BTreeMap::new(),
        rejected: Vec::new(),
    };

    for shard in shards {
        match check_shard(shard, manifest, &screened.payloads) {
            Ok(share) => {
                screened.payloads.insert(shard.index, shard.payload.clone());
                if let Some(share) = share {
                    screened.shares.insert(shard.index, share);
                }
            }
            Err(error) => {
                warn!(shard = %shard.shard_id, %error, "Excluding shard");
                screened.rejected.push(RejectedShard {
                    index: shard.index,
                    error,
                });
            }
        }
    }

    screened
}

fn check_shard(shard: &Shard, manifest: &FileManifest, accepted: &BTreeMap<u8, Bytes>) -> Result<Option<Share>> {
    if shard.file_id != manifest.file_id {
        return Err(Error::InvalidShare(format!(
            "shard {} belongs to file {}",
            shard.shard_id, shard.file_id
        )));
    }
    let expected = manifest.hash_for(shard.index).ok_or_else(|| {
        Error::InvalidShare(format!(
            "index {} outside 1..={}",
            shard.index, manifest.total
        ))
    })?;
    if accepted.contains_key(&shard.index) {
        return Err(Error::InvalidShare(format!("duplicate shard index {}", shard.index)));
    }
    if !shard.matches(expected) {
        return Err(Error::integrity(shard.shard_id.clone(), "payload hash mismatch"));
    }

    match manifest.mode {
        CodingMode::Shamir => {
            let share = Share::from_bytes(&shard.payload)?;
            sss::validate_share(&share, manifest.threshold(), manifest.total())?;
            if share.x != shard.index || share.secret_len != manifest.ciphertext_size {
                return Err(Error::InvalidShare(format!(
                    "share payload does not fit slot {} of file {}",
                    shard.index, manifest.file_id
                )));
            }
            Ok(Some(share))
        }
        CodingMode::Erasure => Ok(None),
    }
}

fn reassemble(screened: &Screened, manifest: &FileManifest) -> Result<Vec<u8>> {
    let required = manifest.threshold();
    if screened.payloads.len() < required {
        return Err(Error::InsufficientValidShares {
            valid: screened.payloads.len(),
            required,
        });
    }

    let ciphertext_size = usize::try_from(manifest.ciphertext_size)
        .map_err(|_| Error::InvalidConfig("ciphertext size exceeds address space".into()))?;

    let ciphertext = match manifest.mode {
        CodingMode::Shamir => {
            let shares: Vec<Share> = screened.shares.values().cloned().collect();
            sss::reconstruct(&shares)?
        }
        CodingMode::Erasure => {
            let coder = ErasureCoder::for_threshold(manifest.threshold(), manifest.total())?;
            let mut slots: Vec<Option<Vec<u8>>> = manifest
                .indices()
                .map(|i| screened.payloads.get(&i).map(|p| p.to_vec()))
                .collect();
            coder.decode(&mut slots, ciphertext_size)?
        }
    };

    if ciphertext.len() != ciphertext_size {
        return Err(Error::integrity(
            format!("file {}", manifest.file_id),
            "reassembled ciphertext has the wrong length",
        ));
    }
    Ok(ciphertext)
}

// =============================================================================
// Tests
// =============================================================================
