//! File manifests
//!
//! The manifest is the single source of truth for a protected file: its
//! coding parameters, the expected hash of every shard, where each shard
//! currently lives, and what is needed to decrypt the reassembled
//! ciphertext.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::crypto::{decode_hex_array, EncryptedBlob, CIPHER_NAME, IV_LEN, KDF_NAME, SALT_LEN, TAG_LEN};

/// How the ciphertext is turned into shards. Never mixed within one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodingMode {
    /// Shamir threshold sharing: every shard is a full share, K of N needed
    #[default]
    Shamir,
    /// Systematic Reed-Solomon: K data shards plus N-K parity shards
    Erasure,
}

impl std::fmt::Display for CodingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodingMode::Shamir => write!(f, "shamir"),
            CodingMode::Erasure => write!(f, "erasure"),
        }
    }
}

impl std::str::FromStr for CodingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "shamir" | "sss" => Ok(CodingMode::Shamir),
            "erasure" | "rs" | "reed-solomon" => Ok(CodingMode::Erasure),
            other => Err(Error::InvalidConfig(format!("unknown coding mode: {}", other))),
        }
    }
}

/// Parameters needed to decrypt the reassembled ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParams {
    pub algorithm: String,
    pub kdf: String,
    /// HKDF salt, hex
    pub salt: String,
    /// GCM nonce, hex
    pub iv: String,
    /// GCM tag, hex
    pub tag: String,
}

impl EncryptionParams {
    pub fn from_blob(blob: &EncryptedBlob) -> Self {
        Self {
            algorithm: CIPHER_NAME.to_string(),
            kdf: KDF_NAME.to_string(),
            salt: hex::encode(blob.salt),
            iv: hex::encode(blob.iv),
            tag: hex::encode(blob.tag),
        }
    }

    /// Rebuild a blob around `ciphertext`.
    pub fn to_blob(&self, ciphertext: Vec<u8>) -> Result<EncryptedBlob> {
        if self.algorithm != CIPHER_NAME || self.kdf != KDF_NAME {
            return Err(Error::InvalidConfig(format!(
                "unsupported encryption scheme {} / {}",
                self.algorithm, self.kdf
            )));
        }
        Ok(EncryptedBlob {
            ciphertext,
            iv: decode_hex_array::<IV_LEN>("manifest iv", &self.iv)?,
            tag: decode_hex_array::<TAG_LEN>("manifest tag", &self.tag)?,
            salt: decode_hex_array::<SALT_LEN>("manifest salt", &self.salt)?,
        })
    }
}

/// Where a shard is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLocation {
    pub provider_id: String,
    /// Opaque handle returned by the provider
    pub storage_id: String,
    pub stored_at: DateTime<Utc>,
}

impl ShardLocation {
    pub fn new(provider_id: impl Into<String>, storage_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            storage_id: storage_id.into(),
            stored_at: Utc::now(),
        }
    }
}

/// Everything needed to locate, verify and decode a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileManifest {
    pub file_id: String,
    pub file_name: String,
    /// K
    pub threshold: u8,
    /// N
    pub total: u8,
    pub mode: CodingMode,
    /// Expected SHA-256 of each shard payload, by 1-based index
    pub shard_hashes: BTreeMap<u8, String>,
    /// Current location of each placed shard, by 1-based index
    #[serde(default)]
    pub locations: BTreeMap<u8, ShardLocation>,
    pub encryption: EncryptionParams,
    /// SHA-256 of the plaintext, hex
    pub file_hash: String,
    pub plaintext_size: u64,
    pub ciphertext_size: u64,
    /// Bumped on every location change
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileManifest {
    /// Structural checks shared by decode and repair.
    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 || self.threshold > self.total {
            return Err(Error::InvalidConfig(format!(
                "manifest {} has invalid threshold {} of {}",
                self.file_id, self.threshold, self.total
            )));
        }
        if self.mode == CodingMode::Erasure && self.total <= self.threshold {
            return Err(Error::InvalidConfig(format!(
                "erasure manifest {} needs at least one parity shard",
                self.file_id
            )));
        }
        if self.shard_hashes.len() != self.total as usize
            || self.shard_hashes.keys().any(|&i| i == 0 || i > self.total)
        {
            return Err(Error::InvalidConfig(format!(
                "manifest {} lists {} shard hashes for {} shards",
                self.file_id,
                self.shard_hashes.len(),
                self.total
            )));
        }
        Ok(())
    }

    pub fn threshold(&self) -> usize {
        self.threshold as usize
    }

    pub fn total(&self) -> usize {
        self.total as usize
    }

    /// All shard indices, 1..=N.
    pub fn indices(&self) -> impl Iterator<Item = u8> {
        1..=self.total
    }

    pub fn hash_for(&self, index: u8) -> Option<&str> {
        self.shard_hashes.get(&index).map(String::as_str)
    }

    pub fn location(&self, index: u8) -> Option<&ShardLocation> {
        self.locations.get(&index)
    }

    /// Record a new location for a shard.
    pub fn set_location(&mut self, index: u8, location: ShardLocation) {
        self.locations.insert(index, location);
        self.touch();
    }

    pub fn remove_location(&mut self, index: u8) -> Option<ShardLocation> {
        let removed = self.locations.remove(&index);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Indices with no recorded location.
    pub fn unplaced_indices(&self) -> Vec<u8> {
        self.indices()
            .filter(|i| !self.locations.contains_key(i))
            .collect()
    }

    /// Providers currently holding any shard of this file.
    pub fn providers(&self) -> HashSet<String> {
        self.locations
            .values()
            .map(|l| l.provider_id.clone())
            .collect()
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}
