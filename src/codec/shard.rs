//! Shards as stored on providers

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::crypto::sha256_hex;

/// One stored piece of an encoded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// `<file_id>:<index>`
    pub shard_id: String,
    pub file_id: String,
    /// 1-based position within the file's N shards
    pub index: u8,
    pub payload: Bytes,
    /// SHA-256 of `payload`, hex
    pub hash: String,
    pub size: usize,
}

impl Shard {
    pub fn new(file_id: impl Into<String>, index: u8, payload: impl Into<Bytes>) -> Self {
        let file_id = file_id.into();
        let payload = payload.into();
        Self {
            shard_id: Self::id_for(&file_id, index),
            hash: sha256_hex(&payload),
            size: payload.len(),
            file_id,
            index,
            payload,
        }
    }

    pub fn id_for(file_id: &str, index: u8) -> String {
        format!("{}:{}", file_id, index)
    }

    /// Recompute the payload hash and compare it with `expected`.
    pub fn matches(&self, expected: &str) -> bool {
        sha256_hex(&self.payload) == expected
    }

    /// Whether the payload still matches its own recorded hash.
    pub fn is_intact(&self) -> bool {
        self.matches(&self.hash)
    }
}
