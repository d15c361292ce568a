//! Shard Codec Module
//!
//! Turns a plaintext file into encrypted, integrity-checked shards and back.
//!
//! ```text
//! plaintext ──HKDF/AES-256-GCM──▶ ciphertext ──SSS or RS──▶ N shards + manifest
//! ```
//!
//! # Components
//!
//! - **Crypto** (`crypto.rs`): master keys, per-file key derivation,
//!   authenticated encryption.
//! - **Shard** (`shard.rs`): stored shard with its SHA-256.
//! - **Manifest** (`manifest.rs`): coding parameters, shard hashes and
//!   locations, encryption parameters.
//! - **Erasure** (`erasure.rs`): Reed-Solomon data + parity coding.
//! - **Pipeline** (`pipeline.rs`): `ShardCodec` encode, decode and
//!   shard regeneration.

pub mod crypto;
pub mod erasure;
pub mod manifest;
pub mod pipeline;
pub mod shard;

pub use crypto::{EncryptedBlob, FileContext, MasterKey};
pub use erasure::ErasureCoder;
pub use manifest::{CodingMode, EncryptionParams, FileManifest, ShardLocation};
pub use pipeline::{CodingParams, DecodedFile, EncodedFile, RejectedShard, ShardCodec};
pub use shard::Shard;
