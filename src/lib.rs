//! Shardwarden - Shard Lifecycle Engine
//!
//! Encrypts files, splits them into threshold shards spread over an
//! untrusted storage network, keeps enough of those shards alive, and lets
//! users recover their root key through trusted guardians.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │  ShardCodec: HKDF → AES-256-GCM → Shamir (sss) | Reed-Solomon       │
//! └────────────────────────────────────────────────────────────────────┘
//!          │ shards + manifest                      │
//!          ▼                                        ▼
//! ┌──────────────────────┐   schedule   ┌──────────────────────────────┐
//! │  RedundancyMonitor   │─────────────▶│  RepairEngine (RepairJob)     │
//! │  (probe, classify)   │◀─────────────│  gather → regenerate → place  │
//! └──────────────────────┘   notices    └──────────────────────────────┘
//!
//! ┌──────────────────────┐              ┌──────────────────────────────┐
//! │ GuardianShardVault   │              │ GuardianRecoveryProtocol     │
//! │ replicas, audits     │              │ sealed shares, approvals     │
//! └──────────────────────┘              └──────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`sss`] - Shamir secret sharing over a 256-bit prime field
//! - [`codec`] - File encryption, sharding and manifests
//! - [`monitor`] - Redundancy monitoring and repair jobs
//! - [`recovery`] - Guardian-based root key recovery
//! - [`vault`] - Guardian replica vault for vault-tier files
//! - [`domain`] - Ports and domain events
//! - [`adapters`] - In-memory and event adapters implementing the ports
//! - [`config`] - YAML configuration
//! - [`metrics`] - Prometheus metrics
//! - [`error`] - Error types

pub mod adapters;
pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod recovery;
pub mod sss;
pub mod vault;

// Re-export commonly used types
pub use codec::{CodingMode, CodingParams, FileContext, FileManifest, MasterKey, Shard, ShardCodec};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use metrics::EngineMetrics;
pub use monitor::{HealthStatus, RedundancyMonitor, RepairEngine};
pub use recovery::GuardianRecoveryProtocol;
pub use vault::GuardianShardVault;
