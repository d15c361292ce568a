//! Guardian Shard Vault
//!
//! Replicates vault-tier shards to scored guardian nodes and reassembles
//! files from those replicas when primary placement is lost.

pub mod scoring;
#[allow(clippy::module_inception)]
pub mod vault;

pub use scoring::{is_eligible, score, select_guardians, ScoringWeights};
pub use vault::{
    AuditReport, GuardianHealthReport, GuardianNode, GuardianShardVault, ReplicaStatus, VaultConfig, VaultFile,
    VaultReplica, VaultShardRecord,
};
