//! Guardian Shard Vault
//!
//! Extra redundancy for vault-tier files. Every shard of a protected file is
//! replicated to R guardian nodes picked by [`select_guardians`]. Periodic
//! health pings track which guardians are reachable and random audits catch
//! silently corrupted replicas, which are re-replicated from a healthy copy.
//! When the primary shard placement is gone, [`GuardianShardVault::emergency_recover`]
//! reassembles the file from whatever replicas still answer.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::{FileContext, FileManifest, MasterKey, Shard, ShardCodec};
use crate::config::duration_serde;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{namespaces, EventPublisher, ProviderInfo, ProviderNetwork, StateStore};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;

use super::scoring::{is_eligible, select_guardians, ScoringWeights};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Replicas kept per shard (R)
    pub replication_factor: usize,

    /// Eligible guardians required before a file can be protected
    pub min_distinct_guardians: usize,

    /// Accepted writes below which a shard's placement is rolled back
    pub min_replica_writes: usize,

    /// Attempts per shard on transient placement failures
    pub max_attempts: u32,

    /// Base delay between attempts, multiplied by the attempt number
    #[serde(with = "duration_serde")]
    pub retry_delay: Duration,

    #[serde(with = "duration_serde")]
    pub ping_timeout: Duration,

    /// Timeout for one replica upload or download
    #[serde(with = "duration_serde")]
    pub transfer_timeout: Duration,

    /// Replicas fetched per audit round
    pub audit_sample_size: usize,

    /// Interval of the health and audit loop
    #[serde(with = "duration_serde")]
    pub check_interval: Duration,

    pub weights: ScoringWeights,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            replication_factor: 2,
            min_distinct_guardians: 3,
            min_replica_writes: 2,
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(5),
            transfer_timeout: Duration::from_secs(30),
            audit_sample_size: 8,
            check_interval: Duration::from_secs(300),
            weights: ScoringWeights::default(),
        }
    }
}

impl VaultConfig {
    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            return Err(Error::Config("vault.replication_factor must be at least 1".into()));
        }
        if self.min_replica_writes == 0 || self.min_replica_writes > self.replication_factor {
            return Err(Error::Config(format!(
                "vault.min_replica_writes must be between 1 and replication_factor ({})",
                self.replication_factor
            )));
        }
        if self.min_distinct_guardians < self.replication_factor {
            return Err(Error::Config(
                "vault.min_distinct_guardians must be at least replication_factor".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("vault.max_attempts must be at least 1".into()));
        }
        self.weights.validate()
    }
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    Healthy,
    /// Failed an audit and awaits re-replication
    Corrupted,
}

/// One copy of a shard held by a guardian.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultReplica {
    pub guardian_id: String,
    pub storage_id: String,
    pub status: ReplicaStatus,
    pub stored_at: DateTime<Utc>,
    pub last_verified: Option<DateTime<Utc>>,
}

impl VaultReplica {
    fn new(guardian_id: impl Into<String>, storage_id: impl Into<String>) -> Self {
        Self {
            guardian_id: guardian_id.into(),
            storage_id: storage_id.into(),
            status: ReplicaStatus::Healthy,
            stored_at: Utc::now(),
            last_verified: None,
        }
    }
}

/// Replica placement of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultShardRecord {
    pub file_id: String,
    pub shard_index: u8,
    pub hash: String,
    pub size: usize,
    pub replicas: Vec<VaultReplica>,
}

impl VaultShardRecord {
    pub fn healthy_replicas(&self) -> impl Iterator<Item = &VaultReplica> {
        self.replicas.iter().filter(|r| r.status == ReplicaStatus::Healthy)
    }

    pub fn holders(&self) -> HashSet<&str> {
        self.replicas.iter().map(|r| r.guardian_id.as_str()).collect()
    }

    fn replica_mut(&mut self, guardian_id: &str) -> Option<&mut VaultReplica> {
        self.replicas.iter_mut().find(|r| r.guardian_id == guardian_id)
    }
}

/// A vault-protected file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultFile {
    pub file_id: String,
    pub owner: String,
    pub manifest: FileManifest,
    pub shards: BTreeMap<u8, VaultShardRecord>,
    pub protected_at: DateTime<Utc>,
}

impl VaultFile {
    pub fn replica_count(&self) -> usize {
        self.shards.values().map(|s| s.replicas.len()).sum()
    }
}

/// A registered guardian node.
#[derive(Debug, Clone)]
pub struct GuardianNode {
    pub info: ProviderInfo,
    pub last_checked: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardianHealthReport {
    pub online: Vec<String>,
    pub offline: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub audited: usize,
    pub passed: usize,
    pub failed: usize,
    /// Failed replicas replaced by a fresh copy
    pub replicated: usize,
    /// Replicas that could not be reached in time; not counted as failures
    pub unreachable: usize,
}

enum AuditVerdict {
    Passed,
    Failed(String),
    Unreachable,
}

// =============================================================================
// Vault
// =============================================================================

pub struct GuardianShardVault {
    config: VaultConfig,
    network: Arc<dyn ProviderNetwork>,
    state: StateStore,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<EngineMetrics>,
    codec: ShardCodec,
    guardians: DashMap<String, GuardianNode>,
    files: DashMap<String, VaultFile>,
}

impl std::fmt::Debug for GuardianShardVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardianShardVault")
            .field("config", &self.config)
            .field("guardians", &self.guardians.len())
            .field("files", &self.files.len())
            .finish_non_exhaustive()
    }
}

impl GuardianShardVault {
    pub fn new(
        config: VaultConfig,
        network: Arc<dyn ProviderNetwork>,
        state: StateStore,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            network,
            state,
            events,
            metrics,
            codec: ShardCodec::new(),
            guardians: DashMap::new(),
            files: DashMap::new(),
        })
    }

    /// Load persisted vault records. Returns how many files were loaded.
    pub async fn load_records(&self) -> Result<usize> {
        let files: Vec<VaultFile> = self.state.load_all(namespaces::VAULT_RECORDS).await?;
        let count = files.len();
        for file in files {
            self.files.insert(file.file_id.clone(), file);
        }
        info!(count, "Loaded vault records");
        Ok(count)
    }

    // =========================================================================
    // Guardian registry
    // =========================================================================

    /// Add or refresh a guardian node.
    pub fn register_guardian(&self, info: ProviderInfo) {
        debug!(guardian_id = %info.id, region = %info.region, "Registered guardian");
        self.guardians.insert(
            info.id.clone(),
            GuardianNode {
                info,
                last_checked: None,
                consecutive_failures: 0,
            },
        );
    }

    pub fn deregister_guardian(&self, guardian_id: &str) -> bool {
        self.guardians.remove(guardian_id).is_some()
    }

    pub fn guardian(&self, guardian_id: &str) -> Option<GuardianNode> {
        self.guardians.get(guardian_id).map(|g| g.value().clone())
    }

    pub fn guardians(&self) -> Vec<ProviderInfo> {
        let mut infos: Vec<ProviderInfo> = self.guardians.iter().map(|g| g.info.clone()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    fn is_online(&self, guardian_id: &str) -> bool {
        self.guardians.get(guardian_id).is_some_and(|g| g.info.online)
    }

    // =========================================================================
    // Protection
    // =========================================================================

    pub fn file(&self, file_id: &str) -> Option<VaultFile> {
        self.files.get(file_id).map(|f| f.value().clone())
    }

    pub fn protected_files(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.files.iter().map(|f| f.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Replicate every shard of a file to guardians.
    ///
    /// All-or-nothing: if any shard cannot reach `min_replica_writes`
    /// replicas after retries, replicas already written for this file are
    /// deleted and the error is returned.
    #[instrument(skip(self, manifest, shards), fields(file_id = %manifest.file_id, shards = shards.len()))]
    pub async fn protect_file(&self, owner: &str, manifest: &FileManifest, shards: &[Shard]) -> Result<VaultFile> {
        manifest.validate()?;
        if self.files.contains_key(&manifest.file_id) {
            return Err(Error::InvalidConfig(format!(
                "file {} is already protected",
                manifest.file_id
            )));
        }
        for shard in shards {
            let expected = manifest.hash_for(shard.index);
            if shard.file_id != manifest.file_id || !expected.is_some_and(|h| shard.matches(h)) {
                return Err(Error::integrity(
                    format!("shard {} of {}", shard.index, manifest.file_id),
                    "does not match the manifest",
                ));
            }
        }
        if shards.len() < manifest.threshold() {
            return Err(Error::InsufficientShares {
                available: shards.len(),
                required: manifest.threshold(),
            });
        }

        let largest = shards.iter().map(|s| s.size as u64).max().unwrap_or(0);
        let candidates: Vec<ProviderInfo> = self
            .guardians()
            .into_iter()
            .filter(|g| is_eligible(g, owner, largest))
            .collect();
        if candidates.len() < self.config.min_distinct_guardians {
            return Err(Error::InsufficientGuardians {
                available: candidates.len(),
                required: self.config.min_distinct_guardians,
            });
        }
        let ranked = select_guardians(&candidates, owner, candidates.len(), largest, &self.config.weights);

        let mut records = BTreeMap::new();
        for (position, shard) in shards.iter().enumerate() {
            // Rotate the ranking so consecutive shards land on different guardians
            let offset = (position * self.config.replication_factor) % ranked.len();
            let order: Vec<&ProviderInfo> = ranked.iter().cycle().skip(offset).take(ranked.len()).collect();

            match self.store_shard_with_retry(shard, &order).await {
                Ok(record) => {
                    records.insert(shard.index, record);
                }
                Err(e) => {
                    warn!(index = shard.index, error = %e, "Vault placement failed, rolling back");
                    for record in records.values() {
                        self.cleanup_failed_storage(record).await;
                    }
                    return Err(e);
                }
            }
        }

        let file = VaultFile {
            file_id: manifest.file_id.clone(),
            owner: owner.to_string(),
            manifest: manifest.clone(),
            shards: records,
            protected_at: Utc::now(),
        };
        if let Err(e) = self.persist(&file).await {
            for record in file.shards.values() {
                self.cleanup_failed_storage(record).await;
            }
            return Err(e);
        }

        let events: Vec<DomainEvent> = file
            .shards
            .values()
            .flat_map(|record| {
                record.replicas.iter().map(|r| {
                    DomainEvent::shard_stored(&record.file_id, record.shard_index, &r.guardian_id, &r.storage_id)
                })
            })
            .collect();
        self.metrics.record_shards_stored(events.len());
        info!(replicas = events.len(), "File protected by guardians");
        self.emit_all(events).await;

        self.files.insert(file.file_id.clone(), file.clone());
        Ok(file)
    }

    /// Remove a file from the vault and delete its replicas.
    #[instrument(skip(self))]
    pub async fn unprotect_file(&self, file_id: &str) -> Result<bool> {
        let Some((_, file)) = self.files.remove(file_id) else {
            return Ok(false);
        };
        for record in file.shards.values() {
            self.cleanup_failed_storage(record).await;
        }
        self.state.remove(namespaces::VAULT_RECORDS, file_id).await?;
        info!("File removed from vault");
        Ok(true)
    }

    async fn store_shard_with_retry(&self, shard: &Shard, order: &[&ProviderInfo]) -> Result<VaultShardRecord> {
        let mut attempt = 1;
        loop {
            match self.store_shard(shard, order).await {
                Ok(record) => return Ok(record),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!(index = shard.index, attempt, error = %e, "Replica placement failed, retrying");
                    sleep(self.config.retry_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write one shard to guardians in `order` until R accept.
    async fn store_shard(&self, shard: &Shard, order: &[&ProviderInfo]) -> Result<VaultShardRecord> {
        let mut record = VaultShardRecord {
            file_id: shard.file_id.clone(),
            shard_index: shard.index,
            hash: shard.hash.clone(),
            size: shard.size,
            replicas: Vec::with_capacity(self.config.replication_factor),
        };

        for guardian in order {
            if record.replicas.len() >= self.config.replication_factor {
                break;
            }
            match self.send(&guardian.id, shard).await {
                Ok(storage_id) => record.replicas.push(VaultReplica::new(&guardian.id, storage_id)),
                Err(e) => debug!(guardian_id = %guardian.id, error = %e, "Replica write refused"),
            }
        }

        if record.replicas.len() < self.config.min_replica_writes {
            let accepted = record.replicas.len();
            self.cleanup_failed_storage(&record).await;
            return Err(Error::Placement(format!(
                "shard {} of {}: {} of {} replica writes accepted",
                shard.index, shard.file_id, accepted, self.config.min_replica_writes
            )));
        }
        Ok(record)
    }

    /// Best-effort delete of every replica in `record`.
    pub async fn cleanup_failed_storage(&self, record: &VaultShardRecord) -> usize {
        let deletions = record.replicas.iter().map(|r| async move {
            let result = timeout(
                self.config.transfer_timeout,
                self.network.delete_shard(&r.guardian_id, &r.storage_id),
            )
            .await;
            match result {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(guardian_id = %r.guardian_id, storage_id = %r.storage_id, error = %e, "Failed to delete replica");
                    false
                }
                Err(_) => {
                    warn!(guardian_id = %r.guardian_id, storage_id = %r.storage_id, "Replica delete timed out");
                    false
                }
            }
        });
        join_all(deletions).await.into_iter().filter(|ok| *ok).count()
    }

    // =========================================================================
    // Health and audits
    // =========================================================================

    /// Ping every guardian and record availability and latency.
    #[instrument(skip(self))]
    pub async fn check_guardian_health(&self) -> GuardianHealthReport {
        let ids: Vec<String> = self.guardians.iter().map(|g| g.key().clone()).collect();
        let probes = ids.iter().map(|id| async move {
            let started = Instant::now();
            let online = matches!(
                timeout(self.config.ping_timeout, self.network.probe(id)).await,
                Ok(Ok(true))
            );
            (id, online, started.elapsed())
        });
        let results = join_all(probes).await;

        let now = Utc::now();
        let mut report = GuardianHealthReport::default();
        let mut events = Vec::with_capacity(results.len());
        for (id, online, elapsed) in results {
            if let Some(mut node) = self.guardians.get_mut(id) {
                if node.info.online != online {
                    info!(guardian_id = %id, online, "Guardian availability changed");
                }
                node.info.online = online;
                node.last_checked = Some(now);
                if online {
                    node.info.latency_ms = elapsed.as_millis() as u64;
                    node.consecutive_failures = 0;
                } else {
                    node.consecutive_failures += 1;
                }
            }
            events.push(DomainEvent::guardian_health_checked(
                id.as_str(),
                online,
                online.then_some(elapsed),
            ));
            if online {
                report.online.push(id.clone());
            } else {
                report.offline.push(id.clone());
            }
        }
        report.online.sort();
        report.offline.sort();

        self.metrics.set_guardians_online(report.online.len());
        debug!(online = report.online.len(), offline = report.offline.len(), "Guardian health checked");
        self.emit_all(events).await;
        report
    }

    /// Fetch a random sample of replicas on online guardians and verify
    /// them. Failed replicas are replaced from a healthy copy.
    #[instrument(skip(self))]
    pub async fn audit_random_shards(&self) -> AuditReport {
        let mut targets: Vec<(String, u8, String, String, String)> = Vec::new();
        for file in self.files.iter() {
            for (&index, record) in &file.shards {
                for replica in record.healthy_replicas() {
                    if self.is_online(&replica.guardian_id) {
                        targets.push((
                            file.file_id.clone(),
                            index,
                            record.hash.clone(),
                            replica.guardian_id.clone(),
                            replica.storage_id.clone(),
                        ));
                    }
                }
            }
        }
        let sample: Vec<_> = {
            let mut rng = rand::thread_rng();
            targets
                .choose_multiple(&mut rng, self.config.audit_sample_size)
                .cloned()
                .collect()
        };

        let audits = sample.iter().map(|(_, index, hash, guardian_id, storage_id)| async move {
            let result = timeout(
                self.config.transfer_timeout,
                self.network.fetch_shard(guardian_id, storage_id),
            )
            .await;
            match result {
                Ok(Ok(shard)) if shard.index == *index && shard.matches(hash) => AuditVerdict::Passed,
                Ok(Ok(_)) => AuditVerdict::Failed("hash mismatch".into()),
                Ok(Err(e)) => AuditVerdict::Failed(format!("fetch failed: {}", e)),
                Err(_) => AuditVerdict::Unreachable,
            }
        });
        let verdicts = join_all(audits).await;

        let mut report = AuditReport {
            audited: sample.len(),
            ..Default::default()
        };
        let now = Utc::now();
        // Records changed in memory only; written back once the round is done
        let mut unsaved: BTreeSet<&str> = BTreeSet::new();
        for ((file_id, index, _, guardian_id, _), verdict) in sample.iter().zip(verdicts) {
            match verdict {
                AuditVerdict::Passed => {
                    report.passed += 1;
                    self.metrics.record_audit(true);
                    self.update_replica(file_id, *index, guardian_id, |r| r.last_verified = Some(now));
                    unsaved.insert(file_id.as_str());
                }
                AuditVerdict::Unreachable => {
                    report.unreachable += 1;
                    debug!(%file_id, index, %guardian_id, "Audit fetch timed out");
                }
                AuditVerdict::Failed(reason) => {
                    report.failed += 1;
                    self.metrics.record_audit(false);
                    warn!(%file_id, index, %guardian_id, %reason, "Replica failed audit");
                    self.update_replica(file_id, *index, guardian_id, |r| r.status = ReplicaStatus::Corrupted);
                    self.emit(DomainEvent::audit_failed(file_id.as_str(), *index, guardian_id.as_str(), reason))
                        .await;

                    match self.replicate_shard(file_id, *index, guardian_id).await {
                        Ok(_) => report.replicated += 1,
                        Err(e) => {
                            error!(%file_id, index, error = %e, "Re-replication failed");
                            unsaved.insert(file_id.as_str());
                        }
                    }
                }
            }
        }

        for file_id in unsaved {
            if let Some(file) = self.file(file_id) {
                if let Err(e) = self.persist(&file).await {
                    warn!(%file_id, error = %e, "Failed to persist audit result");
                }
            }
        }

        info!(
            audited = report.audited,
            passed = report.passed,
            failed = report.failed,
            replicated = report.replicated,
            "Audit round finished"
        );
        report
    }

    /// Replace the replica held by `bad_guardian` with a fresh copy on a
    /// guardian that holds none of this shard. Returns the new guardian.
    #[instrument(skip(self))]
    pub async fn replicate_shard(&self, file_id: &str, index: u8, bad_guardian: &str) -> Result<String> {
        let (owner, record) = self
            .files
            .get(file_id)
            .and_then(|f| f.shards.get(&index).map(|r| (f.owner.clone(), r.clone())))
            .ok_or_else(|| Error::VaultShardNotFound(format!("{}/{}", file_id, index)))?;

        let mut source = None;
        for replica in record.healthy_replicas().filter(|r| r.guardian_id != bad_guardian) {
            let fetched = timeout(
                self.config.transfer_timeout,
                self.network.fetch_shard(&replica.guardian_id, &replica.storage_id),
            )
            .await;
            if let Ok(Ok(shard)) = fetched {
                if shard.index == index && shard.matches(&record.hash) {
                    source = Some(shard);
                    break;
                }
            }
        }
        let shard = source.ok_or_else(|| {
            Error::integrity(
                format!("shard {} of {}", index, file_id),
                "no healthy replica left to copy from",
            )
        })?;

        let holders = record.holders();
        let candidates: Vec<ProviderInfo> = self
            .guardians()
            .into_iter()
            .filter(|g| !holders.contains(g.id.as_str()))
            .collect();
        let ranked = select_guardians(&candidates, &owner, candidates.len(), shard.size as u64, &self.config.weights);

        let mut placed = None;
        for guardian in &ranked {
            match self.send(&guardian.id, &shard).await {
                Ok(storage_id) => {
                    placed = Some(VaultReplica::new(&guardian.id, storage_id));
                    break;
                }
                Err(e) => debug!(guardian_id = %guardian.id, error = %e, "Replica write refused"),
            }
        }
        let replacement = placed.ok_or_else(|| {
            Error::Placement(format!("no guardian accepted a new replica of shard {} of {}", index, file_id))
        })?;
        let new_guardian = replacement.guardian_id.clone();

        let (file, removed) = {
            let mut entry = self
                .files
                .get_mut(file_id)
                .ok_or_else(|| Error::FileNotFound(file_id.to_string()))?;
            let file = &mut *entry;
            let Some(record) = file.shards.get_mut(&index) else {
                return Err(Error::VaultShardNotFound(format!("{}/{}", file_id, index)));
            };
            let removed: Vec<VaultReplica> = record
                .replicas
                .iter()
                .filter(|r| r.guardian_id == bad_guardian)
                .cloned()
                .collect();
            record.replicas.retain(|r| r.guardian_id != bad_guardian);
            record.replicas.push(replacement);
            (file.clone(), removed)
        };
        self.persist(&file).await?;

        for old in removed {
            if let Err(e) = self.network.delete_shard(&old.guardian_id, &old.storage_id).await {
                debug!(guardian_id = %old.guardian_id, error = %e, "Could not delete failed replica");
            }
        }

        info!(guardian_id = %new_guardian, "Shard re-replicated");
        self.emit(DomainEvent::shard_replicated(file_id, index, new_guardian.as_str()))
            .await;
        Ok(new_guardian)
    }

    // =========================================================================
    // Emergency recovery
    // =========================================================================

    /// Reassemble a file from guardian replicas alone.
    ///
    /// For each shard, replicas are tried one at a time (guardians believed
    /// online first) until one returns a hash-valid copy. Stops once K
    /// shards are in hand.
    #[instrument(skip(self, master_key, context))]
    pub async fn emergency_recover(
        &self,
        file_id: &str,
        master_key: &MasterKey,
        context: &FileContext,
    ) -> Result<Vec<u8>> {
        let file = self
            .file(file_id)
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))?;
        let required = file.manifest.threshold();

        let mut collected: Vec<Shard> = Vec::with_capacity(required);
        let mut tried = 0usize;
        let mut retrieved = Vec::new();

        for (&index, record) in &file.shards {
            if collected.len() >= required {
                break;
            }
            let mut replicas: Vec<&VaultReplica> = record.replicas.iter().collect();
            replicas.sort_by_key(|r| !self.is_online(&r.guardian_id));

            for replica in replicas {
                tried += 1;
                let fetched = timeout(
                    self.config.transfer_timeout,
                    self.network.fetch_shard(&replica.guardian_id, &replica.storage_id),
                )
                .await;
                match fetched {
                    Ok(Ok(shard)) if shard.index == index && shard.matches(&record.hash) => {
                        retrieved.push(DomainEvent::shard_retrieved(file_id, index, replica.guardian_id.as_str()));
                        collected.push(shard);
                        break;
                    }
                    Ok(Ok(_)) => warn!(index, guardian_id = %replica.guardian_id, "Replica failed its hash check"),
                    Ok(Err(e)) => debug!(index, guardian_id = %replica.guardian_id, error = %e, "Replica fetch failed"),
                    Err(_) => debug!(index, guardian_id = %replica.guardian_id, "Replica fetch timed out"),
                }
            }
        }
        self.emit_all(retrieved).await;

        if collected.len() < required {
            error!(available = collected.len(), required, "Emergency recovery could not gather enough shards");
            self.emit(DomainEvent::emergency_recovery(file_id, collected.len(), tried, false))
                .await;
            return Err(Error::InsufficientShares {
                available: collected.len(),
                required,
            });
        }

        let used = collected.len();
        let result = {
            let codec = self.codec;
            let manifest = file.manifest.clone();
            let key = master_key.clone();
            let context = context.clone();
            tokio::task::spawn_blocking(move || codec.decode(&collected, &manifest, &key, &context))
                .await
                .map_err(|e| Error::Internal(format!("vault decode worker panicked: {}", e)))?
        };

        match &result {
            Ok(_) => info!(shards_used = used, replicas_tried = tried, "Emergency recovery succeeded"),
            Err(e) => error!(error = %e, "Emergency recovery decode failed"),
        }
        self.emit(DomainEvent::emergency_recovery(file_id, used, tried, result.is_ok()))
            .await;
        result
    }

    // =========================================================================
    // Background loop
    // =========================================================================

    /// Ping guardians and audit a sample every `check_interval` until
    /// `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.config.check_interval, "Guardian vault loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Guardian vault loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.check_guardian_health().await;
                    self.audit_random_shards().await;
                }
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn send(&self, guardian_id: &str, shard: &Shard) -> Result<String> {
        match timeout(self.config.transfer_timeout, self.network.send_shard(guardian_id, shard)).await {
            Ok(Ok(receipt)) if receipt.success => receipt.storage_id.ok_or_else(|| Error::Provider {
                provider_id: guardian_id.to_string(),
                reason: "accepted write without a storage id".into(),
            }),
            Ok(Ok(_)) => Err(Error::Provider {
                provider_id: guardian_id.to_string(),
                reason: "write rejected".into(),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Provider {
                provider_id: guardian_id.to_string(),
                reason: "upload timed out".into(),
            }),
        }
    }

    fn update_replica(&self, file_id: &str, index: u8, guardian_id: &str, apply: impl FnOnce(&mut VaultReplica)) {
        if let Some(mut file) = self.files.get_mut(file_id) {
            if let Some(replica) = file
                .shards
                .get_mut(&index)
                .and_then(|r| r.replica_mut(guardian_id))
            {
                apply(replica);
            }
        }
    }

    async fn persist(&self, file: &VaultFile) -> Result<()> {
        self.state.put(namespaces::VAULT_RECORDS, &file.file_id, file).await
    }

    async fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish vault event");
        }
    }

    async fn emit_all(&self, events: Vec<DomainEvent>) {
        if events.is_empty() {
            return;
        }
        if let Err(e) = self.events.publish_all(events).await {
            warn!(error = %e, "Failed to publish vault events");
        }
    }
}
