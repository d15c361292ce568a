//! Redundancy Monitor
//!
//! Periodically probes the providers holding each registered file's shards,
//! classifies the file's health and hands degraded files to the repair
//! engine. Files are checked concurrently; a slow provider only delays the
//! files it holds.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::FileManifest;
use crate::config::duration_serde;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{namespaces, EventPublisher, ProviderNetwork, StateStore};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;

use super::health::{HealthRecord, HealthStatus, HealthThresholds};
use super::repair::{RepairEngine, RepairPriority, RepairStatus};

/// Configuration for the redundancy monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval between full health sweeps
    #[serde(with = "duration_serde")]
    pub check_interval: Duration,

    /// Timeout for a single provider probe
    #[serde(with = "duration_serde")]
    pub probe_timeout: Duration,

    pub thresholds: HealthThresholds,

    /// Schedule repairs for degraded and critical files
    pub auto_repair: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            thresholds: HealthThresholds::default(),
            auto_repair: true,
        }
    }
}

/// Tracks the health of registered files
pub struct RedundancyMonitor {
    config: MonitorConfig,
    network: Arc<dyn ProviderNetwork>,
    state: StateStore,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<EngineMetrics>,
    repair: Arc<RepairEngine>,

    /// Registered files and their latest record
    records: DashMap<String, Option<HealthRecord>>,
}

impl std::fmt::Debug for RedundancyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedundancyMonitor")
            .field("config", &self.config)
            .field("files", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl RedundancyMonitor {
    pub fn new(
        config: MonitorConfig,
        network: Arc<dyn ProviderNetwork>,
        state: StateStore,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<EngineMetrics>,
        repair: Arc<RepairEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            network,
            state,
            events,
            metrics,
            repair,
            records: DashMap::new(),
        })
    }

    pub fn repair_engine(&self) -> &Arc<RepairEngine> {
        &self.repair
    }

    /// Start monitoring a file. Persists its manifest.
    #[instrument(skip(self, manifest), fields(file_id = %manifest.file_id))]
    pub async fn register_file(&self, manifest: &FileManifest) -> Result<()> {
        manifest.validate()?;
        self.state
            .put(namespaces::MANIFESTS, &manifest.file_id, manifest)
            .await?;
        self.records.entry(manifest.file_id.clone()).or_insert(None);
        info!(
            threshold = manifest.threshold,
            total = manifest.total,
            placed = manifest.locations.len(),
            "Registered file for monitoring"
        );
        Ok(())
    }

    /// Stop monitoring a file, cancel its repair and drop its manifest.
    /// Returns false if the file was not registered.
    #[instrument(skip(self))]
    pub async fn unregister_file(&self, file_id: &str) -> Result<bool> {
        let Some((_, record)) = self.records.remove(file_id) else {
            return Ok(false);
        };
        self.metrics
            .record_health_transition(record.map(|r| r.status), None);

        if let Some(job) = self.repair.job_for_file(file_id) {
            self.repair.cancel(job.id).await?;
        }
        self.state.remove(namespaces::MANIFESTS, file_id).await?;
        info!("Unregistered file");
        Ok(true)
    }

    pub fn is_registered(&self, file_id: &str) -> bool {
        self.records.contains_key(file_id)
    }

    /// Latest health record of a file, if it has been checked.
    pub fn health(&self, file_id: &str) -> Option<HealthRecord> {
        self.records.get(file_id).and_then(|r| r.value().clone())
    }

    pub fn monitored_files(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Probe a file's providers, classify it and act on the result.
    #[instrument(skip(self))]
    pub async fn check_file(&self, file_id: &str) -> Result<HealthRecord> {
        if !self.is_registered(file_id) {
            return Err(Error::FileNotFound(file_id.to_string()));
        }
        let manifest: FileManifest = self
            .state
            .get(namespaces::MANIFESTS, file_id)
            .await?
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))?;

        let reachable = self.probe_providers(&manifest).await;
        let failed_nodes: BTreeSet<String> = reachable
            .iter()
            .filter_map(|(id, up)| (!up).then(|| id.clone()))
            .collect();
        let missing: Vec<u8> = manifest
            .indices()
            .filter(|i| match manifest.location(*i) {
                Some(loc) => failed_nodes.contains(&loc.provider_id),
                None => true,
            })
            .collect();

        let record = HealthRecord::evaluate(
            file_id,
            manifest.threshold(),
            manifest.total(),
            missing,
            failed_nodes,
            &self.config.thresholds,
        );

        let previous = match self.records.get_mut(file_id) {
            Some(mut slot) => slot.value_mut().replace(record.clone()).map(|r| r.status),
            // Unregistered while probing
            None => return Ok(record),
        };

        if previous != Some(record.status) {
            self.on_transition(previous, &record).await;
        }

        if record.status.needs_repair() && self.config.auto_repair {
            let priority = match record.status {
                HealthStatus::Critical => RepairPriority::Emergency,
                _ => RepairPriority::Normal,
            };
            self.repair.schedule_repair(
                file_id,
                priority,
                record.missing_indices.clone(),
                record.failed_nodes.clone(),
            );
        }

        Ok(record)
    }

    /// Check every registered file concurrently.
    pub async fn check_all(&self) -> Vec<HealthRecord> {
        let files = self.monitored_files();
        let results = join_all(files.iter().map(|id| self.check_file(id))).await;

        files
            .iter()
            .zip(results)
            .filter_map(|(id, result)| match result {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(file_id = %id, error = %e, "Health check failed");
                    None
                }
            })
            .collect()
    }

    /// Run the monitoring loop until `shutdown` is cancelled.
    ///
    /// Besides the periodic sweep, a file is re-checked as soon as a repair
    /// for it finishes.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut notices = self.repair.subscribe();

        info!(interval = ?self.config.check_interval, "Redundancy monitor started");

        loop {
            let notice = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Redundancy monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let records = self.check_all().await;
                    debug!(files = records.len(), "Health sweep complete");
                    continue;
                }
                notice = notices.recv() => notice,
            };

            match notice {
                Ok(notice) if notice.status == RepairStatus::Completed => {
                    if self.is_registered(&notice.file_id) {
                        if let Err(e) = self.check_file(&notice.file_id).await {
                            warn!(file_id = %notice.file_id, error = %e, "Post-repair check failed");
                        }
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed repair notices");
                }
                Err(RecvError::Closed) => {
                    debug!("Repair notice channel closed");
                    notices = self.repair.subscribe();
                }
            }
        }
    }

    async fn probe_providers(&self, manifest: &FileManifest) -> HashMap<String, bool> {
        let probes = manifest.providers().into_iter().map(|provider_id| async move {
            let up = match timeout(self.config.probe_timeout, self.network.probe(&provider_id)).await {
                Ok(Ok(up)) => up,
                Ok(Err(e)) => {
                    debug!(provider = %provider_id, error = %e, "Probe failed");
                    false
                }
                Err(_) => {
                    debug!(provider = %provider_id, "Probe timed out");
                    false
                }
            };
            (provider_id, up)
        });
        join_all(probes).await.into_iter().collect()
    }

    async fn on_transition(&self, previous: Option<HealthStatus>, record: &HealthRecord) {
        self.metrics
            .record_health_transition(previous, Some(record.status));

        match record.status {
            HealthStatus::Healthy => info!(
                file_id = %record.file_id,
                available = record.available_shards,
                "File is healthy"
            ),
            HealthStatus::Degraded | HealthStatus::Critical => warn!(
                file_id = %record.file_id,
                status = %record.status,
                available = record.available_shards,
                total = record.total_shards,
                "File lost redundancy"
            ),
            HealthStatus::Failed => error!(
                file_id = %record.file_id,
                available = record.available_shards,
                required = record.threshold,
                "File below threshold, escalating"
            ),
        }

        let mut events = vec![DomainEvent::health_changed(
            record.file_id.clone(),
            previous,
            record.status,
            record.available_shards,
            record.total_shards,
            record.health_score,
        )];
        if record.status == HealthStatus::Failed {
            events.push(DomainEvent::redundancy_escalated(
                record.file_id.clone(),
                record.available_shards,
                record.threshold,
            ));
        }
        if let Err(e) = self.events.publish_all(events).await {
            warn!(error = %e, "Failed to publish health events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, InMemoryKeyResolver, InMemoryProviderNetwork, InMemoryStore};
    use crate::codec::{CodingParams, FileContext, MasterKey, ShardCodec, ShardLocation};
    use crate::monitor::RepairConfig;
    use assert_matches::assert_matches;

    struct Fixture {
        monitor: Arc<RedundancyMonitor>,
        network: Arc<InMemoryProviderNetwork>,
        events: Arc<InMemoryEventCollector>,
        metrics: Arc<EngineMetrics>,
        manifest: FileManifest,
    }

    async fn fixture(providers: usize, auto_repair: bool) -> Fixture {
        let network = Arc::new(InMemoryProviderNetwork::with_providers(providers, &["eu", "us"]));
        let state = StateStore::new(Arc::new(InMemoryStore::new()));
        let key = MasterKey::generate();
        let events = Arc::new(InMemoryEventCollector::new());
        let metrics = Arc::new(EngineMetrics::new().unwrap());

        let repair = RepairEngine::new(
            RepairConfig::default(),
            network.clone(),
            state.clone(),
            Arc::new(InMemoryKeyResolver::with_fallback(key.clone())),
            events.clone(),
            metrics.clone(),
        );
        let config = MonitorConfig {
            auto_repair,
            ..Default::default()
        };
        let monitor = RedundancyMonitor::new(config, network.clone(), state, events.clone(), metrics.clone(), repair);

        // K = 3, N = 10 on node-1..node-10
        let encoded = ShardCodec::new()
            .encode(b"monitored", CodingParams::shamir(3, 10), &key, &FileContext::new("f1", "a.txt"))
            .unwrap();
        let mut manifest = encoded.manifest;
        for shard in &encoded.shards {
            let node = format!("node-{}", shard.index);
            let receipt = network.send_shard(&node, shard).await.unwrap();
            manifest.set_location(shard.index, ShardLocation::new(node, receipt.storage_id.unwrap()));
        }
        monitor.register_file(&manifest).await.unwrap();

        Fixture {
            monitor,
            network,
            events,
            metrics,
            manifest,
        }
    }

    fn take_offline(f: &Fixture, count: usize) {
        for i in 1..=count {
            f.network.set_online(&format!("node-{}", i), false);
        }
    }

    #[tokio::test]
    async fn test_healthy_file() {
        let f = fixture(10, false).await;
        let record = f.monitor.check_file("f1").await.unwrap();

        assert_eq!(record.status, HealthStatus::Healthy);
        assert_eq!(record.available_shards, 10);
        assert!(record.failed_nodes.is_empty());
        assert_eq!(f.monitor.health("f1").unwrap(), record);
        assert_eq!(f.metrics.files_with_health(HealthStatus::Healthy), 1);
        assert_eq!(f.events.count_of_type("HealthChanged"), 1);
    }

    #[tokio::test]
    async fn test_classification_follows_losses() {
        let f = fixture(10, false).await;

        take_offline(&f, 4);
        let record = f.monitor.check_file("f1").await.unwrap();
        assert_eq!(record.status, HealthStatus::Degraded);
        assert_eq!(record.missing_indices, vec![1, 2, 3, 4]);
        assert_eq!(record.failed_nodes.len(), 4);

        take_offline(&f, 6);
        assert_eq!(f.monitor.check_file("f1").await.unwrap().status, HealthStatus::Critical);

        take_offline(&f, 8);
        assert_eq!(f.monitor.check_file("f1").await.unwrap().status, HealthStatus::Failed);
        assert_eq!(f.events.count_of_type("RedundancyEscalated"), 1);
        assert_eq!(f.metrics.files_with_health(HealthStatus::Failed), 1);
        assert_eq!(f.metrics.files_with_health(HealthStatus::Degraded), 0);
    }

    #[tokio::test]
    async fn test_unchanged_status_publishes_once() {
        let f = fixture(10, false).await;
        f.monitor.check_file("f1").await.unwrap();
        f.monitor.check_file("f1").await.unwrap();
        assert_eq!(f.events.count_of_type("HealthChanged"), 1);
    }

    #[tokio::test]
    async fn test_unknown_file() {
        let f = fixture(10, false).await;
        assert_matches!(f.monitor.check_file("nope").await, Err(Error::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_unregister() {
        let f = fixture(10, false).await;
        f.monitor.check_file("f1").await.unwrap();

        assert!(f.monitor.unregister_file("f1").await.unwrap());
        assert!(!f.monitor.unregister_file("f1").await.unwrap());
        assert!(f.monitor.health("f1").is_none());
        assert_eq!(f.metrics.files_with_health(HealthStatus::Healthy), 0);
        assert!(f.monitor.monitored_files().is_empty());
    }

    #[tokio::test]
    async fn test_degraded_file_is_repaired() {
        let f = fixture(14, true).await;
        let mut notices = f.monitor.repair_engine().subscribe();

        take_offline(&f, 4);
        assert_eq!(f.monitor.check_file("f1").await.unwrap().status, HealthStatus::Degraded);

        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.status, RepairStatus::Completed);

        let record = f.monitor.check_file("f1").await.unwrap();
        assert_eq!(record.status, HealthStatus::Healthy);
        assert_eq!(record.available_shards, f.manifest.total());
    }
}
