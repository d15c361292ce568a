//! Repair Engine
//!
//! Restores lost redundancy of a file: gathers reachable shards, verifies
//! them by decoding, regenerates only the missing indices and uploads them
//! to fresh providers. Jobs run as spawned tasks bounded by a semaphore;
//! emergency jobs skip the bound.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::codec::{FileContext, FileManifest, Shard, ShardCodec, ShardLocation};
use crate::config::duration_serde;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{
    namespaces, EventPublisher, KeyResolver, ProviderNetwork, ProviderRequirements, StateStore,
};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the repair engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Maximum concurrent normal-priority repairs
    pub max_concurrent: usize,

    /// Attempts per job before giving up on transient failures
    pub max_attempts: u32,

    /// Fixed delay between attempts
    #[serde(with = "duration_serde")]
    pub retry_delay: Duration,

    /// Timeout for fetching a single shard
    #[serde(with = "duration_serde")]
    pub fetch_timeout: Duration,

    /// Timeout for uploading a single shard
    #[serde(with = "duration_serde")]
    pub upload_timeout: Duration,

    /// How long finished jobs stay inspectable
    #[serde(with = "duration_serde")]
    pub completed_retention: Duration,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(60),
            completed_retention: Duration::from_secs(3600),
        }
    }
}

impl RepairConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Config("repair.max_concurrent must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("repair.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Repair Job
// =============================================================================

/// Urgency of a repair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairPriority {
    /// Degraded file; waits for a concurrency slot
    Normal,
    /// Critical file; bypasses the concurrency cap
    Emergency,
}

impl std::fmt::Display for RepairPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepairPriority::Normal => write!(f, "normal"),
            RepairPriority::Emergency => write!(f, "emergency"),
        }
    }
}

/// Status of a repair job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RepairStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RepairStatus::Completed | RepairStatus::Failed | RepairStatus::Cancelled
        )
    }

    fn outcome_label(&self) -> &'static str {
        match self {
            RepairStatus::Completed => "completed",
            RepairStatus::Failed => "failed",
            RepairStatus::Cancelled => "cancelled",
            RepairStatus::Pending | RepairStatus::InProgress => "active",
        }
    }
}

impl std::fmt::Display for RepairStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RepairStatus::Pending => "pending",
            RepairStatus::InProgress => "in_progress",
            other => other.outcome_label(),
        };
        f.write_str(s)
    }
}

/// A unit of repair work for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairJob {
    pub id: Uuid,
    pub file_id: String,
    pub priority: RepairPriority,
    pub status: RepairStatus,

    /// Attempts started so far
    pub attempts: u32,

    /// 0-100
    pub progress: u8,

    /// Indices found missing or corrupt in the latest attempt
    pub missing_indices: Vec<u8>,

    /// Providers known to be unreachable
    pub failed_nodes: BTreeSet<String>,

    /// Placements made by this job
    pub new_assignments: BTreeMap<u8, ShardLocation>,

    /// Missing shards left unplaced after a partial repair
    pub remaining_missing: usize,

    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Set once the manifest update begins; past this point cancel is refused
    #[serde(skip)]
    committing: bool,
}

impl RepairJob {
    fn new(file_id: String, priority: RepairPriority, missing: Vec<u8>, failed_nodes: BTreeSet<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_id,
            priority,
            status: RepairStatus::Pending,
            attempts: 0,
            progress: 0,
            missing_indices: missing,
            failed_nodes,
            new_assignments: BTreeMap::new(),
            remaining_missing: 0,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            committing: false,
        }
    }
}

/// Broadcast when a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairNotice {
    pub job_id: Uuid,
    pub file_id: String,
    pub status: RepairStatus,
}

/// Signals from the engine to the task driving one job.
#[derive(Debug, Clone, Default)]
struct JobHandle {
    cancel: CancellationToken,
    /// Fired when a queued normal job is raised to emergency
    escalate: Arc<Notify>,
}

/// What one successful attempt achieved.
#[derive(Debug, Default)]
struct AttemptOutcome {
    missing: Vec<u8>,
    placed: BTreeMap<u8, ShardLocation>,
}

impl AttemptOutcome {
    fn remaining(&self) -> usize {
        self.missing.len().saturating_sub(self.placed.len())
    }
}

// =============================================================================
// Repair Engine
// =============================================================================

/// Engine that runs repair jobs against the provider network
pub struct RepairEngine {
    config: RepairConfig,
    codec: ShardCodec,
    network: Arc<dyn ProviderNetwork>,
    state: StateStore,
    keys: Arc<dyn KeyResolver>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<EngineMetrics>,

    /// All known jobs, active and recently finished
    jobs: DashMap<Uuid, RepairJob>,

    /// Active job per file
    by_file: DashMap<String, Uuid>,

    /// Signals per active job
    handles: DashMap<Uuid, JobHandle>,

    /// Bounds concurrent normal-priority jobs
    semaphore: Arc<Semaphore>,

    notices: broadcast::Sender<RepairNotice>,
}

impl std::fmt::Debug for RepairEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairEngine")
            .field("config", &self.config)
            .field("jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

impl RepairEngine {
    /// Create a new repair engine
    pub fn new(
        config: RepairConfig,
        network: Arc<dyn ProviderNetwork>,
        state: StateStore,
        keys: Arc<dyn KeyResolver>,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        let (notices, _) = broadcast::channel(256);

        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            codec: ShardCodec::new(),
            network,
            state,
            keys,
            events,
            metrics,
            jobs: DashMap::new(),
            by_file: DashMap::new(),
            handles: DashMap::new(),
            notices,
        })
    }

    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    /// Receive a notice whenever a job finishes.
    pub fn subscribe(&self) -> broadcast::Receiver<RepairNotice> {
        self.notices.subscribe()
    }

    /// Queue a repair and run it in the background.
    ///
    /// Returns the id of the already active job if the file has one.
    #[instrument(skip(self, missing, failed_nodes), fields(missing_count = missing.len()))]
    pub fn schedule_repair(
        self: &Arc<Self>,
        file_id: &str,
        priority: RepairPriority,
        missing: Vec<u8>,
        failed_nodes: BTreeSet<String>,
    ) -> Uuid {
        self.prune_finished();

        let (job_id, created) = self.register_job(file_id, priority, missing, failed_nodes);
        if created {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = engine.drive(job_id).await {
                    debug!(%job_id, error = %e, "Background repair ended without success");
                }
            });
        }
        job_id
    }

    /// Run a repair to completion on the current task.
    ///
    /// Fails with the job's error: non-transient errors as raised,
    /// `RepairFailed` after exhausted retries, `JobCancelled` on cancel.
    pub async fn repair_now(
        &self,
        file_id: &str,
        priority: RepairPriority,
        missing: Vec<u8>,
        failed_nodes: BTreeSet<String>,
    ) -> Result<RepairJob> {
        let (job_id, created) = self.register_job(file_id, priority, missing, failed_nodes);
        if !created {
            return Err(Error::Internal(format!(
                "file {} already has active repair job {}",
                file_id, job_id
            )));
        }
        self.drive(job_id).await
    }

    /// Cancel a job. The job leaves the active set immediately; uploads
    /// already in flight are abandoned and the manifest is not touched.
    ///
    /// A job already writing its manifest runs to completion; cancelling it
    /// then is a no-op.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        if !self.jobs.contains_key(&job_id) {
            return Err(Error::JobNotFound(job_id.to_string()));
        }

        if let Some(file_id) = self.mark_cancelled(job_id) {
            if let Some((_, handle)) = self.handles.remove(&job_id) {
                handle.cancel.cancel();
            }
            info!(%job_id, %file_id, "Repair job cancelled");
            self.emit(DomainEvent::repair_cancelled(job_id, file_id.clone())).await;
            self.notify(job_id, file_id, RepairStatus::Cancelled);
        }
        Ok(())
    }

    pub fn job(&self, job_id: Uuid) -> Option<RepairJob> {
        self.jobs.get(&job_id).map(|j| j.value().clone())
    }

    /// Active job for a file, if any.
    pub fn job_for_file(&self, file_id: &str) -> Option<RepairJob> {
        let job_id = *self.by_file.get(file_id)?;
        self.job(job_id)
    }

    /// Jobs not yet in a terminal state.
    pub fn active_jobs(&self) -> Vec<RepairJob> {
        let mut active: Vec<RepairJob> = self
            .jobs
            .iter()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.value().clone())
            .collect();
        active.sort_by_key(|j| j.created_at);
        active
    }

    /// Drop finished jobs older than the retention window.
    pub fn prune_finished(&self) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.config.completed_retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.finished_at.is_some_and(|t| t < cutoff))
        });
        before - self.jobs.len()
    }

    // =========================================================================
    // Job lifecycle
    // =========================================================================

    fn register_job(
        &self,
        file_id: &str,
        priority: RepairPriority,
        missing: Vec<u8>,
        failed_nodes: BTreeSet<String>,
    ) -> (Uuid, bool) {
        use dashmap::mapref::entry::Entry;

        match self.by_file.entry(file_id.to_string()) {
            Entry::Occupied(existing) => {
                let job_id = *existing.get();
                if priority == RepairPriority::Emergency {
                    self.escalate(job_id);
                }
                debug!(%job_id, file_id, "Repair already active for file");
                (job_id, false)
            }
            Entry::Vacant(slot) => {
                let job = RepairJob::new(file_id.to_string(), priority, missing, failed_nodes);
                let job_id = job.id;
                self.handles.insert(job_id, JobHandle::default());
                self.jobs.insert(job_id, job);
                slot.insert(job_id);
                info!(%job_id, file_id, %priority, "Repair job registered");
                (job_id, true)
            }
        }
    }

    /// Raise a queued normal job to emergency so it stops waiting for a slot.
    fn escalate(&self, job_id: Uuid) {
        let Some(mut job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if job.priority == RepairPriority::Emergency || job.status.is_terminal() {
            return;
        }
        job.priority = RepairPriority::Emergency;
        let file_id = job.file_id.clone();
        drop(job);

        if let Some(handle) = self.handles.get(&job_id) {
            handle.escalate.notify_one();
        }
        info!(%job_id, %file_id, "Repair job escalated to emergency");
    }

    async fn drive(&self, job_id: Uuid) -> Result<RepairJob> {
        // Cancelled before the task got to run
        let Some(handle) = self.handles.get(&job_id).map(|h| h.value().clone()) else {
            return Err(Error::JobCancelled(job_id.to_string()));
        };
        let token = handle.cancel;
        let (file_id, priority) = self
            .job(job_id)
            .map(|j| (j.file_id, j.priority))
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        let _permit: Option<OwnedSemaphorePermit> = match priority {
            RepairPriority::Emergency => None,
            RepairPriority::Normal => tokio::select! {
                _ = token.cancelled() => return self.finish_cancelled(job_id).await,
                _ = handle.escalate.notified() => None,
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    Some(permit.map_err(|_| Error::Internal("repair semaphore closed".into()))?)
                }
            },
        };

        let started = Instant::now();
        loop {
            let attempt = self.begin_attempt(job_id)?;
            let (missing, priority) = self
                .job(job_id)
                .map(|j| (j.missing_indices, j.priority))
                .unwrap_or((Vec::new(), priority));
            self.emit(DomainEvent::repair_started(job_id, file_id.clone(), priority, missing, attempt))
                .await;

            // Only the prepare phase races cancellation; the commit below does not
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                r = self.prepare(job_id, &file_id) => Some(r),
            };
            let result = match result {
                Some(Ok(outcome)) => Some(self.commit_outcome(job_id, &file_id, outcome).await),
                other => other,
            };

            match result {
                None => return self.finish_cancelled(job_id).await,
                Some(Ok(outcome)) => return self.finish_completed(job_id, outcome, started).await,
                Some(Err(Error::JobCancelled(_))) => return self.finish_cancelled(job_id).await,
                Some(Err(e)) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!(%job_id, %file_id, attempt, error = %e, "Repair attempt failed, retrying");
                    self.update(job_id, |j| j.last_error = Some(e.to_string()));
                    tokio::select! {
                        _ = token.cancelled() => return self.finish_cancelled(job_id).await,
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
                Some(Err(e)) => return self.finish_failed(job_id, e, attempt, started).await,
            }
        }
    }

    fn begin_attempt(&self, job_id: Uuid) -> Result<u32> {
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        if job.status == RepairStatus::Cancelled {
            return Err(Error::JobCancelled(job_id.to_string()));
        }
        job.status = RepairStatus::InProgress;
        job.committing = false;
        job.attempts += 1;
        job.progress = 0;
        job.started_at.get_or_insert_with(Utc::now);
        Ok(job.attempts)
    }

    async fn finish_completed(&self, job_id: Uuid, outcome: AttemptOutcome, started: Instant) -> Result<RepairJob> {
        let Some(job) = self.finish(job_id, RepairStatus::Completed, |j| {
            j.progress = 100;
            j.missing_indices = outcome.missing.clone();
            j.new_assignments = outcome.placed.clone();
            j.remaining_missing = outcome.remaining();
        }) else {
            return Err(Error::JobCancelled(job_id.to_string()));
        };

        let elapsed = started.elapsed();
        info!(
            %job_id,
            file_id = %job.file_id,
            repaired = outcome.placed.len(),
            remaining = job.remaining_missing,
            "Repair job completed"
        );
        self.metrics.record_repair("completed", elapsed);
        self.emit(DomainEvent::repair_completed(
            job_id,
            job.file_id.clone(),
            outcome.placed.keys().copied().collect(),
            job.remaining_missing,
            elapsed,
        ))
        .await;
        self.notify(job_id, job.file_id.clone(), RepairStatus::Completed);
        Ok(job)
    }

    async fn finish_failed(&self, job_id: Uuid, err: Error, attempts: u32, started: Instant) -> Result<RepairJob> {
        let reason = err.to_string();
        let Some(job) = self.finish(job_id, RepairStatus::Failed, |j| j.last_error = Some(reason.clone())) else {
            return Err(Error::JobCancelled(job_id.to_string()));
        };

        error!(%job_id, file_id = %job.file_id, attempts, error = %reason, "Repair job failed");
        self.metrics.record_repair("failed", started.elapsed());
        self.emit(DomainEvent::repair_failed(job_id, job.file_id.clone(), attempts, reason.clone()))
            .await;
        self.notify(job_id, job.file_id.clone(), RepairStatus::Failed);

        if err.is_transient() {
            Err(Error::RepairFailed {
                file_id: job.file_id,
                attempts,
                reason,
            })
        } else {
            Err(err)
        }
    }

    async fn finish_cancelled(&self, job_id: Uuid) -> Result<RepairJob> {
        self.handles.remove(&job_id);
        if let Some(file_id) = self.mark_cancelled(job_id) {
            info!(%job_id, %file_id, "Repair job cancelled");
            self.emit(DomainEvent::repair_cancelled(job_id, file_id.clone())).await;
            self.notify(job_id, file_id, RepairStatus::Cancelled);
        }
        Err(Error::JobCancelled(job_id.to_string()))
    }

    /// Move a job to a terminal status unless it was already cancelled.
    fn finish(&self, job_id: Uuid, status: RepairStatus, apply: impl FnOnce(&mut RepairJob)) -> Option<RepairJob> {
        self.handles.remove(&job_id);
        let mut job = self.jobs.get_mut(&job_id)?;
        if job.status == RepairStatus::Cancelled {
            return None;
        }
        apply(&mut *job);
        job.status = status;
        job.finished_at = Some(Utc::now());
        let snapshot = job.clone();
        drop(job);

        self.by_file.remove_if(&snapshot.file_id, |_, id| *id == job_id);
        Some(snapshot)
    }

    /// Returns the file id if the job transitioned to cancelled.
    fn mark_cancelled(&self, job_id: Uuid) -> Option<String> {
        let mut job = self.jobs.get_mut(&job_id)?;
        if job.status.is_terminal() || job.committing {
            return None;
        }
        job.status = RepairStatus::Cancelled;
        job.finished_at = Some(Utc::now());
        let file_id = job.file_id.clone();
        drop(job);

        self.by_file.remove_if(&file_id, |_, id| *id == job_id);
        self.metrics.record_repair("cancelled", Duration::ZERO);
        Some(file_id)
    }

    /// Claim the commit phase. False if the job was cancelled first.
    fn begin_commit(&self, job_id: Uuid) -> bool {
        let Some(mut job) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        if job.status.is_terminal() {
            return false;
        }
        job.committing = true;
        job.progress = 90;
        true
    }

    fn update(&self, job_id: Uuid, apply: impl FnOnce(&mut RepairJob)) {
        if let Some(mut job) = self.jobs.get_mut(&job_id) {
            apply(&mut *job);
        }
    }

    fn notify(&self, job_id: Uuid, file_id: String, status: RepairStatus) {
        // No receivers is fine
        let _ = self.notices.send(RepairNotice { job_id, file_id, status });
    }

    async fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish repair event");
        }
    }

    // =========================================================================
    // Repair attempt
    // =========================================================================

    /// Gather, regenerate and upload. Leaves the manifest untouched.
    #[instrument(skip(self, job_id))]
    async fn prepare(&self, job_id: Uuid, file_id: &str) -> Result<AttemptOutcome> {
        let manifest: FileManifest = self
            .state
            .get(namespaces::MANIFESTS, file_id)
            .await?
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))?;
        manifest.validate()?;

        let failed_nodes = self.job(job_id).map(|j| j.failed_nodes).unwrap_or_default();

        // Gather
        let (survivors, unreachable) = self.gather(&manifest, &failed_nodes).await;
        let required = manifest.threshold();
        if survivors.len() < required {
            return Err(Error::IrrecoverableFile {
                file_id: file_id.to_string(),
                available: survivors.len(),
                required,
            });
        }

        let present: HashSet<u8> = survivors.iter().map(|s| s.index).collect();
        let missing: Vec<u8> = manifest.indices().filter(|i| !present.contains(i)).collect();
        self.update(job_id, |j| {
            j.missing_indices = missing.clone();
            j.failed_nodes.extend(unreachable.iter().cloned());
            j.progress = 25;
        });

        if missing.is_empty() {
            debug!("Nothing to repair");
            return Ok(AttemptOutcome::default());
        }

        // Verify and regenerate
        let key = self.keys.master_key(&manifest).await?;
        let regenerated = {
            let codec = self.codec;
            let manifest = manifest.clone();
            let missing = missing.clone();
            tokio::task::spawn_blocking(move || -> Result<Vec<Shard>> {
                let context = FileContext::new(manifest.file_id.clone(), manifest.file_name.clone());
                let decoded = codec.decode_detailed(&survivors, &manifest, &key, &context)?;
                let valid: Vec<Shard> = survivors
                    .into_iter()
                    .filter(|s| decoded.valid_indices.contains(&s.index))
                    .collect();
                codec.regenerate(&valid, &manifest, &missing)
            })
            .await
            .map_err(|e| Error::Internal(format!("repair worker panicked: {}", e)))??
        };
        self.update(job_id, |j| j.progress = 50);

        // Place
        let mut excluded: HashSet<String> = failed_nodes.into_iter().collect();
        excluded.extend(unreachable);
        excluded.extend(manifest.providers());

        let largest = regenerated.iter().map(|s| s.size as u64).max().unwrap_or(0);
        let requirements = ProviderRequirements::new()
            .with_min_free_bytes(largest)
            .excluding(excluded);
        let candidates = self
            .network
            .find_candidate_providers(regenerated.len(), &requirements)
            .await?;
        if candidates.is_empty() {
            return Err(Error::Placement(format!(
                "no eligible providers for {} shards of {}",
                regenerated.len(),
                file_id
            )));
        }

        let uploads = regenerated
            .iter()
            .zip(candidates.iter())
            .map(|(shard, provider)| self.upload(shard, &provider.id));
        let placed: BTreeMap<u8, ShardLocation> = join_all(uploads).await.into_iter().flatten().collect();

        if placed.is_empty() {
            return Err(Error::Placement(format!("no repaired shard of {} was accepted", file_id)));
        }
        self.update(job_id, |j| j.progress = 75);

        Ok(AttemptOutcome { missing, placed })
    }

    /// Record placed shards on the manifest. Runs to the end once claimed.
    async fn commit_outcome(&self, job_id: Uuid, file_id: &str, outcome: AttemptOutcome) -> Result<AttemptOutcome> {
        if outcome.placed.is_empty() {
            return Ok(outcome);
        }
        if !self.begin_commit(job_id) {
            return Err(Error::JobCancelled(job_id.to_string()));
        }
        if let Err(e) = self.commit(file_id, &outcome.placed).await {
            self.update(job_id, |j| j.committing = false);
            return Err(e);
        }

        self.metrics.record_shards_stored(outcome.placed.len());
        for (index, location) in &outcome.placed {
            self.emit(DomainEvent::shard_stored(
                file_id,
                *index,
                location.provider_id.clone(),
                location.storage_id.clone(),
            ))
            .await;
        }
        Ok(outcome)
    }

    /// Fetch every located shard not on a known-failed node. Returns the
    /// shards matching their manifest hash and the providers that did not answer.
    async fn gather(&self, manifest: &FileManifest, failed_nodes: &BTreeSet<String>) -> (Vec<Shard>, BTreeSet<String>) {
        let fetches = manifest
            .locations
            .iter()
            .filter(|(_, loc)| !failed_nodes.contains(&loc.provider_id))
            .map(|(&index, loc)| async move {
                let result = timeout(
                    self.config.fetch_timeout,
                    self.network.fetch_shard(&loc.provider_id, &loc.storage_id),
                )
                .await;
                (index, loc.provider_id.clone(), result)
            });

        let mut survivors = Vec::new();
        let mut unreachable = BTreeSet::new();
        for (index, provider_id, result) in join_all(fetches).await {
            match result {
                Ok(Ok(shard)) => {
                    let intact = shard.index == index
                        && manifest.hash_for(index).is_some_and(|h| shard.matches(h));
                    if intact {
                        survivors.push(shard);
                    } else {
                        warn!(index, provider = %provider_id, "Fetched shard failed its hash check");
                    }
                }
                Ok(Err(e)) => {
                    debug!(index, provider = %provider_id, error = %e, "Shard fetch failed");
                    if matches!(e, Error::Provider { .. }) {
                        unreachable.insert(provider_id);
                    }
                }
                Err(_) => {
                    debug!(index, provider = %provider_id, "Shard fetch timed out");
                    unreachable.insert(provider_id);
                }
            }
        }
        (survivors, unreachable)
    }

    async fn upload(&self, shard: &Shard, provider_id: &str) -> Option<(u8, ShardLocation)> {
        match timeout(self.config.upload_timeout, self.network.send_shard(provider_id, shard)).await {
            Ok(Ok(receipt)) if receipt.success => match receipt.storage_id {
                Some(storage_id) => Some((shard.index, ShardLocation::new(provider_id, storage_id))),
                None => {
                    warn!(provider = %provider_id, "Provider accepted shard without a storage id");
                    None
                }
            },
            Ok(Ok(_)) => {
                warn!(index = shard.index, provider = %provider_id, "Provider rejected repaired shard");
                None
            }
            Ok(Err(e)) => {
                warn!(index = shard.index, provider = %provider_id, error = %e, "Upload failed");
                None
            }
            Err(_) => {
                warn!(index = shard.index, provider = %provider_id, "Upload timed out");
                None
            }
        }
    }

    /// Record new locations on the stored manifest and drop replaced copies.
    async fn commit(&self, file_id: &str, placed: &BTreeMap<u8, ShardLocation>) -> Result<()> {
        let mut manifest: FileManifest = self
            .state
            .get(namespaces::MANIFESTS, file_id)
            .await?
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))?;

        let mut replaced = Vec::new();
        for (&index, location) in placed {
            if let Some(old) = manifest.remove_location(index) {
                replaced.push(old);
            }
            manifest.set_location(index, location.clone());
        }
        self.state.put(namespaces::MANIFESTS, file_id, &manifest).await?;

        for old in replaced {
            if let Err(e) = self.network.delete_shard(&old.provider_id, &old.storage_id).await {
                debug!(provider = %old.provider_id, error = %e, "Could not delete replaced shard");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, InMemoryKeyResolver, InMemoryProviderNetwork, InMemoryStore};
    use crate::codec::{CodingParams, MasterKey};
    use assert_matches::assert_matches;

    struct Harness {
        engine: Arc<RepairEngine>,
        network: Arc<InMemoryProviderNetwork>,
        state: StateStore,
        events: Arc<InMemoryEventCollector>,
        metrics: Arc<EngineMetrics>,
    }

    fn harness(providers: usize, config: RepairConfig) -> (Harness, MasterKey) {
        let network = Arc::new(InMemoryProviderNetwork::with_providers(providers, &["eu", "us", "ap"]));
        let state = StateStore::new(Arc::new(InMemoryStore::new()));
        let key = MasterKey::generate();
        let keys = Arc::new(InMemoryKeyResolver::with_fallback(key.clone()));
        let events = Arc::new(InMemoryEventCollector::new());
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let engine = RepairEngine::new(
            config,
            network.clone(),
            state.clone(),
            keys,
            events.clone(),
            metrics.clone(),
        );
        (
            Harness {
                engine,
                network,
                state,
                events,
                metrics,
            },
            key,
        )
    }

    fn fast_config() -> RepairConfig {
        RepairConfig {
            retry_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// Encode a file and place shard i on node-i.
    async fn place_file(h: &Harness, key: &MasterKey, params: CodingParams) -> FileManifest {
        let context = FileContext::new("file-1", "report.pdf");
        let encoded = ShardCodec::new()
            .encode(b"quarterly numbers, do not lose", params, key, &context)
            .unwrap();
        let mut manifest = encoded.manifest;
        for shard in &encoded.shards {
            let provider = format!("node-{}", shard.index);
            let receipt = h.network.send_shard(&provider, shard).await.unwrap();
            manifest.set_location(shard.index, ShardLocation::new(provider, receipt.storage_id.unwrap()));
        }
        h.state.put(namespaces::MANIFESTS, "file-1", &manifest).await.unwrap();
        manifest
    }

    async fn stored_manifest(h: &Harness) -> FileManifest {
        h.state.get(namespaces::MANIFESTS, "file-1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_repair_replaces_lost_shards() {
        let (h, key) = harness(8, fast_config());
        place_file(&h, &key, CodingParams::shamir(3, 5)).await;
        h.network.set_online("node-2", false);
        h.network.set_online("node-4", false);

        let failed = BTreeSet::from(["node-2".to_string(), "node-4".to_string()]);
        let job = h
            .engine
            .repair_now("file-1", RepairPriority::Normal, vec![2, 4], failed)
            .await
            .unwrap();

        assert_eq!(job.status, RepairStatus::Completed);
        assert_eq!(job.missing_indices, vec![2, 4]);
        assert_eq!(job.new_assignments.len(), 2);
        assert_eq!(job.remaining_missing, 0);

        let manifest = stored_manifest(&h).await;
        assert_eq!(manifest.locations.len(), 5);
        for index in [2u8, 4] {
            let loc = manifest.location(index).unwrap();
            assert_ne!(loc.provider_id, "node-2");
            assert_ne!(loc.provider_id, "node-4");
            assert!(!["node-1", "node-3", "node-5"].contains(&loc.provider_id.as_str()));
        }

        assert_eq!(h.events.count_of_type("RepairCompleted"), 1);
        assert_eq!(h.metrics.repairs("completed"), 1);
        assert!(h.engine.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_repair_treats_corrupt_shard_as_missing() {
        let (h, key) = harness(6, fast_config());
        let manifest = place_file(&h, &key, CodingParams::erasure(3, 5)).await;
        let loc = manifest.location(1).unwrap();
        h.network.corrupt_shard(&loc.provider_id, &loc.storage_id);

        let job = h
            .engine
            .repair_now("file-1", RepairPriority::Normal, vec![], BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(job.missing_indices, vec![1]);
        assert_eq!(stored_manifest(&h).await.location(1).unwrap().provider_id, "node-6");
    }

    #[tokio::test]
    async fn test_irrecoverable_is_not_retried() {
        let (h, key) = harness(5, fast_config());
        place_file(&h, &key, CodingParams::shamir(3, 5)).await;
        for node in ["node-1", "node-2", "node-3"] {
            h.network.set_online(node, false);
        }

        let result = h
            .engine
            .repair_now("file-1", RepairPriority::Emergency, vec![], BTreeSet::new())
            .await;
        assert_matches!(result, Err(Error::IrrecoverableFile { available: 2, required: 3, .. }));
        assert_eq!(h.events.count_of_type("RepairStarted"), 1);
        assert_eq!(h.metrics.repairs("failed"), 1);
    }

    #[tokio::test]
    async fn test_placement_failure_retries_then_fails() {
        // Every spare node is gone, so placement keeps failing
        let (h, key) = harness(5, fast_config());
        place_file(&h, &key, CodingParams::shamir(2, 5)).await;
        h.network.set_online("node-5", false);

        let result = h
            .engine
            .repair_now("file-1", RepairPriority::Normal, vec![5], BTreeSet::new())
            .await;
        assert_matches!(result, Err(Error::RepairFailed { attempts: 3, .. }));
        assert_eq!(h.events.count_of_type("RepairStarted"), 3);
        assert_eq!(stored_manifest(&h).await.location(5).unwrap().provider_id, "node-5");
    }

    #[tokio::test]
    async fn test_partial_placement_completes() {
        let (h, key) = harness(6, fast_config());
        place_file(&h, &key, CodingParams::shamir(2, 5)).await;
        h.network.set_online("node-1", false);
        h.network.set_online("node-2", false);

        let job = h
            .engine
            .repair_now("file-1", RepairPriority::Normal, vec![], BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(job.status, RepairStatus::Completed);
        assert_eq!(job.new_assignments.len(), 1);
        assert_eq!(job.remaining_missing, 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let config = RepairConfig {
            max_concurrent: 1,
            ..fast_config()
        };
        let (h, key) = harness(6, config);
        place_file(&h, &key, CodingParams::shamir(3, 5)).await;

        // Hold the only slot so the job stays pending
        let _slot = Arc::clone(&h.engine.semaphore).acquire_owned().await.unwrap();
        let mut notices = h.engine.subscribe();
        let job_id = h
            .engine
            .schedule_repair("file-1", RepairPriority::Normal, vec![1], BTreeSet::new());
        assert_eq!(h.engine.job_for_file("file-1").unwrap().id, job_id);

        h.engine.cancel(job_id).await.unwrap();
        assert_eq!(h.engine.job(job_id).unwrap().status, RepairStatus::Cancelled);
        assert!(h.engine.active_jobs().is_empty());
        assert!(h.engine.job_for_file("file-1").is_none());

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.status, RepairStatus::Cancelled);
        assert_eq!(h.events.count_of_type("RepairCancelled"), 1);
        assert_eq!(stored_manifest(&h).await.version, 6);
    }

    #[tokio::test]
    async fn test_schedule_deduplicates_per_file() {
        let config = RepairConfig {
            max_concurrent: 1,
            ..fast_config()
        };
        let (h, key) = harness(6, config);
        place_file(&h, &key, CodingParams::shamir(3, 5)).await;

        let _slot = Arc::clone(&h.engine.semaphore).acquire_owned().await.unwrap();
        let first = h
            .engine
            .schedule_repair("file-1", RepairPriority::Normal, vec![1], BTreeSet::new());
        let second = h
            .engine
            .schedule_repair("file-1", RepairPriority::Normal, vec![1], BTreeSet::new());
        assert_eq!(first, second);
        assert_eq!(h.engine.active_jobs().len(), 1);

        h.engine.cancel(first).await.unwrap();
    }

    #[tokio::test]
    async fn test_emergency_request_escalates_queued_job() {
        let config = RepairConfig {
            max_concurrent: 1,
            ..fast_config()
        };
        let (h, key) = harness(6, config);
        place_file(&h, &key, CodingParams::shamir(3, 5)).await;
        h.network.set_online("node-1", false);

        // The slot stays held for the whole test
        let _slot = Arc::clone(&h.engine.semaphore).acquire_owned().await.unwrap();
        let mut notices = h.engine.subscribe();
        let queued = h
            .engine
            .schedule_repair("file-1", RepairPriority::Normal, vec![1], BTreeSet::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.engine.job(queued).unwrap().status, RepairStatus::Pending);

        let escalated = h
            .engine
            .schedule_repair("file-1", RepairPriority::Emergency, vec![1], BTreeSet::new());
        assert_eq!(escalated, queued);
        assert_eq!(h.engine.job(queued).unwrap().priority, RepairPriority::Emergency);

        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .expect("escalated job stayed queued")
            .unwrap();
        assert_eq!(notice.job_id, queued);
        assert_eq!(notice.status, RepairStatus::Completed);
        assert_eq!(stored_manifest(&h).await.location(1).unwrap().provider_id, "node-6");
    }

    #[tokio::test]
    async fn test_cancel_refused_once_commit_begins() {
        let config = RepairConfig {
            max_concurrent: 1,
            ..fast_config()
        };
        let (h, key) = harness(6, config);
        place_file(&h, &key, CodingParams::shamir(3, 5)).await;

        let _slot = Arc::clone(&h.engine.semaphore).acquire_owned().await.unwrap();
        let job_id = h
            .engine
            .schedule_repair("file-1", RepairPriority::Normal, vec![1], BTreeSet::new());

        assert!(h.engine.begin_commit(job_id));
        h.engine.cancel(job_id).await.unwrap();
        assert_ne!(h.engine.job(job_id).unwrap().status, RepairStatus::Cancelled);
        assert!(h.engine.handles.get(&job_id).is_some_and(|handle| !handle.cancel.is_cancelled()));
        assert_eq!(h.events.count_of_type("RepairCancelled"), 0);

        // A failed commit hands cancellation back
        h.engine.update(job_id, |j| j.committing = false);
        h.engine.cancel(job_id).await.unwrap();
        assert_eq!(h.engine.job(job_id).unwrap().status, RepairStatus::Cancelled);
        assert!(!h.engine.begin_commit(job_id));
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let (h, _) = harness(1, fast_config());
        assert_matches!(h.engine.cancel(Uuid::new_v4()).await, Err(Error::JobNotFound(_)));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(RepairStatus::InProgress.to_string(), "in_progress");
        assert_eq!(RepairStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(RepairPriority::Emergency.to_string(), "emergency");
        assert!(RepairStatus::Failed.is_terminal());
        assert!(!RepairStatus::Pending.is_terminal());
    }
}
