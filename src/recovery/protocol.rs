//! Guardian Recovery Protocol
//!
//! Distributes shares of a user's root key to guardians and reconstructs it
//! once enough guardians approve a recovery.
//!
//! Configurations are cached in memory and written through to the state
//! store. Each session sits behind its own mutex, so approvals for
//! different sessions never contend and concurrent approvals for one
//! session are serialized. No lock is held across an `.await`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::codec::crypto::sha256_hex;
use crate::config::duration_serde;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{namespaces, EventPublisher, StateStore};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::sss::{self, Share};

use super::guardian::{GuardianApproval, GuardianAssignment, GuardianIdentity};
use super::session::{ApprovalOutcome, DeviceInfo, GuardianSnapshot, RecoverySession, RecoveryStatus};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// How long a session accepts approvals
    #[serde(with = "duration_serde")]
    pub session_ttl: Duration,

    /// Upper bound on guardians per user
    pub max_guardians: usize,

    /// Interval of the stale-session sweep
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    /// How long finished sessions stay in memory; the stored copy is kept
    #[serde(with = "duration_serde")]
    pub session_retention: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(72 * 3600),
            max_guardians: 10,
            sweep_interval: Duration::from_secs(300),
            session_retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_guardians == 0 || self.max_guardians > sss::MAX_SHARES {
            return Err(Error::Config(format!(
                "recovery.max_guardians must be between 1 and {}",
                sss::MAX_SHARES
            )));
        }
        if self.session_ttl.is_zero() {
            return Err(Error::Config("recovery.session_ttl must be positive".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Guardian configuration
// =============================================================================

/// One guardian within a user's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianEntry {
    pub identity: GuardianIdentity,
    pub assignment: GuardianAssignment,
}

/// A user's guardian set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianConfig {
    pub user_id: String,
    /// K': approvals required to recover
    pub threshold: u8,
    /// Bumped on every change of the guardian set
    pub version: u32,
    /// SHA-256 of the root key, used to check redistribution requests
    pub root_key_digest: String,
    /// Active and revoked guardians
    pub guardians: BTreeMap<String, GuardianEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GuardianConfig {
    pub fn threshold(&self) -> usize {
        self.threshold as usize
    }

    pub fn active(&self) -> impl Iterator<Item = &GuardianEntry> {
        self.guardians.values().filter(|g| g.assignment.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub fn is_active(&self, guardian_id: &str) -> bool {
        self.guardians
            .get(guardian_id)
            .is_some_and(|g| g.assignment.is_active())
    }
}

// =============================================================================
// Protocol
// =============================================================================

/// Guardian-based root key recovery
pub struct GuardianRecoveryProtocol {
    config: RecoveryConfig,
    state: StateStore,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<EngineMetrics>,
    configs: DashMap<String, GuardianConfig>,
    sessions: DashMap<Uuid, Arc<Mutex<RecoverySession>>>,
}

impl std::fmt::Debug for GuardianRecoveryProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardianRecoveryProtocol")
            .field("config", &self.config)
            .field("users", &self.configs.len())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl GuardianRecoveryProtocol {
    pub fn new(
        config: RecoveryConfig,
        state: StateStore,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            state,
            events,
            metrics,
            configs: DashMap::new(),
            sessions: DashMap::new(),
        })
    }

    /// Load persisted guardian configurations. Returns how many were loaded.
    pub async fn load_configs(&self) -> Result<usize> {
        let configs: Vec<GuardianConfig> = self.state.load_all(namespaces::GUARDIAN_CONFIGS).await?;
        let count = configs.len();
        for config in configs {
            self.configs.insert(config.user_id.clone(), config);
        }
        info!(count, "Loaded guardian configurations");
        Ok(count)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Split `root_key` among `guardians`, any `threshold` of whom can
    /// recover it. Replaces an existing configuration.
    #[instrument(skip(self, root_key, guardians), fields(guardians = guardians.len()))]
    pub async fn configure(
        &self,
        user_id: &str,
        root_key: &[u8],
        threshold: usize,
        guardians: Vec<GuardianIdentity>,
    ) -> Result<GuardianConfig> {
        if root_key.is_empty() {
            return Err(Error::InvalidConfig("root key must not be empty".into()));
        }
        self.check_guardian_set(threshold, &guardians)?;

        let version = self
            .configs
            .get(user_id)
            .map(|c| c.version + 1)
            .unwrap_or(1);
        let guardian_map = distribute(user_id, root_key, threshold, &guardians)?;

        let now = Utc::now();
        let config = GuardianConfig {
            user_id: user_id.to_string(),
            threshold: threshold as u8,
            version,
            root_key_digest: sha256_hex(root_key),
            guardians: guardian_map,
            created_at: now,
            updated_at: now,
        };

        self.save_config(config.clone()).await?;
        info!(threshold, version, "Guardians configured");
        self.emit(DomainEvent::guardians_configured(
            user_id,
            config.threshold,
            guardians.len(),
            version,
        ))
        .await;
        Ok(config)
    }

    /// Add a guardian and redistribute fresh shares to the whole active set.
    #[instrument(skip(self, root_key, guardian), fields(guardian_id = %guardian.guardian_id))]
    pub async fn add_guardian(&self, user_id: &str, root_key: &[u8], guardian: GuardianIdentity) -> Result<GuardianConfig> {
        let config = {
            let mut entry = self
                .configs
                .get_mut(user_id)
                .ok_or_else(|| Error::GuardianConfigNotFound(user_id.to_string()))?;

            if entry.root_key_digest != sha256_hex(root_key) {
                return Err(Error::integrity(
                    format!("root key of {}", user_id),
                    "does not match the configured key",
                ));
            }
            if entry.is_active(&guardian.guardian_id) {
                return Err(Error::DuplicateGuardian(guardian.guardian_id));
            }

            let mut identities: Vec<GuardianIdentity> = entry.active().map(|g| g.identity.clone()).collect();
            identities.push(guardian);
            self.check_guardian_set(entry.threshold(), &identities)?;

            let fresh = distribute(user_id, root_key, entry.threshold(), &identities)?;
            let config = &mut *entry;
            for (id, previous) in config.guardians.iter_mut() {
                if !fresh.contains_key(id) && previous.assignment.is_active() {
                    previous.assignment.revoke();
                }
            }
            config.guardians.extend(fresh);
            config.version += 1;
            config.updated_at = Utc::now();
            config.clone()
        };

        self.persist_config(&config).await?;
        info!(version = config.version, active = config.active_count(), "Guardian added");
        self.emit(DomainEvent::guardians_configured(
            user_id,
            config.threshold,
            config.active_count(),
            config.version,
        ))
        .await;
        Ok(config)
    }

    /// Revoke a guardian. The active set may not drop below the threshold.
    #[instrument(skip(self))]
    pub async fn remove_guardian(&self, user_id: &str, guardian_id: &str) -> Result<GuardianConfig> {
        let config = {
            let mut entry = self
                .configs
                .get_mut(user_id)
                .ok_or_else(|| Error::GuardianConfigNotFound(user_id.to_string()))?;

            if !entry.is_active(guardian_id) {
                return Err(Error::UnauthorizedGuardian {
                    guardian_id: guardian_id.to_string(),
                });
            }
            let remaining = entry.active_count() - 1;
            if remaining < entry.threshold() {
                return Err(Error::InsufficientGuardians {
                    available: remaining,
                    required: entry.threshold(),
                });
            }

            let config = &mut *entry;
            if let Some(g) = config.guardians.get_mut(guardian_id) {
                g.assignment.revoke();
            }
            config.version += 1;
            config.updated_at = Utc::now();
            config.clone()
        };

        self.persist_config(&config).await?;
        info!(version = config.version, "Guardian revoked");
        self.emit(DomainEvent::guardian_revoked(user_id, guardian_id)).await;
        Ok(config)
    }

    pub fn guardian_config(&self, user_id: &str) -> Option<GuardianConfig> {
        self.configs.get(user_id).map(|c| c.value().clone())
    }

    /// Current assignment of an active guardian.
    pub fn assignment(&self, user_id: &str, guardian_id: &str) -> Option<GuardianAssignment> {
        let config = self.configs.get(user_id)?;
        config
            .guardians
            .get(guardian_id)
            .filter(|g| g.assignment.is_active())
            .map(|g| g.assignment.clone())
    }

    // =========================================================================
    // Recovery sessions
    // =========================================================================

    /// Open a recovery session for `user_id` from a new device.
    #[instrument(skip(self, device), fields(device_id = %device.device_id))]
    pub async fn initiate_recovery(&self, user_id: &str, device: DeviceInfo) -> Result<RecoverySession> {
        let (required, version, guardians) = {
            let config = self
                .configs
                .get(user_id)
                .ok_or_else(|| Error::GuardianConfigNotFound(user_id.to_string()))?;
            let guardians: BTreeMap<String, GuardianSnapshot> = config
                .active()
                .map(|g| {
                    (
                        g.identity.guardian_id.clone(),
                        GuardianSnapshot {
                            identity: g.identity.clone(),
                            assignment: g.assignment.clone(),
                        },
                    )
                })
                .collect();
            (config.threshold(), config.version, guardians)
        };

        let ttl = chrono::Duration::from_std(self.config.session_ttl)
            .map_err(|e| Error::Config(format!("session ttl out of range: {}", e)))?;
        let session = RecoverySession::new(user_id.to_string(), device, required, version, guardians, ttl);
        let recovery_id = session.id;

        self.sessions.insert(recovery_id, Arc::new(Mutex::new(session.clone())));
        self.persist_session(&session).await;

        info!(%recovery_id, required, expires_at = %session.expires_at, "Recovery initiated");
        self.emit(DomainEvent::recovery_initiated(
            recovery_id,
            user_id,
            required,
            session.expires_at,
        ))
        .await;
        Ok(session)
    }

    /// Record a guardian's approval.
    ///
    /// Rejects expired sessions, guardians outside the session snapshot or
    /// revoked since, bad signatures and shares that do not match the
    /// assignment. A repeated approval from the same guardian is a no-op.
    /// The approval that reaches the threshold receives the root key.
    #[instrument(skip(self, approval))]
    pub async fn approve_recovery(
        &self,
        recovery_id: Uuid,
        guardian_id: &str,
        approval: GuardianApproval,
    ) -> Result<ApprovalOutcome> {
        let handle = self
            .sessions
            .get(&recovery_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::RecoveryNotFound(recovery_id.to_string()))?;

        let (outcome, snapshot, events) = {
            let mut session = handle.lock();
            self.apply_approval(&mut session, guardian_id, approval)?
        };

        if let Some(snapshot) = snapshot {
            self.persist_session(&snapshot).await;
        }
        self.emit_all(events).await;
        outcome
    }

    /// Mark a pending session failed.
    #[instrument(skip(self, reason))]
    pub async fn fail_recovery(&self, recovery_id: Uuid, reason: &str) -> Result<()> {
        let handle = self
            .sessions
            .get(&recovery_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::RecoveryNotFound(recovery_id.to_string()))?;

        let snapshot = {
            let mut session = handle.lock();
            if session.status != RecoveryStatus::Pending {
                return Err(Error::RecoveryNotPending {
                    recovery_id: recovery_id.to_string(),
                    status: session.status.to_string(),
                });
            }
            session.finish(RecoveryStatus::Failed, Some(reason.to_string()));
            session.clone()
        };

        warn!(%recovery_id, reason, "Recovery failed");
        self.metrics.record_recovery("failed");
        self.persist_session(&snapshot).await;
        self.emit(DomainEvent::recovery_failed(recovery_id, snapshot.user_id, reason))
            .await;
        Ok(())
    }

    pub fn session(&self, recovery_id: Uuid) -> Option<RecoverySession> {
        self.sessions.get(&recovery_id).map(|s| s.lock().clone())
    }

    /// The assignment a guardian approves a session with, as snapshotted.
    pub fn session_assignment(&self, recovery_id: Uuid, guardian_id: &str) -> Result<GuardianAssignment> {
        let handle = self
            .sessions
            .get(&recovery_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::RecoveryNotFound(recovery_id.to_string()))?;
        let session = handle.lock();
        session
            .guardians
            .get(guardian_id)
            .map(|g| g.assignment.clone())
            .ok_or_else(|| Error::UnauthorizedGuardian {
                guardian_id: guardian_id.to_string(),
            })
    }

    /// Sessions still accepting approvals.
    pub fn pending_sessions(&self) -> Vec<Uuid> {
        self.sessions
            .iter()
            .filter(|s| s.lock().status == RecoveryStatus::Pending)
            .map(|s| *s.key())
            .collect()
    }

    /// Expire every pending session past its deadline.
    pub async fn expire_stale_sessions(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let handles: Vec<(Uuid, Arc<Mutex<RecoverySession>>)> = self
            .sessions
            .iter()
            .map(|s| (*s.key(), Arc::clone(s.value())))
            .collect();

        let mut expired = Vec::new();
        for (recovery_id, handle) in handles {
            let snapshot = {
                let mut session = handle.lock();
                if !session.is_stale(now) {
                    continue;
                }
                session.finish(RecoveryStatus::Expired, None);
                session.clone()
            };

            info!(%recovery_id, user_id = %snapshot.user_id, "Recovery session expired");
            self.metrics.record_recovery("expired");
            self.persist_session(&snapshot).await;
            self.emit(DomainEvent::recovery_expired(recovery_id, snapshot.user_id))
                .await;
            expired.push(recovery_id);
        }
        expired
    }

    /// Drop finished sessions older than the retention window from memory.
    pub fn prune_finished_sessions(&self) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.config.session_retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let before = self.sessions.len();
        self.sessions.retain(|_, handle| {
            let session = handle.lock();
            !(session.status.is_terminal() && session.finished_at.is_some_and(|t| t <= cutoff))
        });
        before - self.sessions.len()
    }

    /// Sweep stale and long-finished sessions until `shutdown` is cancelled.
    pub async fn run_expiry_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Recovery expiry sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let expired = self.expire_stale_sessions().await;
                    if !expired.is_empty() {
                        debug!(count = expired.len(), "Expired stale recovery sessions");
                    }
                    let pruned = self.prune_finished_sessions();
                    if pruned > 0 {
                        debug!(count = pruned, "Dropped finished recovery sessions");
                    }
                }
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Runs under the session lock; no I/O.
    #[allow(clippy::type_complexity)]
    fn apply_approval(
        &self,
        session: &mut RecoverySession,
        guardian_id: &str,
        approval: GuardianApproval,
    ) -> Result<(Result<ApprovalOutcome>, Option<RecoverySession>, Vec<DomainEvent>)> {
        let recovery_id = session.id;
        let now = Utc::now();

        if session.is_stale(now) {
            session.finish(RecoveryStatus::Expired, None);
            self.metrics.record_recovery("expired");
            let events = vec![DomainEvent::recovery_expired(recovery_id, session.user_id.clone())];
            let err = Err(Error::RecoveryExpired {
                recovery_id: recovery_id.to_string(),
            });
            return Ok((err, Some(session.clone()), events));
        }
        if session.status == RecoveryStatus::Expired {
            return Err(Error::RecoveryExpired {
                recovery_id: recovery_id.to_string(),
            });
        }

        let snapshot = session
            .guardians
            .get(guardian_id)
            .cloned()
            .ok_or_else(|| Error::UnauthorizedGuardian {
                guardian_id: guardian_id.to_string(),
            })?;
        let still_active = self
            .configs
            .get(&session.user_id)
            .is_some_and(|c| c.is_active(guardian_id));
        if !still_active {
            return Err(Error::UnauthorizedGuardian {
                guardian_id: guardian_id.to_string(),
            });
        }

        if session.has_approved(guardian_id) {
            debug!(%recovery_id, guardian_id, "Duplicate approval ignored");
            let outcome = ApprovalOutcome::AlreadyApproved {
                approvals: session.approval_count(),
                required: session.required_approvals,
            };
            return Ok((Ok(outcome), None, Vec::new()));
        }

        if session.status != RecoveryStatus::Pending {
            return Err(Error::RecoveryNotPending {
                recovery_id: recovery_id.to_string(),
                status: session.status.to_string(),
            });
        }

        approval.verify(recovery_id, &session.user_id, &snapshot.identity)?;
        let share = approval.share;
        if share.x != snapshot.assignment.share_index || share.digest()? != snapshot.assignment.share_digest {
            return Err(Error::integrity(
                format!("share of guardian {}", guardian_id),
                "does not match the distributed share",
            ));
        }

        session.approvals.insert(guardian_id.to_string(), now);
        session.shares.insert(guardian_id.to_string(), share);
        let approvals = session.approval_count();
        let required = session.required_approvals;
        info!(%recovery_id, guardian_id, approvals, required, "Recovery approved");

        let mut events = vec![DomainEvent::recovery_approved(
            recovery_id,
            guardian_id,
            approvals,
            required,
        )];

        if approvals < required {
            let outcome = ApprovalOutcome::Pending { approvals, required };
            return Ok((Ok(outcome), Some(session.clone()), events));
        }

        let shares: Vec<Share> = session.shares.values().cloned().collect();
        match sss::reconstruct(&shares) {
            Ok(key) => {
                session.finish(RecoveryStatus::Completed, None);
                self.metrics.record_recovery("completed");
                info!(%recovery_id, "Recovery completed");
                events.push(DomainEvent::recovery_completed(recovery_id, session.user_id.clone()));
                let outcome = ApprovalOutcome::Completed {
                    root_key: Zeroizing::new(key),
                };
                Ok((Ok(outcome), Some(session.clone()), events))
            }
            Err(e) => {
                let reason = format!("reconstruction failed: {}", e);
                session.finish(RecoveryStatus::Failed, Some(reason.clone()));
                self.metrics.record_recovery("failed");
                warn!(%recovery_id, error = %e, "Recovery reconstruction failed");
                events.push(DomainEvent::recovery_failed(recovery_id, session.user_id.clone(), reason));
                Ok((Err(e), Some(session.clone()), events))
            }
        }
    }

    fn check_guardian_set(&self, threshold: usize, guardians: &[GuardianIdentity]) -> Result<()> {
        if guardians.is_empty() {
            return Err(Error::InvalidConfig("at least one guardian is required".into()));
        }
        if guardians.len() > self.config.max_guardians {
            return Err(Error::InvalidConfig(format!(
                "{} guardians exceeds the limit of {}",
                guardians.len(),
                self.config.max_guardians
            )));
        }
        if threshold == 0 || threshold > guardians.len() {
            return Err(Error::InvalidConfig(format!(
                "threshold {} must be between 1 and {} guardians",
                threshold,
                guardians.len()
            )));
        }

        let mut seen = HashSet::new();
        for g in guardians {
            if !seen.insert(g.guardian_id.as_str()) {
                return Err(Error::DuplicateGuardian(g.guardian_id.clone()));
            }
            g.verifying_key()?;
        }
        Ok(())
    }

    async fn save_config(&self, config: GuardianConfig) -> Result<()> {
        self.persist_config(&config).await?;
        self.configs.insert(config.user_id.clone(), config);
        Ok(())
    }

    async fn persist_config(&self, config: &GuardianConfig) -> Result<()> {
        self.state
            .put(namespaces::GUARDIAN_CONFIGS, &config.user_id, config)
            .await
    }

    /// Sessions are authoritative in memory; the stored copy is an audit trail.
    async fn persist_session(&self, session: &RecoverySession) {
        let key = session.id.to_string();
        if let Err(e) = self.state.put(namespaces::RECOVERY_SESSIONS, &key, session).await {
            warn!(recovery_id = %key, error = %e, "Failed to persist recovery session");
        }
    }

    async fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish recovery event");
        }
    }

    async fn emit_all(&self, events: Vec<DomainEvent>) {
        if events.is_empty() {
            return;
        }
        if let Err(e) = self.events.publish_all(events).await {
            warn!(error = %e, "Failed to publish recovery events");
        }
    }
}

/// Split the root key and seal one share to each guardian.
fn distribute(
    user_id: &str,
    root_key: &[u8],
    threshold: usize,
    guardians: &[GuardianIdentity],
) -> Result<BTreeMap<String, GuardianEntry>> {
    let shares = sss::split(root_key, threshold, guardians.len())?;
    guardians
        .iter()
        .zip(shares.iter())
        .map(|(identity, share)| {
            Ok((
                identity.guardian_id.clone(),
                GuardianEntry {
                    identity: identity.clone(),
                    assignment: GuardianAssignment::new(user_id, identity, share)?,
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, InMemoryStore};
    use crate::recovery::GuardianKeys;
    use assert_matches::assert_matches;

    const ROOT_KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    struct Setup {
        protocol: Arc<GuardianRecoveryProtocol>,
        events: Arc<InMemoryEventCollector>,
        state: StateStore,
        guardians: Vec<GuardianKeys>,
    }

    async fn setup(count: usize, threshold: usize) -> Setup {
        let events = Arc::new(InMemoryEventCollector::new());
        let state = StateStore::new(Arc::new(InMemoryStore::new()));
        let protocol = GuardianRecoveryProtocol::new(
            RecoveryConfig::default(),
            state.clone(),
            events.clone(),
            Arc::new(EngineMetrics::new().unwrap()),
        );
        let guardians: Vec<GuardianKeys> = (0..count)
            .map(|i| GuardianKeys::generate(format!("guardian-{}", i)))
            .collect();
        protocol
            .configure("user-1", ROOT_KEY, threshold, guardians.iter().map(|g| g.identity()).collect())
            .await
            .unwrap();
        Setup {
            protocol,
            events,
            state,
            guardians,
        }
    }

    async fn approve(s: &Setup, recovery_id: Uuid, guardian: &GuardianKeys) -> Result<ApprovalOutcome> {
        let assignment = s.protocol.session_assignment(recovery_id, guardian.guardian_id())?;
        let approval = guardian.approve(recovery_id, "user-1", &assignment)?;
        s.protocol
            .approve_recovery(recovery_id, guardian.guardian_id(), approval)
            .await
    }

    #[tokio::test]
    async fn test_configure_validation() {
        let s = setup(3, 2).await;
        let ids: Vec<GuardianIdentity> = s.guardians.iter().map(|g| g.identity()).collect();

        assert_matches!(
            s.protocol.configure("u", ROOT_KEY, 4, ids.clone()).await,
            Err(Error::InvalidConfig(_))
        );
        assert_matches!(
            s.protocol.configure("u", ROOT_KEY, 0, ids.clone()).await,
            Err(Error::InvalidConfig(_))
        );

        let mut dup = ids.clone();
        dup.push(ids[0].clone());
        assert_matches!(
            s.protocol.configure("u", ROOT_KEY, 2, dup).await,
            Err(Error::DuplicateGuardian(_))
        );

        let many: Vec<GuardianIdentity> = (0..11)
            .map(|i| GuardianKeys::generate(format!("g{}", i)).identity())
            .collect();
        assert_matches!(
            s.protocol.configure("u", ROOT_KEY, 2, many).await,
            Err(Error::InvalidConfig(_))
        );
    }

    #[tokio::test]
    async fn test_threshold_recovery() {
        let s = setup(5, 3).await;
        let session = s
            .protocol
            .initiate_recovery("user-1", DeviceInfo::new("dev-9", "New phone"))
            .await
            .unwrap();
        assert_eq!(session.required_approvals, 3);
        assert_eq!(session.guardians.len(), 5);

        let first = approve(&s, session.id, &s.guardians[0]).await.unwrap();
        assert_matches!(first, ApprovalOutcome::Pending { approvals: 1, required: 3 });
        let second = approve(&s, session.id, &s.guardians[3]).await.unwrap();
        assert_matches!(second, ApprovalOutcome::Pending { approvals: 2, required: 3 });
        assert_eq!(s.protocol.session(session.id).unwrap().status, RecoveryStatus::Pending);

        let third = approve(&s, session.id, &s.guardians[4]).await.unwrap();
        assert_eq!(third.into_root_key().unwrap().as_slice(), ROOT_KEY);

        let done = s.protocol.session(session.id).unwrap();
        assert_eq!(done.status, RecoveryStatus::Completed);
        assert!(done.shares.is_empty());

        // Duplicate approval after completion is a no-op without the key
        let again = approve(&s, session.id, &s.guardians[0]).await.unwrap();
        assert_matches!(again, ApprovalOutcome::AlreadyApproved { approvals: 3, .. });

        // A new guardian cannot reopen it
        assert_matches!(
            approve(&s, session.id, &s.guardians[1]).await,
            Err(Error::RecoveryNotPending { .. })
        );
        assert_eq!(s.events.count_of_type("RecoveryCompleted"), 1);
        assert_eq!(s.events.count_of_type("RecoveryApproved"), 3);
    }

    #[tokio::test]
    async fn test_duplicate_approval_not_counted() {
        let s = setup(3, 2).await;
        let session = s
            .protocol
            .initiate_recovery("user-1", DeviceInfo::new("d", "n"))
            .await
            .unwrap();

        approve(&s, session.id, &s.guardians[1]).await.unwrap();
        let again = approve(&s, session.id, &s.guardians[1]).await.unwrap();
        assert_matches!(again, ApprovalOutcome::AlreadyApproved { approvals: 1, required: 2 });
        assert_eq!(s.protocol.session(session.id).unwrap().approval_count(), 1);
    }

    #[tokio::test]
    async fn test_rejections() {
        let s = setup(3, 2).await;
        let session = s
            .protocol
            .initiate_recovery("user-1", DeviceInfo::new("d", "n"))
            .await
            .unwrap();

        // Unknown guardian
        let stranger = GuardianKeys::generate("stranger");
        let assignment = s.protocol.session_assignment(session.id, "guardian-0").unwrap();
        let mut approval = s.guardians[0].approve(session.id, "user-1", &assignment).unwrap();
        assert_matches!(
            s.protocol.approve_recovery(session.id, stranger.guardian_id(), approval.clone()).await,
            Err(Error::UnauthorizedGuardian { .. })
        );

        // Guardian 0's approval submitted under guardian 1's name
        assert_matches!(
            s.protocol.approve_recovery(session.id, "guardian-1", approval.clone()).await,
            Err(Error::InvalidSignature { .. })
        );

        // Forged signature
        approval.signature[0] ^= 0x01;
        assert_matches!(
            s.protocol.approve_recovery(session.id, "guardian-0", approval).await,
            Err(Error::InvalidSignature { .. })
        );

        // Unknown session
        assert_matches!(
            approve(&s, Uuid::new_v4(), &s.guardians[0]).await,
            Err(Error::RecoveryNotFound(_))
        );
        assert_eq!(s.protocol.session(session.id).unwrap().approval_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_session_rejects() {
        let s = setup(3, 2).await;
        let session = s
            .protocol
            .initiate_recovery("user-1", DeviceInfo::new("d", "n"))
            .await
            .unwrap();
        {
            let handle = s.protocol.sessions.get(&session.id).unwrap();
            handle.lock().expires_at = Utc::now() - chrono::Duration::seconds(1);
        }

        assert_matches!(
            approve(&s, session.id, &s.guardians[0]).await,
            Err(Error::RecoveryExpired { .. })
        );
        assert_eq!(s.protocol.session(session.id).unwrap().status, RecoveryStatus::Expired);
        assert_matches!(
            approve(&s, session.id, &s.guardians[1]).await,
            Err(Error::RecoveryExpired { .. })
        );
        assert_eq!(s.events.count_of_type("RecoveryExpired"), 1);
    }

    #[tokio::test]
    async fn test_sweeper_expires_sessions() {
        let s = setup(2, 1).await;
        let stale = s
            .protocol
            .initiate_recovery("user-1", DeviceInfo::new("d1", "n"))
            .await
            .unwrap();
        let fresh = s
            .protocol
            .initiate_recovery("user-1", DeviceInfo::new("d2", "n"))
            .await
            .unwrap();
        s.protocol.sessions.get(&stale.id).unwrap().lock().expires_at = Utc::now();

        assert_eq!(s.protocol.expire_stale_sessions().await, vec![stale.id]);
        assert_eq!(s.protocol.pending_sessions(), vec![fresh.id]);
        assert!(s.protocol.expire_stale_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_finished_sessions_pruned_after_retention() {
        let s = setup(2, 1).await;
        let done = s
            .protocol
            .initiate_recovery("user-1", DeviceInfo::new("d1", "n"))
            .await
            .unwrap();
        let open = s
            .protocol
            .initiate_recovery("user-1", DeviceInfo::new("d2", "n"))
            .await
            .unwrap();
        s.protocol.fail_recovery(done.id, "device lost").await.unwrap();

        // Inside the retention window nothing goes
        assert_eq!(s.protocol.prune_finished_sessions(), 0);
        assert!(s.protocol.session(done.id).is_some());

        s.protocol.sessions.get(&done.id).unwrap().lock().finished_at =
            Some(Utc::now() - chrono::Duration::hours(25));
        assert_eq!(s.protocol.prune_finished_sessions(), 1);
        assert!(s.protocol.session(done.id).is_none());
        assert_eq!(s.protocol.pending_sessions(), vec![open.id]);

        let stored: Option<RecoverySession> = s
            .state
            .get(namespaces::RECOVERY_SESSIONS, &done.id.to_string())
            .await
            .unwrap();
        assert_eq!(stored.unwrap().status, RecoveryStatus::Failed);
    }

    #[tokio::test]
    async fn test_initiate_without_config() {
        let s = setup(2, 1).await;
        assert_matches!(
            s.protocol.initiate_recovery("nobody", DeviceInfo::new("d", "n")).await,
            Err(Error::GuardianConfigNotFound(_))
        );
    }

    #[tokio::test]
    async fn test_fail_recovery() {
        let s = setup(2, 2).await;
        let session = s
            .protocol
            .initiate_recovery("user-1", DeviceInfo::new("d", "n"))
            .await
            .unwrap();
        s.protocol.fail_recovery(session.id, "user cancelled").await.unwrap();

        let failed = s.protocol.session(session.id).unwrap();
        assert_eq!(failed.status, RecoveryStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("user cancelled"));
        assert_matches!(
            s.protocol.fail_recovery(session.id, "again").await,
            Err(Error::RecoveryNotPending { .. })
        );
    }

    #[tokio::test]
    async fn test_remove_guardian() {
        let s = setup(3, 2).await;
        let session = s
            .protocol
            .initiate_recovery("user-1", DeviceInfo::new("d", "n"))
            .await
            .unwrap();

        let config = s.protocol.remove_guardian("user-1", "guardian-2").await.unwrap();
        assert_eq!(config.active_count(), 2);
        assert_eq!(config.version, 2);
        assert!(s.protocol.assignment("user-1", "guardian-2").is_none());

        // Removed after the snapshot: rejected
        assert_matches!(
            approve(&s, session.id, &s.guardians[2]).await,
            Err(Error::UnauthorizedGuardian { .. })
        );

        // Below threshold
        assert_matches!(
            s.protocol.remove_guardian("user-1", "guardian-1").await,
            Err(Error::InsufficientGuardians { available: 1, required: 2 })
        );
        assert_matches!(
            s.protocol.remove_guardian("user-1", "guardian-2").await,
            Err(Error::UnauthorizedGuardian { .. })
        );

        // Remaining guardians still complete the in-flight session
        approve(&s, session.id, &s.guardians[0]).await.unwrap();
        let done = approve(&s, session.id, &s.guardians[1]).await.unwrap();
        assert_eq!(done.into_root_key().unwrap().as_slice(), ROOT_KEY);
    }

    #[tokio::test]
    async fn test_add_guardian() {
        let s = setup(2, 2).await;
        let session = s
            .protocol
            .initiate_recovery("user-1", DeviceInfo::new("d", "n"))
            .await
            .unwrap();

        let newcomer = GuardianKeys::generate("guardian-new");
        assert_matches!(
            s.protocol.add_guardian("user-1", b"wrong key", newcomer.identity()).await,
            Err(Error::IntegrityError { .. })
        );
        assert_matches!(
            s.protocol.add_guardian("user-1", ROOT_KEY, s.guardians[0].identity()).await,
            Err(Error::DuplicateGuardian(_))
        );

        let config = s
            .protocol
            .add_guardian("user-1", ROOT_KEY, newcomer.identity())
            .await
            .unwrap();
        assert_eq!(config.active_count(), 3);
        assert_eq!(config.version, 2);

        // Not part of the in-flight snapshot
        assert_matches!(
            s.protocol.session_assignment(session.id, "guardian-new"),
            Err(Error::UnauthorizedGuardian { .. })
        );

        // The old snapshot still completes with its own shares
        approve(&s, session.id, &s.guardians[0]).await.unwrap();
        let done = approve(&s, session.id, &s.guardians[1]).await.unwrap();
        assert_eq!(done.into_root_key().unwrap().as_slice(), ROOT_KEY);

        // A new session includes the newcomer
        let next = s
            .protocol
            .initiate_recovery("user-1", DeviceInfo::new("d", "n"))
            .await
            .unwrap();
        assert_eq!(next.config_version, 2);
        approve(&s, next.id, &newcomer).await.unwrap();
        let done = approve(&s, next.id, &s.guardians[1]).await.unwrap();
        assert_eq!(done.into_root_key().unwrap().as_slice(), ROOT_KEY);
    }

    #[tokio::test]
    async fn test_configs_persist() {
        let store = Arc::new(InMemoryStore::new());
        let state = StateStore::new(store.clone());
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let events = Arc::new(InMemoryEventCollector::new());

        let first = GuardianRecoveryProtocol::new(RecoveryConfig::default(), state.clone(), events.clone(), metrics.clone());
        let guardian = GuardianKeys::generate("g");
        first
            .configure("user-1", ROOT_KEY, 1, vec![guardian.identity()])
            .await
            .unwrap();

        let second = GuardianRecoveryProtocol::new(RecoveryConfig::default(), state, events, metrics);
        assert_eq!(second.load_configs().await.unwrap(), 1);
        assert_eq!(second.guardian_config("user-1").unwrap().threshold, 1);
    }
}
