//! Domain Events
//!
//! Immutable records of significant occurrences in the shard lifecycle:
//! placement, health transitions, repair, guardian recovery and vault
//! audits. Events are published through the [`EventPublisher`] port and
//! serialize with a `type` tag for audit sinks.
//!
//! [`EventPublisher`]: super::ports::EventPublisher
//!
//! # Example
//!
//! ```ignore
//! let event = DomainEvent::repair_started(job_id, "file-1", RepairPriority::Normal, vec![2, 4]);
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::monitor::health::HealthStatus;
use crate::monitor::repair::RepairPriority;

/// Domain event representing a significant occurrence in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Shard Events
    // =========================================================================
    /// A shard was accepted by a provider.
    ShardStored {
        file_id: String,
        shard_index: u8,
        provider_id: String,
        storage_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A shard was fetched from a provider.
    ShardRetrieved {
        file_id: String,
        shard_index: u8,
        provider_id: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Redundancy Events
    // =========================================================================
    /// A file's health classification changed.
    HealthChanged {
        file_id: String,
        previous: Option<String>,
        current: String,
        available_shards: usize,
        total_shards: usize,
        health_score: f64,
        timestamp: DateTime<Utc>,
    },

    /// A file dropped below its threshold and cannot be repaired automatically.
    RedundancyEscalated {
        file_id: String,
        available_shards: usize,
        required_shards: usize,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Repair Events
    // =========================================================================
    /// A repair job began an attempt.
    RepairStarted {
        job_id: Uuid,
        file_id: String,
        priority: String,
        missing_shards: Vec<u8>,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// A repair job finished. `remaining_missing` is non-zero after a
    /// partial placement.
    RepairCompleted {
        job_id: Uuid,
        file_id: String,
        repaired_shards: Vec<u8>,
        remaining_missing: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A repair job gave up.
    RepairFailed {
        job_id: Uuid,
        file_id: String,
        attempts: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A repair job was cancelled.
    RepairCancelled {
        job_id: Uuid,
        file_id: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Guardian Recovery Events
    // =========================================================================
    /// A user's guardian set was configured or redistributed.
    GuardiansConfigured {
        user_id: String,
        threshold: u8,
        guardian_count: usize,
        version: u32,
        timestamp: DateTime<Utc>,
    },

    /// A guardian was revoked from a user's configuration.
    GuardianRevoked {
        user_id: String,
        guardian_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A recovery session was opened.
    RecoveryInitiated {
        recovery_id: Uuid,
        user_id: String,
        required_approvals: usize,
        expires_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// A guardian approved a recovery.
    RecoveryApproved {
        recovery_id: Uuid,
        guardian_id: String,
        approvals: usize,
        required_approvals: usize,
        timestamp: DateTime<Utc>,
    },

    /// A recovery reached its threshold and the key was reconstructed.
    RecoveryCompleted {
        recovery_id: Uuid,
        user_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A recovery expired before reaching its threshold.
    RecoveryExpired {
        recovery_id: Uuid,
        user_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A recovery was failed explicitly or could not reconstruct.
    RecoveryFailed {
        recovery_id: Uuid,
        user_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Vault Events
    // =========================================================================
    /// A guardian was pinged.
    GuardianHealthChecked {
        guardian_id: String,
        online: bool,
        latency_ms: Option<u64>,
        timestamp: DateTime<Utc>,
    },

    /// A replica failed an audit.
    AuditFailed {
        file_id: String,
        shard_index: u8,
        guardian_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A replica was copied to a new guardian.
    ShardReplicated {
        file_id: String,
        shard_index: u8,
        guardian_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A file was reassembled from guardian replicas.
    EmergencyRecovery {
        file_id: String,
        shards_used: usize,
        replicas_tried: usize,
        success: bool,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::ShardStored { timestamp, .. }
            | DomainEvent::ShardRetrieved { timestamp, .. }
            | DomainEvent::HealthChanged { timestamp, .. }
            | DomainEvent::RedundancyEscalated { timestamp, .. }
            | DomainEvent::RepairStarted { timestamp, .. }
            | DomainEvent::RepairCompleted { timestamp, .. }
            | DomainEvent::RepairFailed { timestamp, .. }
            | DomainEvent::RepairCancelled { timestamp, .. }
            | DomainEvent::GuardiansConfigured { timestamp, .. }
            | DomainEvent::GuardianRevoked { timestamp, .. }
            | DomainEvent::RecoveryInitiated { timestamp, .. }
            | DomainEvent::RecoveryApproved { timestamp, .. }
            | DomainEvent::RecoveryCompleted { timestamp, .. }
            | DomainEvent::RecoveryExpired { timestamp, .. }
            | DomainEvent::RecoveryFailed { timestamp, .. }
            | DomainEvent::GuardianHealthChecked { timestamp, .. }
            | DomainEvent::AuditFailed { timestamp, .. }
            | DomainEvent::ShardReplicated { timestamp, .. }
            | DomainEvent::EmergencyRecovery { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ShardStored { .. } => "ShardStored",
            DomainEvent::ShardRetrieved { .. } => "ShardRetrieved",
            DomainEvent::HealthChanged { .. } => "HealthChanged",
            DomainEvent::RedundancyEscalated { .. } => "RedundancyEscalated",
            DomainEvent::RepairStarted { .. } => "RepairStarted",
            DomainEvent::RepairCompleted { .. } => "RepairCompleted",
            DomainEvent::RepairFailed { .. } => "RepairFailed",
            DomainEvent::RepairCancelled { .. } => "RepairCancelled",
            DomainEvent::GuardiansConfigured { .. } => "GuardiansConfigured",
            DomainEvent::GuardianRevoked { .. } => "GuardianRevoked",
            DomainEvent::RecoveryInitiated { .. } => "RecoveryInitiated",
            DomainEvent::RecoveryApproved { .. } => "RecoveryApproved",
            DomainEvent::RecoveryCompleted { .. } => "RecoveryCompleted",
            DomainEvent::RecoveryExpired { .. } => "RecoveryExpired",
            DomainEvent::RecoveryFailed { .. } => "RecoveryFailed",
            DomainEvent::GuardianHealthChecked { .. } => "GuardianHealthChecked",
            DomainEvent::AuditFailed { .. } => "AuditFailed",
            DomainEvent::ShardReplicated { .. } => "ShardReplicated",
            DomainEvent::EmergencyRecovery { .. } => "EmergencyRecovery",
        }
    }

    /// Get the file ID if the event concerns a file.
    pub fn file_id(&self) -> Option<&str> {
        match self {
            DomainEvent::ShardStored { file_id, .. }
            | DomainEvent::ShardRetrieved { file_id, .. }
            | DomainEvent::HealthChanged { file_id, .. }
            | DomainEvent::RedundancyEscalated { file_id, .. }
            | DomainEvent::RepairStarted { file_id, .. }
            | DomainEvent::RepairCompleted { file_id, .. }
            | DomainEvent::RepairFailed { file_id, .. }
            | DomainEvent::RepairCancelled { file_id, .. }
            | DomainEvent::AuditFailed { file_id, .. }
            | DomainEvent::ShardReplicated { file_id, .. }
            | DomainEvent::EmergencyRecovery { file_id, .. } => Some(file_id),
            _ => None,
        }
    }

    /// Get the recovery session ID if the event concerns one.
    pub fn recovery_id(&self) -> Option<Uuid> {
        match self {
            DomainEvent::RecoveryInitiated { recovery_id, .. }
            | DomainEvent::RecoveryApproved { recovery_id, .. }
            | DomainEvent::RecoveryCompleted { recovery_id, .. }
            | DomainEvent::RecoveryExpired { recovery_id, .. }
            | DomainEvent::RecoveryFailed { recovery_id, .. } => Some(*recovery_id),
            _ => None,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl DomainEvent {
    pub fn shard_stored(
        file_id: impl Into<String>,
        shard_index: u8,
        provider_id: impl Into<String>,
        storage_id: impl Into<String>,
    ) -> Self {
        DomainEvent::ShardStored {
            file_id: file_id.into(),
            shard_index,
            provider_id: provider_id.into(),
            storage_id: storage_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn shard_retrieved(file_id: impl Into<String>, shard_index: u8, provider_id: impl Into<String>) -> Self {
        DomainEvent::ShardRetrieved {
            file_id: file_id.into(),
            shard_index,
            provider_id: provider_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn health_changed(
        file_id: impl Into<String>,
        previous: Option<HealthStatus>,
        current: HealthStatus,
        available_shards: usize,
        total_shards: usize,
        health_score: f64,
    ) -> Self {
        DomainEvent::HealthChanged {
            file_id: file_id.into(),
            previous: previous.map(|s| s.to_string()),
            current: current.to_string(),
            available_shards,
            total_shards,
            health_score,
            timestamp: Utc::now(),
        }
    }

    pub fn redundancy_escalated(file_id: impl Into<String>, available_shards: usize, required_shards: usize) -> Self {
        DomainEvent::RedundancyEscalated {
            file_id: file_id.into(),
            available_shards,
            required_shards,
            timestamp: Utc::now(),
        }
    }

    pub fn repair_started(
        job_id: Uuid,
        file_id: impl Into<String>,
        priority: RepairPriority,
        missing_shards: Vec<u8>,
        attempt: u32,
    ) -> Self {
        DomainEvent::RepairStarted {
            job_id,
            file_id: file_id.into(),
            priority: priority.to_string(),
            missing_shards,
            attempt,
            timestamp: Utc::now(),
        }
    }

    pub fn repair_completed(
        job_id: Uuid,
        file_id: impl Into<String>,
        repaired_shards: Vec<u8>,
        remaining_missing: usize,
        duration: Duration,
    ) -> Self {
        DomainEvent::RepairCompleted {
            job_id,
            file_id: file_id.into(),
            repaired_shards,
            remaining_missing,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn repair_failed(job_id: Uuid, file_id: impl Into<String>, attempts: u32, reason: impl Into<String>) -> Self {
        DomainEvent::RepairFailed {
            job_id,
            file_id: file_id.into(),
            attempts,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn repair_cancelled(job_id: Uuid, file_id: impl Into<String>) -> Self {
        DomainEvent::RepairCancelled {
            job_id,
            file_id: file_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn guardians_configured(user_id: impl Into<String>, threshold: u8, guardian_count: usize, version: u32) -> Self {
        DomainEvent::GuardiansConfigured {
            user_id: user_id.into(),
            threshold,
            guardian_count,
            version,
            timestamp: Utc::now(),
        }
    }

    pub fn guardian_revoked(user_id: impl Into<String>, guardian_id: impl Into<String>) -> Self {
        DomainEvent::GuardianRevoked {
            user_id: user_id.into(),
            guardian_id: guardian_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn recovery_initiated(
        recovery_id: Uuid,
        user_id: impl Into<String>,
        required_approvals: usize,
        expires_at: DateTime<Utc>,
    ) -> Self {
        DomainEvent::RecoveryInitiated {
            recovery_id,
            user_id: user_id.into(),
            required_approvals,
            expires_at,
            timestamp: Utc::now(),
        }
    }

    pub fn recovery_approved(
        recovery_id: Uuid,
        guardian_id: impl Into<String>,
        approvals: usize,
        required_approvals: usize,
    ) -> Self {
        DomainEvent::RecoveryApproved {
            recovery_id,
            guardian_id: guardian_id.into(),
            approvals,
            required_approvals,
            timestamp: Utc::now(),
        }
    }

    pub fn recovery_completed(recovery_id: Uuid, user_id: impl Into<String>) -> Self {
        DomainEvent::RecoveryCompleted {
            recovery_id,
            user_id: user_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn recovery_expired(recovery_id: Uuid, user_id: impl Into<String>) -> Self {
        DomainEvent::RecoveryExpired {
            recovery_id,
            user_id: user_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn recovery_failed(recovery_id: Uuid, user_id: impl Into<String>, reason: impl Into<String>) -> Self {
        DomainEvent::RecoveryFailed {
            recovery_id,
            user_id: user_id.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn guardian_health_checked(guardian_id: impl Into<String>, online: bool, latency: Option<Duration>) -> Self {
        DomainEvent::GuardianHealthChecked {
            guardian_id: guardian_id.into(),
            online,
            latency_ms: latency.map(|d| d.as_millis() as u64),
            timestamp: Utc::now(),
        }
    }

    pub fn audit_failed(
        file_id: impl Into<String>,
        shard_index: u8,
        guardian_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        DomainEvent::AuditFailed {
            file_id: file_id.into(),
            shard_index,
            guardian_id: guardian_id.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn shard_replicated(file_id: impl Into<String>, shard_index: u8, guardian_id: impl Into<String>) -> Self {
        DomainEvent::ShardReplicated {
            file_id: file_id.into(),
            shard_index,
            guardian_id: guardian_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn emergency_recovery(file_id: impl Into<String>, shards_used: usize, replicas_tried: usize, success: bool) -> Self {
        DomainEvent::EmergencyRecovery {
            file_id: file_id.into(),
            shards_used,
            replicas_tried,
            success,
            timestamp: Utc::now(),
        }
    }
}
