//! Recovery sessions
//!
//! A session collects guardian approvals until the threshold is met or the
//! session expires. The set of guardians allowed to approve is fixed when
//! the session is opened.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::sss::Share;

use super::guardian::{GuardianAssignment, GuardianIdentity};

/// Device requesting the recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub platform: Option<String>,
}

impl DeviceInfo {
    pub fn new(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            platform: None,
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

impl RecoveryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecoveryStatus::Pending)
    }
}

impl fmt::Display for RecoveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStatus::Pending => "pending",
            RecoveryStatus::Completed => "completed",
            RecoveryStatus::Failed => "failed",
            RecoveryStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A guardian as it stood when the session was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianSnapshot {
    pub identity: GuardianIdentity,
    pub assignment: GuardianAssignment,
}

/// An in-progress threshold approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySession {
    pub id: Uuid,
    pub user_id: String,
    pub device: DeviceInfo,
    pub required_approvals: usize,
    /// Guardian configuration version the snapshot was taken from
    pub config_version: u32,
    pub guardians: BTreeMap<String, GuardianSnapshot>,
    /// Approval time per guardian
    pub approvals: BTreeMap<String, DateTime<Utc>>,
    /// Collected shares; never persisted, cleared once the session ends
    #[serde(skip)]
    pub(crate) shares: BTreeMap<String, Share>,
    pub status: RecoveryStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl RecoverySession {
    pub(crate) fn new(
        user_id: String,
        device: DeviceInfo,
        required_approvals: usize,
        config_version: u32,
        guardians: BTreeMap<String, GuardianSnapshot>,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            device,
            required_approvals,
            config_version,
            guardians,
            approvals: BTreeMap::new(),
            shares: BTreeMap::new(),
            status: RecoveryStatus::Pending,
            created_at: now,
            expires_at: now + ttl,
            finished_at: None,
            failure_reason: None,
        }
    }

    pub fn approval_count(&self) -> usize {
        self.approvals.len()
    }

    pub fn has_approved(&self, guardian_id: &str) -> bool {
        self.approvals.contains_key(guardian_id)
    }

    /// Pending but past its expiry.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == RecoveryStatus::Pending && now >= self.expires_at
    }

    pub(crate) fn finish(&mut self, status: RecoveryStatus, reason: Option<String>) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.failure_reason = reason;
        self.shares.clear();
    }
}

/// Result of an accepted approval.
pub enum ApprovalOutcome {
    /// Counted; more approvals needed
    Pending { approvals: usize, required: usize },
    /// This guardian had already approved; nothing changed
    AlreadyApproved { approvals: usize, required: usize },
    /// Threshold reached; the reconstructed root key, handed out once
    Completed { root_key: Zeroizing<Vec<u8>> },
}

impl ApprovalOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ApprovalOutcome::Completed { .. })
    }

    /// Take the recovered key, if this outcome carries it.
    pub fn into_root_key(self) -> Option<Zeroizing<Vec<u8>>> {
        match self {
            ApprovalOutcome::Completed { root_key } => Some(root_key),
            _ => None,
        }
    }
}

impl fmt::Debug for ApprovalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalOutcome::Pending { approvals, required } => f
                .debug_struct("Pending")
                .field("approvals", approvals)
                .field("required", required)
                .finish(),
            ApprovalOutcome::AlreadyApproved { approvals, required } => f
                .debug_struct("AlreadyApproved")
                .field("approvals", approvals)
                .field("required", required)
                .finish(),
            ApprovalOutcome::Completed { .. } => f.write_str("Completed(<root key redacted>)"),
        }
    }
}
