//! File Health Classification
//!
//! Maps the number of reachable shards of a K-of-N file onto a four-state
//! health scale. The thresholds are fractions of N.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Redundancy health of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// At or above the repair threshold
    Healthy,
    /// Below the repair threshold; routine repair
    Degraded,
    /// Below the emergency threshold; emergency repair
    Critical,
    /// Fewer than K shards reachable; no automatic repair possible
    Failed,
}

impl HealthStatus {
    pub const ALL: [HealthStatus; 4] = [
        HealthStatus::Healthy,
        HealthStatus::Degraded,
        HealthStatus::Critical,
        HealthStatus::Failed,
    ];

    /// File can still be decoded
    pub fn is_operational(&self) -> bool {
        !matches!(self, HealthStatus::Failed)
    }

    /// Status calls for a repair job
    pub fn needs_repair(&self) -> bool {
        matches!(self, HealthStatus::Degraded | HealthStatus::Critical)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
            HealthStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repair and emergency thresholds as fractions of N.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub repair_threshold: f64,
    pub emergency_threshold: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            repair_threshold: 0.7,
            emergency_threshold: 0.5,
        }
    }
}

impl HealthThresholds {
    pub fn validate(&self) -> Result<()> {
        let valid = self.emergency_threshold > 0.0
            && self.emergency_threshold <= self.repair_threshold
            && self.repair_threshold <= 1.0;
        if !valid {
            return Err(Error::Config(format!(
                "health thresholds must satisfy 0 < emergency ({}) <= repair ({}) <= 1",
                self.emergency_threshold, self.repair_threshold
            )));
        }
        Ok(())
    }

    /// Classify a K-of-N file with `available` reachable shards.
    pub fn classify(&self, available: usize, threshold: usize, total: usize) -> HealthStatus {
        let avail = available as f64;
        let n = total as f64;

        if available < threshold {
            HealthStatus::Failed
        } else if avail < self.emergency_threshold * n {
            HealthStatus::Critical
        } else if avail < self.repair_threshold * n {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Result of one health check of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub file_id: String,
    pub threshold: usize,
    pub total_shards: usize,
    pub available_shards: usize,
    /// available / total
    pub health_score: f64,
    pub status: HealthStatus,
    /// Shard indices that are unplaced or whose provider is unreachable
    pub missing_indices: Vec<u8>,
    /// Providers that failed their probe
    pub failed_nodes: BTreeSet<String>,
    pub last_check: DateTime<Utc>,
}

impl HealthRecord {
    pub fn evaluate(
        file_id: impl Into<String>,
        threshold: usize,
        total: usize,
        missing_indices: Vec<u8>,
        failed_nodes: BTreeSet<String>,
        thresholds: &HealthThresholds,
    ) -> Self {
        let available = total.saturating_sub(missing_indices.len());
        let health_score = if total == 0 {
            0.0
        } else {
            available as f64 / total as f64
        };

        Self {
            file_id: file_id.into(),
            threshold,
            total_shards: total,
            available_shards: available,
            health_score,
            status: thresholds.classify(available, threshold, total),
            missing_indices,
            failed_nodes,
            last_check: Utc::now(),
        }
    }
}
