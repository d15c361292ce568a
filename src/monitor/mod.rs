//! Redundancy Monitoring and Repair
//!
//! Keeps every registered file at or above its redundancy target.
//!
//! # Components
//!
//! - **Health** (`health.rs`): four-state classification from shard
//!   availability.
//! - **Redundancy Monitor** (`redundancy.rs`): periodic provider probes,
//!   health transitions, repair scheduling and escalation.
//! - **Repair Engine** (`repair.rs`): bounded-concurrency jobs that
//!   regenerate missing shards and place them on fresh providers.
//!
//! ```text
//!   probe ──▶ classify ──▶ degraded/critical ──▶ RepairJob ──▶ regenerate ──▶ place
//!                    └───▶ failed ──▶ escalate
//! ```

pub mod health;
pub mod redundancy;
pub mod repair;

pub use health::{HealthRecord, HealthStatus, HealthThresholds};
pub use redundancy::{MonitorConfig, RedundancyMonitor};
pub use repair::{RepairConfig, RepairEngine, RepairJob, RepairNotice, RepairPriority, RepairStatus};
