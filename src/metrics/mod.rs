//! Metrics module
//!
//! Prometheus instruments for the shard lifecycle engine. Each
//! `EngineMetrics` owns its own registry, so several engines (or tests) can
//! coexist in one process.

use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::error::Result;
use crate::monitor::health::HealthStatus;

const NAMESPACE: &str = "shardwarden";

/// Engine-wide metric instruments.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    shards_stored: IntCounter,
    repairs: IntCounterVec,
    repair_duration: Histogram,
    recoveries: IntCounterVec,
    files_by_health: IntGaugeVec,
    guardians_online: IntGauge,
    audits: IntCounterVec,
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics").finish_non_exhaustive()
    }
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let shards_stored = IntCounter::with_opts(
            Opts::new("shards_stored_total", "Shards accepted by providers or guardians").namespace(NAMESPACE),
        )?;
        let repairs = IntCounterVec::new(
            Opts::new("repairs_total", "Repair jobs by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let repair_duration = Histogram::with_opts(
            HistogramOpts::new("repair_duration_seconds", "Wall time of finished repair jobs")
                .namespace(NAMESPACE)
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        )?;
        let recoveries = IntCounterVec::new(
            Opts::new("recoveries_total", "Guardian recovery sessions by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let files_by_health = IntGaugeVec::new(
            Opts::new("files_by_health", "Monitored files per health status").namespace(NAMESPACE),
            &["status"],
        )?;
        let guardians_online = IntGauge::with_opts(
            Opts::new("guardians_online", "Vault guardians answering health pings").namespace(NAMESPACE),
        )?;
        let audits = IntCounterVec::new(
            Opts::new("audits_total", "Replica audits by result").namespace(NAMESPACE),
            &["result"],
        )?;

        registry.register(Box::new(shards_stored.clone()))?;
        registry.register(Box::new(repairs.clone()))?;
        registry.register(Box::new(repair_duration.clone()))?;
        registry.register(Box::new(recoveries.clone()))?;
        registry.register(Box::new(files_by_health.clone()))?;
        registry.register(Box::new(guardians_online.clone()))?;
        registry.register(Box::new(audits.clone()))?;

        // Export every status at zero from the start
        for status in HealthStatus::ALL {
            files_by_health.with_label_values(&[status.as_str()]).set(0);
        }

        Ok(Self {
            registry,
            shards_stored,
            repairs,
            repair_duration,
            recoveries,
            files_by_health,
            guardians_online,
            audits,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_shards_stored(&self, count: usize) {
        self.shards_stored.inc_by(count as u64);
    }

    pub fn shards_stored(&self) -> u64 {
        self.shards_stored.get()
    }

    /// Record a finished repair job. `outcome` is completed, failed or cancelled.
    pub fn record_repair(&self, outcome: &str, duration: Duration) {
        self.repairs.with_label_values(&[outcome]).inc();
        self.repair_duration.observe(duration.as_secs_f64());
    }

    pub fn repairs(&self, outcome: &str) -> u64 {
        self.repairs.with_label_values(&[outcome]).get()
    }

    /// Record a finished recovery. `outcome` is completed, expired or failed.
    pub fn record_recovery(&self, outcome: &str) {
        self.recoveries.with_label_values(&[outcome]).inc();
    }

    pub fn recoveries(&self, outcome: &str) -> u64 {
        self.recoveries.with_label_values(&[outcome]).get()
    }

    /// Move one file between health buckets.
    pub fn record_health_transition(&self, previous: Option<HealthStatus>, current: Option<HealthStatus>) {
        if let Some(prev) = previous {
            self.files_by_health.with_label_values(&[prev.as_str()]).dec();
        }
        if let Some(cur) = current {
            self.files_by_health.with_label_values(&[cur.as_str()]).inc();
        }
    }

    pub fn files_with_health(&self, status: HealthStatus) -> i64 {
        self.files_by_health.with_label_values(&[status.as_str()]).get()
    }

    pub fn set_guardians_online(&self, count: usize) {
        self.guardians_online.set(count as i64);
    }

    pub fn record_audit(&self, passed: bool) {
        let result = if passed { "passed" } else { "failed" };
        self.audits.with_label_values(&[result]).inc();
    }

    /// Prometheus text exposition of every instrument.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::error::Error::Internal(format!("metrics encoding: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        let a = EngineMetrics::new().unwrap();
        let b = EngineMetrics::new().unwrap();

        a.record_shards_stored(3);
        assert_eq!(a.shards_stored(), 3);
        assert_eq!(b.shards_stored(), 0);
    }

    #[test]
    fn test_health_transitions() {
        let m = EngineMetrics::new().unwrap();
        m.record_health_transition(None, Some(HealthStatus::Healthy));
        m.record_health_transition(Some(HealthStatus::Healthy), Some(HealthStatus::Degraded));

        assert_eq!(m.files_with_health(HealthStatus::Healthy), 0);
        assert_eq!(m.files_with_health(HealthStatus::Degraded), 1);

        m.record_health_transition(Some(HealthStatus::Degraded), None);
        assert_eq!(m.files_with_health(HealthStatus::Degraded), 0);
    }

    #[test]
    fn test_render() {
        let m = EngineMetrics::new().unwrap();
        m.record_repair("completed", Duration::from_millis(250));
        m.record_recovery("expired");
        m.record_audit(false);
        m.set_guardians_online(4);

        let text = m.render().unwrap();
        assert!(text.contains("shardwarden_repairs_total{outcome=\"completed\"} 1"));
        assert!(text.contains("shardwarden_recoveries_total{outcome=\"expired\"} 1"));
        assert!(text.contains("shardwarden_guardians_online 4"));
        assert!(text.contains("shardwarden_files_by_health{status=\"failed\"} 0"));
        assert_eq!(m.repairs("completed"), 1);
    }
}
